#![cfg(feature = "rayon")]

use boxrefine::{
    NmsConfig, NmsKind, PredictConfig, PredictionAssembler, ProposalConfig, ProposalLayer,
    ProposalMode, SoftDecay,
};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_batch(rng: &mut StdRng, batch: usize, n: usize) -> (Array3<f32>, Array3<f32>) {
    let boxes = Array3::from_shape_fn((batch, n, 7), |(_, _, k)| match k {
        0 | 1 => rng.random_range(-30.0..30.0),
        2 => rng.random_range(-2.0..0.0),
        3 => rng.random_range(3.0..4.5),
        4 => rng.random_range(1.5..2.0),
        5 => 1.5,
        _ => rng.random_range(-3.0..3.0),
    });
    let cls = Array3::from_shape_fn((batch, n, 1), |_| rng.random_range(-3.0f32..3.0));
    (boxes, cls)
}

#[test]
fn parallel_proposals_match_sequential() {
    let mut rng = StdRng::seed_from_u64(99);
    let (boxes, cls) = random_batch(&mut rng, 6, 300);
    let seq = ProposalLayer::new(ProposalConfig::default()).unwrap();
    let par = ProposalLayer::new(ProposalConfig {
        parallel: true,
        ..ProposalConfig::default()
    })
    .unwrap();
    let a = seq.propose(cls.view(), boxes.view(), ProposalMode::Train).unwrap();
    let b = par.propose(cls.view(), boxes.view(), ProposalMode::Train).unwrap();
    assert_eq!(a, b);
}

#[test]
fn parallel_predictions_match_sequential() {
    let mut rng = StdRng::seed_from_u64(7);
    let (boxes, cls) = random_batch(&mut rng, 5, 200);
    let (gt, _) = random_batch(&mut rng, 5, 20);
    let base = PredictConfig {
        nms: NmsConfig {
            kind: NmsKind::SoftRotated {
                decay: SoftDecay::Gaussian { sigma: 0.5 },
                score_thresh: 0.05,
            },
            ..NmsConfig::default()
        },
        ..PredictConfig::default()
    };
    let seq = PredictionAssembler::new(base).unwrap();
    let par = PredictionAssembler::new(PredictConfig {
        parallel: true,
        ..base
    })
    .unwrap();
    let a = seq.predict_rpn(cls.view(), boxes.view(), Some(gt.view())).unwrap();
    let b = par.predict_rpn(cls.view(), boxes.view(), Some(gt.view())).unwrap();
    assert_eq!(a, b);

    let logits = Array2::from_shape_fn((5, 100), |_| rng.random_range(-3.0f32..3.0));
    let rois_layer = ProposalLayer::new(ProposalConfig::default()).unwrap();
    let rois = rois_layer.propose(cls.view(), boxes.view(), ProposalMode::Test).unwrap();
    let refined = rois.rois.clone();
    let a = seq
        .predict_rcnn(logits.view(), refined.view(), &rois, Some(gt.view()))
        .unwrap();
    let b = par
        .predict_rcnn(logits.view(), refined.view(), &rois, Some(gt.view()))
        .unwrap();
    assert_eq!(a, b);
}
