use boxrefine::{PredictConfig, PredictionAssembler, RcnnScoreMode, RecallIou, RecallTracker, RoiBatch};
use ndarray::{s, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn jitter(rng: &mut StdRng, boxes: &Array3<f32>, scale: f32) -> Array3<f32> {
    let mut out = boxes.clone();
    for ((_, _, k), v) in out.indexed_iter_mut() {
        if k < 3 {
            *v += rng.random_range(-scale..scale);
        }
    }
    out
}

fn random_gt(rng: &mut StdRng, batch: usize, g: usize) -> Array3<f32> {
    Array3::from_shape_fn((batch, g, 7), |(_, i, k)| match k {
        0 => i as f32 * 12.0 + rng.random_range(-1.0..1.0),
        1 => rng.random_range(-5.0..5.0),
        3 => rng.random_range(3.0..5.0),
        4 => rng.random_range(1.5..2.0),
        5 => 1.5,
        6 => rng.random_range(-1.0..1.0),
        _ => 0.0,
    })
}

fn rois_from(boxes: Array3<f32>) -> RoiBatch {
    let (b, n, _) = boxes.dim();
    RoiBatch {
        rois: boxes,
        roi_raw_scores: Array2::ones((b, n)),
        roi_scores: Array2::from_elem((b, n), 0.73),
        roi_labels: Array2::ones((b, n)),
        num_valid: vec![n; b],
    }
}

#[test]
fn loose_recall_dominates_strict_recall() {
    let mut rng = StdRng::seed_from_u64(21);
    let assembler = PredictionAssembler::new(PredictConfig {
        score_thresh: 0.0,
        ..PredictConfig::default()
    })
    .unwrap();
    for scale in [0.1f32, 0.5, 1.0, 2.0] {
        let gt = random_gt(&mut rng, 3, 4);
        let rois = rois_from(jitter(&mut rng, &gt, scale));
        let refined = jitter(&mut rng, &gt, scale * 0.5);
        let logits = Array2::from_shape_fn((3, 4), |_| rng.random_range(-2.0f32..2.0));
        let out = assembler
            .predict_rcnn(logits.view(), refined.view(), &rois, Some(gt.view()))
            .unwrap();
        let r = out.recall;
        assert_eq!(r.gt, 12);
        assert!(r.roi_05 >= r.roi_07);
        assert!(r.rcnn_05 >= r.rcnn_07);
        assert!(r.roi_05 <= r.gt && r.rcnn_05 <= r.gt);
        assert!(r.valid_sample_num <= 3);
    }
}

#[test]
fn scenes_without_ground_truth_contribute_nothing() {
    let mut rng = StdRng::seed_from_u64(4);
    let assembler = PredictionAssembler::new(PredictConfig {
        score_thresh: 0.0,
        ..PredictConfig::default()
    })
    .unwrap();
    let mut gt = random_gt(&mut rng, 2, 3);
    gt.slice_mut(s![1, .., ..]).fill(0.0);
    let mut proposals = jitter(&mut rng, &gt, 0.3);
    let mut refined = jitter(&mut rng, &gt, 0.3);
    let first_proposals = proposals.slice(s![0, .., ..]).to_owned();
    proposals.slice_mut(s![1, .., ..]).assign(&first_proposals);
    let first_refined = refined.slice(s![0, .., ..]).to_owned();
    refined.slice_mut(s![1, .., ..]).assign(&first_refined);
    let rois = rois_from(proposals);
    let logits = Array2::from_shape_fn((2, 3), |_| rng.random_range(-2.0f32..2.0));
    let both = assembler
        .predict_rcnn(logits.view(), refined.view(), &rois, Some(gt.view()))
        .unwrap();

    let first = RoiBatch {
        rois: rois.rois.slice(s![..1, .., ..]).to_owned(),
        roi_raw_scores: rois.roi_raw_scores.slice(s![..1, ..]).to_owned(),
        roi_scores: rois.roi_scores.slice(s![..1, ..]).to_owned(),
        roi_labels: rois.roi_labels.slice(s![..1, ..]).to_owned(),
        num_valid: vec![3],
    };
    let alone = assembler
        .predict_rcnn(
            logits.slice(s![..1, ..]),
            refined.slice(s![..1, .., ..]),
            &first,
            Some(gt.slice(s![..1, .., ..])),
        )
        .unwrap();
    assert_eq!(both.recall, alone.recall);
    assert_eq!(both.recall.gt, 3);
    assert_eq!(both.scenes[1].len(), 3);
    assert!(both.scenes[1].iter().all(|p| p.roi.as_ref().is_some_and(|r| r.gt_iou.is_none())));
}

#[test]
fn bev_recall_ignores_height() {
    let tracker = RecallTracker::new(RecallIou::Bev);
    let gt = Array2::from_shape_vec((1, 7), vec![0.0f32, 0.0, 0.0, 4.0, 2.0, 1.5, 0.0]).unwrap();
    let lifted = Array2::from_shape_vec((1, 7), vec![0.0f32, 0.0, 5.0, 4.0, 2.0, 1.5, 0.0]).unwrap();
    let scene = tracker
        .evaluate_rcnn(lifted.view(), lifted.view(), &[1.0], gt.view())
        .unwrap()
        .unwrap();
    assert_eq!(scene.counts.roi_07, 1);

    let tracker = RecallTracker::new(RecallIou::ThreeD);
    let scene = tracker
        .evaluate_rcnn(lifted.view(), lifted.view(), &[1.0], gt.view())
        .unwrap()
        .unwrap();
    assert_eq!(scene.counts.roi_05, 0);
    assert_eq!(scene.counts.valid_sample_num, 0);
}

#[test]
fn iou_gap_uses_sigmoid_of_logit_in_regression_mode() {
    let assembler = PredictionAssembler::new(PredictConfig {
        score_thresh: 0.0,
        rcnn_score: RcnnScoreMode::IouRegression,
        ..PredictConfig::default()
    })
    .unwrap();
    let gt = Array3::from_shape_vec((1, 1, 7), vec![0.0f32, 0.0, 0.0, 4.0, 2.0, 1.5, 0.0]).unwrap();
    let rois = rois_from(gt.clone());
    let logits = Array2::from_elem((1, 1), 2.0f32);
    let out = assembler
        .predict_rcnn(logits.view(), gt.view(), &rois, Some(gt.view()))
        .unwrap();
    // clamped score is 1.0 but the gap is 1 - sigmoid(2)
    assert_eq!(out.scenes[0][0].score, 1.0);
    assert!((out.recall.rcnn_iou_diff - 0.119_203).abs() < 1e-4);
    assert_eq!(out.recall.valid_sample_num, 1);
}
