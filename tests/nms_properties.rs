use boxrefine::{nms_rotated, soft_nms_rotated, NmsConfig, NmsKind, SoftDecay};
use ndarray::{arr2, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_scene(rng: &mut StdRng, n: usize) -> (Array2<f32>, Vec<f32>) {
    let boxes = Array2::from_shape_fn((n, 7), |(_, k)| match k {
        0 | 1 => rng.random_range(-10.0..10.0),
        2 => 0.0,
        3 => rng.random_range(2.0..5.0),
        4 => rng.random_range(1.0..2.5),
        5 => 1.5,
        _ => rng.random_range(-3.0..3.0),
    });
    let scores = (0..n).map(|_| rng.random_range(0.0..1.0)).collect();
    (boxes, scores)
}

#[test]
fn hard_nms_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..8 {
        let (boxes, scores) = random_scene(&mut rng, 40);
        let keep = nms_rotated(boxes.view(), &scores, 0.3).unwrap();
        let kept_boxes = boxes.select(Axis(0), &keep);
        let kept_scores: Vec<f32> = keep.iter().map(|&i| scores[i]).collect();
        let again = nms_rotated(kept_boxes.view(), &kept_scores, 0.3).unwrap();
        assert_eq!(again, (0..keep.len()).collect::<Vec<_>>());
    }
}

#[test]
fn heavily_overlapping_lower_box_is_dropped() {
    // shift of 10/19 along a length-10 box gives iou 0.9
    let boxes = arr2(&[
        [0.0f32, 0.0, 0.0, 10.0, 2.0, 1.5, 0.0],
        [10.0 / 19.0, 0.0, 0.0, 10.0, 2.0, 1.5, 0.0],
    ]);
    let keep = nms_rotated(boxes.view(), &[0.9, 0.8], 0.5).unwrap();
    assert_eq!(keep, vec![0]);
    let keep = nms_rotated(boxes.view(), &[0.9, 0.8], 0.95).unwrap();
    assert_eq!(keep, vec![0, 1]);
}

#[test]
fn empty_input_selects_nothing() {
    let boxes = Array2::<f32>::zeros((0, 7));
    assert!(nms_rotated(boxes.view(), &[], 0.5).unwrap().is_empty());
    let soft = soft_nms_rotated(boxes.view(), &[], SoftDecay::Gaussian { sigma: 0.5 }, 0.1, 10).unwrap();
    assert!(soft.keep.is_empty());
    let cfg = NmsConfig {
        kind: NmsKind::SoftRotated {
            decay: SoftDecay::Linear { nt: 0.3 },
            score_thresh: 0.1,
        },
        ..NmsConfig::default()
    };
    let sel = cfg.select(boxes.view(), &[]).unwrap();
    assert!(sel.indices.is_empty());
}

#[test]
fn soft_nms_never_raises_scores() {
    let mut rng = StdRng::seed_from_u64(5);
    for decay in [SoftDecay::Linear { nt: 0.2 }, SoftDecay::Gaussian { sigma: 0.3 }] {
        let (boxes, scores) = random_scene(&mut rng, 50);
        let res = soft_nms_rotated(boxes.view(), &scores, decay, 0.05, 50).unwrap();
        assert_eq!(res.keep.len(), res.scores.len());
        for (&idx, &score) in res.keep.iter().zip(&res.scores) {
            assert!(score <= scores[idx] + 1e-6);
            assert!(score >= 0.05);
        }
        let mut unique = res.keep.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), res.keep.len());
    }
}

#[test]
fn selection_never_exceeds_pre_maxsize() {
    let mut rng = StdRng::seed_from_u64(9);
    let (boxes, raw) = random_scene(&mut rng, 60);
    for kind in [
        NmsKind::Rotated { thresh: 0.9 },
        NmsKind::SoftRotated {
            decay: SoftDecay::Gaussian { sigma: 0.5 },
            score_thresh: 0.0,
        },
    ] {
        let cfg = NmsConfig {
            kind,
            pre_maxsize: 12,
            post_maxsize: 100,
            max_objects_per_scene: 100,
        };
        let sel = cfg.select(boxes.view(), &raw).unwrap();
        assert!(!sel.indices.is_empty());
        assert!(sel.indices.len() <= 12);
        if let Some(decayed) = sel.decayed_scores.as_ref() {
            assert_eq!(decayed.len(), sel.indices.len());
        }
    }
}
