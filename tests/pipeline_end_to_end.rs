use boxrefine::{
    DetectorConfig, DirectionConfig, PostProcessor, ProposalConfig, ProposalMode, ProposalStage,
    RcnnOutput, RpnOutput,
};
use ndarray::{arr2, arr3, Array2, Array3};

fn anchors() -> Array3<f32> {
    arr3(&[[
        [0.0f32, 0.0, -1.0, 3.9, 1.6, 1.56, 0.3],
        [10.0, 0.0, -1.0, 3.9, 1.6, 1.56, 0.3],
        [20.0, 5.0, -1.0, 3.9, 1.6, 1.56, 0.3],
    ]])
}

fn post_processor() -> PostProcessor {
    let stage = ProposalStage {
        pre_nms_top_n: 100,
        post_nms_top_n: 4,
        nms_thresh: 0.7,
        score_thresh: 0.1,
    };
    PostProcessor::new(DetectorConfig {
        direction: Some(DirectionConfig {
            num_bins: 2,
            dir_offset: 0.0,
            dir_limit_offset: 0.0,
        }),
        proposal: ProposalConfig {
            train: stage,
            test: stage,
            ..ProposalConfig::default()
        },
        ..DetectorConfig::default()
    })
    .unwrap()
}

fn rpn_inputs() -> (Array3<f32>, Array3<f32>, Array3<f32>) {
    let cls = arr3(&[[[3.0f32], [-5.0], [2.0]]]);
    let deltas = Array3::zeros((1, 3, 7));
    let dir = arr3(&[[[1.0f32, -1.0], [1.0, -1.0], [1.0, -1.0]]]);
    (cls, deltas, dir)
}

fn ground_truth() -> Array3<f32> {
    arr3(&[[
        [0.0f32, 0.0, -1.0, 3.9, 1.6, 1.56, 0.3],
        [20.0, 5.0, -1.0, 3.9, 1.6, 1.56, 0.3],
        [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    ]])
}

#[test]
fn two_stage_detection_recovers_ground_truth() {
    let post = post_processor();
    let anchors = anchors();
    let (cls, deltas, dir) = rpn_inputs();
    let rpn = RpnOutput {
        cls_preds: cls.view(),
        box_preds: deltas.view(),
        dir_cls_preds: Some(dir.view()),
    };

    let rois = post.propose(anchors.view(), rpn, ProposalMode::Test).unwrap();
    assert_eq!(rois.num_valid, vec![2]);
    assert_eq!(rois.rois[[0, 0, 0]], 0.0);
    assert_eq!(rois.rois[[0, 1, 0]], 20.0);
    assert!((rois.rois[[0, 0, 6]] - 0.3).abs() < 1e-5);

    let rcnn_cls: Array2<f32> = arr2(&[[2.0f32, 1.0, 0.0, 0.0]]);
    let rcnn_reg = Array3::<f32>::zeros((1, 4, 7));
    let gt = ground_truth();
    let out = post
        .predict_rcnn(
            &rois,
            RcnnOutput {
                cls_preds: rcnn_cls.view(),
                box_preds: rcnn_reg.view(),
            },
            Some(gt.view()),
        )
        .unwrap();

    assert_eq!(out.scenes[0].len(), 2);
    for pred in &out.scenes[0] {
        assert_eq!(post.class_name(pred.label), Some("Car"));
        let gt_iou = pred.roi.as_ref().and_then(|r| r.gt_iou).unwrap();
        assert!((gt_iou - 1.0).abs() < 1e-4);
    }
    let recall = out.recall;
    assert_eq!(recall.gt, 2);
    assert_eq!(recall.roi_07, 2);
    assert_eq!(recall.rcnn_07, 2);
    assert_eq!(recall.valid_sample_num, 1);
}

#[test]
fn single_stage_detection_reports_recall() {
    let post = post_processor();
    let anchors = anchors();
    let (cls, deltas, dir) = rpn_inputs();
    let gt = ground_truth();
    let out = post
        .predict_rpn(
            anchors.view(),
            RpnOutput {
                cls_preds: cls.view(),
                box_preds: deltas.view(),
                dir_cls_preds: Some(dir.view()),
            },
            Some(gt.view()),
        )
        .unwrap();
    let xs: Vec<f32> = out.scenes[0].iter().map(|p| p.bbox.x).collect();
    assert_eq!(xs, vec![0.0, 20.0]);
    assert_eq!(out.recall.gt, 2);
    assert_eq!(out.recall.roi_07, 2);
    assert_eq!(out.recall.rcnn_05, 0);
}

#[test]
fn direction_bin_flips_heading() {
    let post = post_processor();
    let anchors = anchors();
    let deltas = Array3::<f32>::zeros((1, 3, 7));
    let dir = arr3(&[[[-1.0f32, 1.0], [1.0, -1.0], [1.0, -1.0]]]);
    let boxes = post
        .decode_rpn(anchors.view(), deltas.view(), Some(dir.view()))
        .unwrap();
    assert!((boxes[[0, 0, 6]] - (0.3 + std::f32::consts::PI)).abs() < 1e-5);
    assert!((boxes[[0, 1, 6]] - 0.3).abs() < 1e-5);
}
