//! Recall and proposal-quality bookkeeping against ground truth.
//!
//! Scenes without ground truth are skipped entirely: they add nothing to any
//! counter, including `valid_sample_num`. Accumulation is a fold of per-scene
//! values in scene order.

use std::str::FromStr;

use ndarray::{Array2, ArrayView2, Axis};

use crate::geometry::iou::{boxes_iou3d, boxes_iou_bev};
use crate::geometry::row_is_valid;
use crate::util::math::sigmoid;
use crate::util::{BoxRefineError, BoxRefineResult};

const LOOSE_IOU: f32 = 0.5;
const STRICT_IOU: f32 = 0.7;
const RANK_GAP: f32 = 1e-3;

/// Overlap measure used for recall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecallIou {
    #[default]
    ThreeD,
    Bev,
}

impl FromStr for RecallIou {
    type Err = BoxRefineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3d" => Ok(RecallIou::ThreeD),
            "bev" => Ok(RecallIou::Bev),
            other => Err(BoxRefineError::unsupported("recall iou", other)),
        }
    }
}

impl RecallIou {
    fn matrix(self, a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>) -> BoxRefineResult<Array2<f32>> {
        match self {
            RecallIou::ThreeD => boxes_iou3d(a, b),
            RecallIou::Bev => boxes_iou_bev(a, b),
        }
    }
}

/// Running recall counters and quality sums for one batch.
///
/// Divide sums by the relevant sample count for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecallDict {
    /// Ground-truth boxes seen.
    pub gt: usize,
    /// Ground-truth boxes whose best proposal IoU exceeds 0.5.
    pub roi_05: usize,
    /// Ground-truth boxes whose best proposal IoU exceeds 0.7.
    pub roi_07: usize,
    /// Ground-truth boxes whose best refined-box IoU exceeds 0.5.
    pub rcnn_05: usize,
    /// Ground-truth boxes whose best refined-box IoU exceeds 0.7.
    pub rcnn_07: usize,
    /// Sum of per-scene pairwise rank accuracies.
    pub rcnn_rank_acc: f64,
    /// Sum of per-scene mean |sigmoid(logit) - IoU|.
    pub rcnn_iou_diff: f64,
    /// Scenes where some refined box overlaps ground truth.
    pub valid_sample_num: usize,
}

impl RecallDict {
    /// Adds one scene's contribution.
    pub fn add(&mut self, scene: &SceneRecall) {
        self.merge(&scene.counts);
    }

    /// Adds another accumulator.
    pub fn merge(&mut self, other: &RecallDict) {
        self.gt += other.gt;
        self.roi_05 += other.roi_05;
        self.roi_07 += other.roi_07;
        self.rcnn_05 += other.rcnn_05;
        self.rcnn_07 += other.rcnn_07;
        self.rcnn_rank_acc += other.rcnn_rank_acc;
        self.rcnn_iou_diff += other.rcnn_iou_diff;
        self.valid_sample_num += other.valid_sample_num;
    }
}

/// One scene's recall contribution and per-prediction ground-truth IoU.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneRecall {
    pub counts: RecallDict,
    /// Best ground-truth IoU of each refined box.
    pub gt_iou: Vec<f32>,
}

/// Drops zero-sized padding rows from a ground-truth array.
pub fn valid_gt(gt: ArrayView2<'_, f32>) -> Array2<f32> {
    let keep: Vec<usize> = gt
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, row)| row_is_valid(*row))
        .map(|(i, _)| i)
        .collect();
    gt.select(Axis(0), &keep)
}

fn count_recalled(iou: &Array2<f32>, gt_count: usize) -> (usize, usize) {
    let mut loose = 0;
    let mut strict = 0;
    for g in 0..gt_count {
        let best = iou.column(g).iter().copied().fold(0.0f32, f32::max);
        if best > LOOSE_IOU {
            loose += 1;
        }
        if best > STRICT_IOU {
            strict += 1;
        }
    }
    (loose, strict)
}

/// Fraction of pairs whose predicted order agrees with the ground-truth IoU
/// order, over pairs with a non-negligible IoU gap.
pub fn rank_accuracy(pred: &[f32], gt_iou: &[f32]) -> f32 {
    let mut agree = 0usize;
    let mut masked = 0usize;
    for (i, (&pi, &gi)) in pred.iter().zip(gt_iou).enumerate() {
        for (&pj, &gj) in pred.iter().zip(gt_iou).skip(i + 1) {
            for (dp, dg) in [(pi - pj, gi - gj), (pj - pi, gj - gi)] {
                if dg.abs() > RANK_GAP {
                    masked += 1;
                    if (dp > 0.0) == (dg > 0.0) {
                        agree += 1;
                    }
                }
            }
        }
    }
    agree as f32 / (masked as f32).max(1.0)
}

/// Computes recall contributions against ground truth.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecallTracker {
    iou: RecallIou,
}

impl RecallTracker {
    /// Creates a tracker using the given overlap measure.
    pub fn new(iou: RecallIou) -> Self {
        Self { iou }
    }

    /// Recall of proposals and refined boxes for one scene.
    ///
    /// `logits` are the raw confidences of the refined boxes. Rank accuracy
    /// uses them directly and the IoU gap uses `sigmoid(logit)` whatever the
    /// score mode. Returns `None` when the scene has no valid ground truth.
    pub fn evaluate_rcnn(
        &self,
        rois: ArrayView2<'_, f32>,
        refined: ArrayView2<'_, f32>,
        logits: &[f32],
        gt: ArrayView2<'_, f32>,
    ) -> BoxRefineResult<Option<SceneRecall>> {
        if refined.nrows() != logits.len() {
            return Err(BoxRefineError::shape(
                "recall logits",
                &[refined.nrows()],
                &[logits.len()],
            ));
        }
        let gt = valid_gt(gt);
        let gt_count = gt.nrows();
        if gt_count == 0 {
            return Ok(None);
        }

        let iou_roi = self.iou.matrix(rois, gt.view())?;
        let iou_rcnn = self.iou.matrix(refined, gt.view())?;
        let (roi_05, roi_07) = count_recalled(&iou_roi, gt_count);
        let (rcnn_05, rcnn_07) = count_recalled(&iou_rcnn, gt_count);

        let gt_iou: Vec<f32> = iou_rcnn
            .rows()
            .into_iter()
            .map(|row| row.iter().copied().fold(0.0f32, f32::max))
            .collect();

        let mut counts = RecallDict {
            gt: gt_count,
            roi_05,
            roi_07,
            rcnn_05,
            rcnn_07,
            ..RecallDict::default()
        };
        if !gt_iou.is_empty() {
            counts.rcnn_rank_acc = f64::from(rank_accuracy(logits, &gt_iou));
            let max_iou = gt_iou.iter().copied().fold(0.0f32, f32::max);
            counts.valid_sample_num = usize::from(max_iou > 0.0);
            let diff: f32 = logits
                .iter()
                .zip(&gt_iou)
                .map(|(&l, g)| (sigmoid(l) - g).abs())
                .sum();
            counts.rcnn_iou_diff = f64::from(diff / gt_iou.len() as f32);
        }

        Ok(Some(SceneRecall { counts, gt_iou }))
    }

    /// Recall of first-stage detections for one scene (`gt`, `roi_05`, `roi_07`).
    pub fn evaluate_rpn(
        &self,
        boxes: ArrayView2<'_, f32>,
        gt: ArrayView2<'_, f32>,
    ) -> BoxRefineResult<Option<SceneRecall>> {
        let gt = valid_gt(gt);
        let gt_count = gt.nrows();
        if gt_count == 0 {
            return Ok(None);
        }
        let iou = self.iou.matrix(boxes, gt.view())?;
        let (roi_05, roi_07) = count_recalled(&iou, gt_count);
        Ok(Some(SceneRecall {
            counts: RecallDict {
                gt: gt_count,
                roi_05,
                roi_07,
                ..RecallDict::default()
            },
            gt_iou: Vec::new(),
        }))
    }
}
