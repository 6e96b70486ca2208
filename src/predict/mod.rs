//! Final per-scene detections from RPN or RCNN outputs.
//!
//! RPN mode scores dense anchors and selects boxes per class or on the best
//! class of each anchor. RCNN mode scores refined proposals, inherits the
//! proposal labels and attaches the source proposal to every record.
//! Ground truth, when supplied, feeds a [`RecallDict`] for the batch.

use std::str::FromStr;

use ndarray::{s, ArrayView2, ArrayView3, Axis};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::candidate::nms::{NmsConfig, NmsKind, Selection};
use crate::geometry::{check_paired_3d, row_is_valid, Box3d, BOX_DIM};
use crate::proposal::RoiBatch;
use crate::scoring::ScoreConfig;
use crate::trace::{trace_event, trace_span};
use crate::util::math::sigmoid;
use crate::util::{BoxRefineError, BoxRefineResult};

pub mod recall;

pub use recall::{RecallDict, RecallIou, RecallTracker, SceneRecall};

/// How second-stage logits become confidences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RcnnScoreMode {
    /// Classification logits; `sigmoid(logit)`.
    #[default]
    Sigmoid,
    /// Direct IoU regression; the value clamped to `[0, 1]`.
    IouRegression,
}

impl FromStr for RcnnScoreMode {
    type Err = BoxRefineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary-cross-entropy" | "bce" => Ok(RcnnScoreMode::Sigmoid),
            "smooth-l1" => Ok(RcnnScoreMode::IouRegression),
            other => Err(BoxRefineError::unsupported("rcnn score mode", other)),
        }
    }
}

impl RcnnScoreMode {
    /// Confidence of one logit.
    pub fn score(self, logit: f32) -> f32 {
        match self {
            RcnnScoreMode::Sigmoid => sigmoid(logit),
            RcnnScoreMode::IouRegression => logit.clamp(0.0, 1.0),
        }
    }
}

/// Prediction assembly configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PredictConfig {
    pub score: ScoreConfig,
    /// Minimum calibrated score of a candidate.
    pub score_thresh: f32,
    /// Selection used on the best-class path and in RCNN mode.
    pub nms: NmsConfig,
    /// IoU threshold for per-class hard NMS.
    pub multi_class_nms_thresh: f32,
    /// Number of foreground classes.
    pub num_classes: usize,
    pub rcnn_score: RcnnScoreMode,
    pub recall_iou: RecallIou,
    /// Process scenes in parallel (requires the `rayon` feature).
    pub parallel: bool,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            score: ScoreConfig::default(),
            score_thresh: 0.1,
            nms: NmsConfig::default(),
            multi_class_nms_thresh: 0.1,
            num_classes: 1,
            rcnn_score: RcnnScoreMode::default(),
            recall_iou: RecallIou::default(),
            parallel: false,
        }
    }
}

/// Source proposal of an RCNN prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiRecord {
    pub roi: Box3d,
    pub raw_score: f32,
    /// Best ground-truth IoU of the refined box, when ground truth was given.
    pub gt_iou: Option<f32>,
}

/// One detection.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub bbox: Box3d,
    /// 1-based class label.
    pub label: usize,
    pub score: f32,
    pub raw_score: f32,
    pub roi: Option<RoiRecord>,
}

/// Detections per scene plus recall for the batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchPredictions {
    pub scenes: Vec<Vec<Prediction>>,
    pub recall: RecallDict,
}

impl BatchPredictions {
    /// Total number of detections.
    pub fn len(&self) -> usize {
        self.scenes.iter().map(Vec::len).sum()
    }

    /// Returns true when no scene has a detection.
    pub fn is_empty(&self) -> bool {
        self.scenes.iter().all(Vec::is_empty)
    }
}

type SceneOutput = (Vec<Prediction>, Option<SceneRecall>);

/// Candidate fields needed to build a record after selection.
struct Candidate {
    index: usize,
    score: f32,
    raw: f32,
    label: usize,
}

/// Assembles detections from decoded boxes and logits.
#[derive(Clone, Copy, Debug)]
pub struct PredictionAssembler {
    cfg: PredictConfig,
    tracker: RecallTracker,
}

impl PredictionAssembler {
    /// Creates an assembler after validating the config.
    pub fn new(cfg: PredictConfig) -> BoxRefineResult<Self> {
        cfg.score.validate()?;
        if cfg.num_classes == 0 {
            return Err(BoxRefineError::InvalidConfig {
                reason: "num_classes must be > 0",
            });
        }
        if cfg.nms.pre_maxsize == 0 || cfg.nms.post_maxsize == 0 {
            return Err(BoxRefineError::InvalidConfig {
                reason: "nms caps must be > 0",
            });
        }
        cfg.nms.kind.validate()?;
        Ok(Self {
            cfg,
            tracker: RecallTracker::new(cfg.recall_iou),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PredictConfig {
        &self.cfg
    }

    /// Detections from `(B, A, C')` logits and `(B, A, 7+)` decoded boxes.
    ///
    /// With `gt` of shape `(B, G, 7+)` the recall of the detections is
    /// accumulated into `roi_05` and `roi_07`.
    pub fn predict_rpn(
        &self,
        cls_preds: ArrayView3<'_, f32>,
        box_preds: ArrayView3<'_, f32>,
        gt: Option<ArrayView3<'_, f32>>,
    ) -> BoxRefineResult<BatchPredictions> {
        check_paired_3d("rpn predictions", box_preds, cls_preds)?;
        check_width("rpn boxes", box_preds)?;
        check_gt(gt, box_preds.len_of(Axis(0)))?;
        let batch = box_preds.len_of(Axis(0));
        let _span = trace_span!("predict", stage = "rpn", batch = batch).entered();

        let run = |scene: usize| {
            self.rpn_scene(
                cls_preds.index_axis(Axis(0), scene),
                box_preds.index_axis(Axis(0), scene),
                gt.map(|g| g.index_axis_move(Axis(0), scene)),
            )
        };
        let per_scene = self.run_scenes(batch, &run)?;
        Ok(fold_scenes(per_scene))
    }

    /// Detections from `(B, N)` second-stage logits, `(B, N, 7+)` refined
    /// boxes and the proposals they were refined from.
    ///
    /// Only the valid proposal slots are considered. Records whose proposal
    /// has zero size are dropped.
    pub fn predict_rcnn(
        &self,
        rcnn_cls: ArrayView2<'_, f32>,
        boxes: ArrayView3<'_, f32>,
        rois: &RoiBatch,
        gt: Option<ArrayView3<'_, f32>>,
    ) -> BoxRefineResult<BatchPredictions> {
        let (batch, slots, _) = boxes.dim();
        check_width("rcnn boxes", boxes)?;
        if rcnn_cls.dim() != (batch, slots) {
            return Err(BoxRefineError::shape(
                "rcnn logits",
                &[batch, slots],
                &[rcnn_cls.nrows(), rcnn_cls.ncols()],
            ));
        }
        check_paired_3d("rcnn rois", boxes, rois.rois.view())?;
        if rois.num_valid.len() != batch || rois.num_valid.iter().any(|&n| n > slots) {
            return Err(BoxRefineError::shape(
                "roi valid counts",
                &[batch],
                &[rois.num_valid.len()],
            ));
        }
        check_gt(gt, batch)?;
        let _span = trace_span!("predict", stage = "rcnn", batch = batch).entered();

        let run = |scene: usize| {
            self.rcnn_scene(
                scene,
                rcnn_cls.row(scene).to_vec(),
                boxes.index_axis(Axis(0), scene),
                rois,
                gt.map(|g| g.index_axis_move(Axis(0), scene)),
            )
        };
        let per_scene = self.run_scenes(batch, &run)?;
        Ok(fold_scenes(per_scene))
    }

    fn run_scenes<F>(&self, batch: usize, run: &F) -> BoxRefineResult<Vec<SceneOutput>>
    where
        F: Fn(usize) -> BoxRefineResult<SceneOutput> + Sync,
    {
        #[cfg(feature = "rayon")]
        {
            if self.cfg.parallel {
                return (0..batch).into_par_iter().map(run).collect();
            }
        }

        (0..batch).map(run).collect()
    }

    fn rpn_scene(
        &self,
        cls: ArrayView2<'_, f32>,
        boxes: ArrayView2<'_, f32>,
        gt: Option<ArrayView2<'_, f32>>,
    ) -> BoxRefineResult<SceneOutput> {
        let scores = self.cfg.score.score(cls, self.cfg.num_classes)?;
        let thresh = self.cfg.score_thresh;
        let mut preds = Vec::new();

        if self.cfg.score.use_multi_classes_nms {
            let nms = NmsConfig {
                kind: NmsKind::Rotated {
                    thresh: self.cfg.multi_class_nms_thresh,
                },
                ..self.cfg.nms
            };
            for k in 0..self.cfg.num_classes {
                let cands: Vec<Candidate> = scores
                    .scores
                    .column(k)
                    .iter()
                    .zip(scores.raw.column(k))
                    .enumerate()
                    .filter(|(_, (&score, _))| score >= thresh)
                    .map(|(index, (&score, &raw))| Candidate {
                        index,
                        score,
                        raw,
                        label: k + 1,
                    })
                    .collect();
                select_records(&mut preds, boxes, &cands, &nms, |_| Ok(None))?;
            }
            // stable: equal raw scores keep anchor order within a class
            preds.sort_by(|a, b| {
                b.raw_score
                    .total_cmp(&a.raw_score)
                    .then_with(|| a.label.cmp(&b.label))
            });
            preds.truncate(self.cfg.nms.max_objects_per_scene);
        } else {
            let best = scores.best_class();
            let cands: Vec<Candidate> = (0..best.scores.len())
                .filter(|&i| best.scores[i] >= thresh)
                .map(|i| Candidate {
                    index: i,
                    score: best.scores[i],
                    raw: best.raw[i],
                    label: best.labels[i],
                })
                .collect();
            select_records(&mut preds, boxes, &cands, &self.cfg.nms, |_| Ok(None))?;
        }

        let recall = match gt {
            Some(gt) => {
                let rows: Vec<Vec<f32>> = preds.iter().map(|p| p.bbox.to_vec()).collect();
                let kept = stack_rows(&rows, boxes.ncols())?;
                self.tracker.evaluate_rpn(kept.view(), gt)?
            }
            None => None,
        };
        trace_event!("rpn_scene", kept = preds.len());
        Ok((preds, recall))
    }

    fn rcnn_scene(
        &self,
        scene: usize,
        logits: Vec<f32>,
        boxes: ArrayView2<'_, f32>,
        rois: &RoiBatch,
        gt: Option<ArrayView2<'_, f32>>,
    ) -> BoxRefineResult<SceneOutput> {
        let valid = rois.num_valid[scene];
        let logits = &logits[..valid];
        let boxes = boxes.slice(s![..valid, ..]);
        let scene_rois = rois.rois.slice(s![scene, ..valid, ..]);
        let scores: Vec<f32> = logits.iter().map(|&l| self.cfg.rcnn_score.score(l)).collect();

        let recall = match gt {
            Some(gt) => self
                .tracker
                .evaluate_rcnn(scene_rois, boxes, logits, gt)?,
            None => None,
        };

        let cands: Vec<Candidate> = (0..valid)
            .filter(|&i| scores[i] >= self.cfg.score_thresh && row_is_valid(scene_rois.row(i)))
            .map(|i| Candidate {
                index: i,
                score: scores[i],
                raw: logits[i],
                label: rois.roi_labels[[scene, i]],
            })
            .collect();

        let mut preds = Vec::new();
        select_records(&mut preds, boxes, &cands, &self.cfg.nms, |i| {
            Ok(Some(RoiRecord {
                roi: Box3d::from_row(scene_rois.row(i))?,
                raw_score: rois.roi_raw_scores[[scene, i]],
                gt_iou: recall.as_ref().and_then(|r| r.gt_iou.get(i).copied()),
            }))
        })?;

        trace_event!("rcnn_scene", kept = preds.len());
        Ok((preds, recall))
    }
}

fn check_width(context: &'static str, boxes: ArrayView3<'_, f32>) -> BoxRefineResult<()> {
    let (b, n, width) = boxes.dim();
    if width < BOX_DIM {
        return Err(BoxRefineError::shape(context, &[b, n, BOX_DIM], &[b, n, width]));
    }
    Ok(())
}

fn check_gt(gt: Option<ArrayView3<'_, f32>>, batch: usize) -> BoxRefineResult<()> {
    if let Some(gt) = gt {
        let (b, g, width) = gt.dim();
        if b != batch || width < BOX_DIM {
            return Err(BoxRefineError::shape("ground truth", &[batch, g, BOX_DIM], &[b, g, width]));
        }
    }
    Ok(())
}

fn stack_rows(rows: &[Vec<f32>], width: usize) -> BoxRefineResult<ndarray::Array2<f32>> {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    ndarray::Array2::from_shape_vec((rows.len(), width), flat)
        .map_err(|_| BoxRefineError::shape("stacked boxes", &[rows.len(), width], &[rows.len()]))
}

/// Runs `nms` over `cands` and appends the kept records to `out`.
///
/// Soft NMS scores replace both the score and the raw score of a record.
fn select_records<F>(
    out: &mut Vec<Prediction>,
    boxes: ArrayView2<'_, f32>,
    cands: &[Candidate],
    nms: &NmsConfig,
    roi_of: F,
) -> BoxRefineResult<()>
where
    F: Fn(usize) -> BoxRefineResult<Option<RoiRecord>>,
{
    if cands.is_empty() {
        return Ok(());
    }
    let indices: Vec<usize> = cands.iter().map(|c| c.index).collect();
    let cand_boxes = boxes.select(Axis(0), &indices);
    let raw: Vec<f32> = cands.iter().map(|c| c.raw).collect();
    let Selection {
        indices: kept,
        decayed_scores,
    } = nms.select(cand_boxes.view(), &raw)?;

    for (rank, k) in kept.into_iter().enumerate() {
        let cand = &cands[k];
        let (score, raw_score) = match decayed_scores.as_ref() {
            Some(decayed) => (decayed[rank], decayed[rank]),
            None => (cand.score, cand.raw),
        };
        out.push(Prediction {
            bbox: Box3d::from_row(boxes.row(cand.index))?,
            label: cand.label,
            score,
            raw_score,
            roi: roi_of(cand.index)?,
        });
    }
    Ok(())
}

fn fold_scenes(per_scene: Vec<SceneOutput>) -> BatchPredictions {
    let mut out = BatchPredictions::default();
    for (preds, recall) in per_scene {
        if let Some(recall) = recall {
            out.recall.add(&recall);
        }
        out.scenes.push(preds);
    }
    trace_event!("predictions", total = out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::{PredictConfig, PredictionAssembler, RcnnScoreMode};
    use crate::candidate::nms::{NmsConfig, NmsKind, SoftDecay};
    use crate::util::BoxRefineError;
    use ndarray::{arr3, Array3};

    #[test]
    fn score_mode_names() {
        assert_eq!("bce".parse::<RcnnScoreMode>().unwrap(), RcnnScoreMode::Sigmoid);
        assert_eq!(
            "smooth-l1".parse::<RcnnScoreMode>().unwrap(),
            RcnnScoreMode::IouRegression
        );
        assert!(matches!(
            "hinge".parse::<RcnnScoreMode>(),
            Err(BoxRefineError::UnsupportedMode { .. })
        ));
        assert_eq!(RcnnScoreMode::IouRegression.score(1.4), 1.0);
    }

    #[test]
    fn multi_class_labels_follow_class_column_and_rank() {
        let assembler = PredictionAssembler::new(PredictConfig {
            num_classes: 2,
            score_thresh: 0.5,
            score: crate::scoring::ScoreConfig {
                use_multi_classes_nms: true,
                ..Default::default()
            },
            ..PredictConfig::default()
        })
        .unwrap();
        let boxes = arr3(&[[
            [0.0f32, 0.0, 0.0, 2.0, 2.0, 2.0, 0.0],
            [10.0, 0.0, 0.0, 2.0, 2.0, 2.0, 0.0],
        ]]);
        let cls = arr3(&[[[2.0f32, 3.0], [-4.0, -4.0]]]);
        let out = assembler.predict_rpn(cls.view(), boxes.view(), None).unwrap();
        let labels: Vec<usize> = out.scenes[0].iter().map(|p| p.label).collect();
        // class 2 has the larger logit and ranks first
        assert_eq!(labels, vec![2, 1]);
        assert!(out.scenes[0].iter().all(|p| p.bbox.x == 0.0));
    }

    #[test]
    fn multi_class_scene_cap_keeps_strongest_class() {
        let assembler = PredictionAssembler::new(PredictConfig {
            num_classes: 2,
            score_thresh: 0.3,
            nms: NmsConfig {
                max_objects_per_scene: 1,
                ..NmsConfig::default()
            },
            score: crate::scoring::ScoreConfig {
                use_multi_classes_nms: true,
                ..Default::default()
            },
            ..PredictConfig::default()
        })
        .unwrap();
        let boxes = arr3(&[[
            [0.0f32, 0.0, 0.0, 2.0, 2.0, 2.0, 0.0],
            [10.0, 0.0, 0.0, 2.0, 2.0, 2.0, 0.0],
        ]]);
        // anchor 0 is class 1 at 0.6, anchor 1 is class 2 at 0.95
        let cls = arr3(&[[[0.6f32.ln() - 0.4f32.ln(), -6.0], [-6.0, 19.0f32.ln()]]]);
        let out = assembler.predict_rpn(cls.view(), boxes.view(), None).unwrap();
        assert_eq!(out.scenes[0].len(), 1);
        let kept = &out.scenes[0][0];
        assert_eq!(kept.label, 2);
        assert_eq!(kept.bbox.x, 10.0);
        assert!((kept.score - 0.95).abs() < 1e-5);
    }

    #[test]
    fn soft_scores_replace_raw_scores() {
        let assembler = PredictionAssembler::new(PredictConfig {
            score_thresh: 0.0,
            nms: NmsConfig {
                kind: NmsKind::SoftRotated {
                    decay: SoftDecay::Linear { nt: 0.3 },
                    score_thresh: 0.01,
                },
                ..NmsConfig::default()
            },
            ..PredictConfig::default()
        })
        .unwrap();
        let boxes = arr3(&[[[0.0f32, 0.0, 0.0, 2.0, 2.0, 2.0, 0.0]]]);
        let cls = arr3(&[[[0.0f32]]]);
        let out = assembler.predict_rpn(cls.view(), boxes.view(), None).unwrap();
        let p = &out.scenes[0][0];
        assert!((p.score - 0.5).abs() < 1e-6);
        assert_eq!(p.score, p.raw_score);
    }

    #[test]
    fn soft_decay_is_validated_on_construction() {
        let err = PredictionAssembler::new(PredictConfig {
            nms: NmsConfig {
                kind: NmsKind::SoftRotated {
                    decay: SoftDecay::Gaussian { sigma: 0.0 },
                    score_thresh: 0.1,
                },
                ..NmsConfig::default()
            },
            ..PredictConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, BoxRefineError::InvalidConfig { .. }));
    }

    #[test]
    fn gt_batch_must_match() {
        let assembler = PredictionAssembler::new(PredictConfig::default()).unwrap();
        let boxes = Array3::<f32>::zeros((2, 1, 7));
        let cls = Array3::<f32>::zeros((2, 1, 1));
        let gt = Array3::<f32>::zeros((1, 3, 7));
        let err = assembler
            .predict_rpn(cls.view(), boxes.view(), Some(gt.view()))
            .unwrap_err();
        assert!(matches!(err, BoxRefineError::ShapeMismatch { .. }));
    }
}
