//! Region proposal generation from dense per-anchor predictions.
//!
//! Each scene's anchors are scored, thresholded and reduced with hard rotated
//! NMS into a fixed number of proposal slots. Valid proposals fill the leading
//! slots in descending raw-score order; the remaining slots are padding with
//! an all-zero box, zero scores and label 0.

use std::cmp::Ordering;

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::candidate::nms::{NmsConfig, NmsKind};
use crate::geometry::{check_paired_3d, BOX_DIM};
use crate::scoring::ScoreConfig;
use crate::trace::{trace_event, trace_span};
use crate::util::{BoxRefineError, BoxRefineResult};

pub mod direction;

pub use direction::{DirectionConfig, DirectionRefiner};

/// Selects the proposal stage parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalMode {
    Train,
    Test,
}

/// Selection parameters for one mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProposalStage {
    /// Candidates kept by raw score before NMS.
    pub pre_nms_top_n: usize,
    /// Fixed number of proposal slots per scene.
    pub post_nms_top_n: usize,
    /// BEV IoU threshold for hard NMS.
    pub nms_thresh: f32,
    /// Minimum calibrated score.
    pub score_thresh: f32,
}

/// Proposal layer configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProposalConfig {
    pub train: ProposalStage,
    pub test: ProposalStage,
    pub score: ScoreConfig,
    /// Number of foreground classes.
    pub num_classes: usize,
    /// Process scenes in parallel (requires the `rayon` feature).
    pub parallel: bool,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            train: ProposalStage {
                pre_nms_top_n: 9000,
                post_nms_top_n: 512,
                nms_thresh: 0.8,
                score_thresh: 0.0,
            },
            test: ProposalStage {
                pre_nms_top_n: 9000,
                post_nms_top_n: 100,
                nms_thresh: 0.85,
                score_thresh: 0.0,
            },
            score: ScoreConfig::default(),
            num_classes: 1,
            parallel: false,
        }
    }
}

impl ProposalConfig {
    /// Stage parameters for `mode`.
    pub fn stage(&self, mode: ProposalMode) -> ProposalStage {
        match mode {
            ProposalMode::Train => self.train,
            ProposalMode::Test => self.test,
        }
    }
}

/// Fixed-size proposals for a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiBatch {
    /// `(B, cap, box_dim)` proposal boxes.
    pub rois: Array3<f32>,
    /// `(B, cap)` raw (pre-activation) scores.
    pub roi_raw_scores: Array2<f32>,
    /// `(B, cap)` calibrated scores.
    pub roi_scores: Array2<f32>,
    /// `(B, cap)` 1-based labels; 0 marks padding.
    pub roi_labels: Array2<usize>,
    /// Number of leading valid slots per scene.
    pub num_valid: Vec<usize>,
}

impl RoiBatch {
    /// Number of scenes.
    pub fn batch_size(&self) -> usize {
        self.rois.len_of(Axis(0))
    }

    /// Proposal slots per scene.
    pub fn capacity(&self) -> usize {
        self.rois.len_of(Axis(1))
    }
}

#[derive(Clone, Copy, Debug)]
struct Proposal {
    anchor: usize,
    raw: f32,
    score: f32,
    label: usize,
}

fn proposal_cmp_desc(a: &Proposal, b: &Proposal) -> Ordering {
    b.raw
        .total_cmp(&a.raw)
        .then_with(|| a.anchor.cmp(&b.anchor))
        .then_with(|| a.label.cmp(&b.label))
}

/// Turns decoded per-anchor boxes and class logits into proposals.
#[derive(Clone, Copy, Debug)]
pub struct ProposalLayer {
    cfg: ProposalConfig,
}

impl ProposalLayer {
    /// Creates a proposal layer after validating the config.
    pub fn new(cfg: ProposalConfig) -> BoxRefineResult<Self> {
        cfg.score.validate()?;
        if cfg.num_classes == 0 {
            return Err(BoxRefineError::InvalidConfig {
                reason: "num_classes must be > 0",
            });
        }
        for stage in [cfg.train, cfg.test] {
            if stage.post_nms_top_n == 0 {
                return Err(BoxRefineError::InvalidConfig {
                    reason: "post_nms_top_n must be > 0",
                });
            }
        }
        Ok(Self { cfg })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProposalConfig {
        &self.cfg
    }

    /// Generates proposals from `(B, A, C')` logits and `(B, A, 7+)` decoded
    /// boxes.
    pub fn propose(
        &self,
        cls_preds: ArrayView3<'_, f32>,
        box_preds: ArrayView3<'_, f32>,
        mode: ProposalMode,
    ) -> BoxRefineResult<RoiBatch> {
        check_paired_3d("proposal inputs", box_preds, cls_preds)?;
        let (batch, anchors, box_dim) = box_preds.dim();
        if box_dim < BOX_DIM {
            return Err(BoxRefineError::shape(
                "proposal boxes",
                &[batch, anchors, BOX_DIM],
                &[batch, anchors, box_dim],
            ));
        }
        let stage = self.cfg.stage(mode);
        let _span = trace_span!("propose", batch = batch, anchors = anchors).entered();

        let per_scene = self.propose_all(cls_preds, box_preds, stage)?;

        let cap = stage.post_nms_top_n;
        let mut out = RoiBatch {
            rois: Array3::zeros((batch, cap, box_dim)),
            roi_raw_scores: Array2::zeros((batch, cap)),
            roi_scores: Array2::zeros((batch, cap)),
            roi_labels: Array2::zeros((batch, cap)),
            num_valid: Vec::with_capacity(batch),
        };
        for (scene, proposals) in per_scene.into_iter().enumerate() {
            let boxes = box_preds.index_axis(Axis(0), scene);
            for (slot, p) in proposals.iter().enumerate() {
                out.rois
                    .slice_mut(s![scene, slot, ..])
                    .assign(&boxes.row(p.anchor));
                out.roi_raw_scores[[scene, slot]] = p.raw;
                out.roi_scores[[scene, slot]] = p.score;
                out.roi_labels[[scene, slot]] = p.label;
            }
            out.num_valid.push(proposals.len());
        }

        trace_event!("proposals", total = out.num_valid.iter().sum::<usize>());
        Ok(out)
    }

    fn propose_all(
        &self,
        cls_preds: ArrayView3<'_, f32>,
        box_preds: ArrayView3<'_, f32>,
        stage: ProposalStage,
    ) -> BoxRefineResult<Vec<Vec<Proposal>>> {
        let batch = box_preds.len_of(Axis(0));
        let run = |scene: usize| {
            self.propose_scene(
                cls_preds.index_axis(Axis(0), scene),
                box_preds.index_axis(Axis(0), scene),
                stage,
            )
        };

        #[cfg(feature = "rayon")]
        {
            if self.cfg.parallel {
                return (0..batch).into_par_iter().map(&run).collect();
            }
        }

        (0..batch).map(&run).collect()
    }

    fn propose_scene(
        &self,
        cls: ArrayView2<'_, f32>,
        boxes: ArrayView2<'_, f32>,
        stage: ProposalStage,
    ) -> BoxRefineResult<Vec<Proposal>> {
        let scores = self.cfg.score.score(cls, self.cfg.num_classes)?;
        let nms = NmsConfig {
            kind: NmsKind::Rotated {
                thresh: stage.nms_thresh,
            },
            pre_maxsize: stage.pre_nms_top_n,
            post_maxsize: stage.post_nms_top_n,
            max_objects_per_scene: stage.post_nms_top_n,
        };

        let mut proposals = Vec::new();
        if self.cfg.score.use_multi_classes_nms {
            for k in 0..self.cfg.num_classes {
                let class_scores = scores.scores.column(k);
                let class_raw = scores.raw.column(k);
                let keep: Vec<usize> = (0..class_scores.len())
                    .filter(|&i| class_scores[i] >= stage.score_thresh)
                    .collect();
                select_into(&mut proposals, boxes, &keep, &nms, |i| {
                    (class_raw[i], class_scores[i], k + 1)
                })?;
            }
        } else {
            let best = scores.best_class();
            let keep: Vec<usize> = (0..best.scores.len())
                .filter(|&i| best.scores[i] >= stage.score_thresh)
                .collect();
            select_into(&mut proposals, boxes, &keep, &nms, |i| {
                (best.raw[i], best.scores[i], best.labels[i])
            })?;
        }

        proposals.sort_by(proposal_cmp_desc);
        proposals.truncate(stage.post_nms_top_n);
        Ok(proposals)
    }
}

/// Runs NMS over the `keep` anchors and appends the survivors to `out`.
///
/// `describe` maps an anchor index to `(raw score, score, label)`.
fn select_into<F>(
    out: &mut Vec<Proposal>,
    boxes: ArrayView2<'_, f32>,
    keep: &[usize],
    nms: &NmsConfig,
    describe: F,
) -> BoxRefineResult<()>
where
    F: Fn(usize) -> (f32, f32, usize),
{
    if keep.is_empty() {
        return Ok(());
    }
    let cand_boxes = boxes.select(Axis(0), keep);
    let cand_raw: Vec<f32> = keep.iter().map(|&i| describe(i).0).collect();
    let selection = nms.select(cand_boxes.view(), &cand_raw)?;
    for idx in selection.indices {
        let anchor = keep[idx];
        let (raw, score, label) = describe(anchor);
        out.push(Proposal {
            anchor,
            raw,
            score,
            label,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ProposalConfig, ProposalLayer, ProposalMode, ProposalStage};
    use crate::util::BoxRefineError;
    use ndarray::{arr3, Array3};

    fn layer(cap: usize, score_thresh: f32) -> ProposalLayer {
        let stage = ProposalStage {
            pre_nms_top_n: 100,
            post_nms_top_n: cap,
            nms_thresh: 0.5,
            score_thresh,
        };
        ProposalLayer::new(ProposalConfig {
            train: stage,
            test: stage,
            num_classes: 2,
            ..ProposalConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn padding_slots_are_zero() {
        let layer = layer(4, 0.3);
        let boxes = arr3(&[[
            [0.0f32, 0.0, 0.0, 4.0, 2.0, 1.5, 0.0],
            [10.0, 0.0, 0.0, 4.0, 2.0, 1.5, 0.0],
        ]]);
        let cls = arr3(&[[[3.0f32, -3.0], [-3.0, 1.0]]]);
        let rois = layer.propose(cls.view(), boxes.view(), ProposalMode::Test).unwrap();
        assert_eq!(rois.num_valid, vec![2]);
        assert_eq!(rois.capacity(), 4);
        assert_eq!(rois.roi_labels.row(0).to_vec(), vec![1, 2, 0, 0]);
        for slot in 2..4 {
            assert!(rois.rois.slice(ndarray::s![0, slot, ..]).iter().all(|&v| v == 0.0));
            assert_eq!(rois.roi_raw_scores[[0, slot]], 0.0);
            assert_eq!(rois.roi_scores[[0, slot]], 0.0);
        }
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let stage = ProposalStage {
            pre_nms_top_n: 10,
            post_nms_top_n: 0,
            nms_thresh: 0.5,
            score_thresh: 0.0,
        };
        let err = ProposalLayer::new(ProposalConfig {
            train: stage,
            ..ProposalConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, BoxRefineError::InvalidConfig { .. }));
    }

    #[test]
    fn mismatched_anchor_counts_are_rejected() {
        let layer = layer(4, 0.3);
        let boxes = Array3::<f32>::zeros((1, 3, 7));
        let cls = Array3::<f32>::zeros((1, 2, 2));
        let err = layer.propose(cls.view(), boxes.view(), ProposalMode::Train).unwrap_err();
        assert!(matches!(err, BoxRefineError::ShapeMismatch { .. }));
    }
}
