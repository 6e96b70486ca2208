//! Rotated non-maximum suppression on BEV footprints.

use std::str::FromStr;

use ndarray::ArrayView2;

use crate::candidate::soft::soft_nms_rotated;
use crate::candidate::topk::{enumerate_scores, sort_scored_desc, top_k_desc};
use crate::geometry::check_boxes_2d;
use crate::geometry::iou::BevBox;
use crate::trace::{trace_event, trace_span};
use crate::util::math::sigmoid;
use crate::util::{BoxRefineError, BoxRefineResult};

/// Score decay applied to boxes overlapping a kept box in soft NMS.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SoftDecay {
    /// `w = 1 - iou` when `iou > nt`, else 1.
    Linear { nt: f32 },
    /// `w = exp(-iou^2 / sigma)`.
    Gaussian { sigma: f32 },
}

impl SoftDecay {
    /// Weight applied to a score given its IoU with the kept box.
    pub fn weight(&self, iou: f32) -> f32 {
        match *self {
            SoftDecay::Linear { nt } => {
                if iou > nt {
                    1.0 - iou
                } else {
                    1.0
                }
            }
            SoftDecay::Gaussian { sigma } => (-(iou * iou) / sigma).exp(),
        }
    }

    /// Rejects parameters that would produce non-finite or inverted weights.
    pub fn validate(&self) -> BoxRefineResult<()> {
        match *self {
            SoftDecay::Linear { nt } if !(0.0..=1.0).contains(&nt) => Err(BoxRefineError::InvalidConfig {
                reason: "nt must be within [0, 1]",
            }),
            SoftDecay::Gaussian { sigma } if !(sigma > 0.0 && sigma.is_finite()) => {
                Err(BoxRefineError::InvalidConfig {
                    reason: "sigma must be > 0",
                })
            }
            _ => Ok(()),
        }
    }
}

/// NMS algorithm with its parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NmsKind {
    /// Greedy hard suppression of boxes with IoU above `thresh`.
    Rotated { thresh: f32 },
    /// Score decay instead of removal; boxes below `score_thresh` are dropped.
    SoftRotated { decay: SoftDecay, score_thresh: f32 },
}

/// Names accepted for `nms_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmsType {
    Rotated,
    SoftRotated,
}

impl FromStr for NmsType {
    type Err = BoxRefineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotated" => Ok(NmsType::Rotated),
            "soft_rotated" | "soft_rotated_nms" => Ok(NmsType::SoftRotated),
            other => Err(BoxRefineError::unsupported("nms type", other)),
        }
    }
}

/// Names accepted for `nms_soft_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftType {
    Linear,
    Gaussian,
}

impl FromStr for SoftType {
    type Err = BoxRefineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(SoftType::Linear),
            "gaussian" => Ok(SoftType::Gaussian),
            other => Err(BoxRefineError::unsupported("soft nms type", other)),
        }
    }
}

/// Numeric parameters used when building an `NmsKind` from names.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NmsParams {
    /// Hard NMS IoU threshold.
    pub nms_thresh: f32,
    /// Gaussian decay sharpness.
    pub sigma: f32,
    /// Linear decay IoU threshold.
    pub nt: f32,
    /// Scores below this are dropped during soft NMS.
    pub soft_score_thresh: f32,
}

impl Default for NmsParams {
    fn default() -> Self {
        Self {
            nms_thresh: 0.1,
            sigma: 0.5,
            nt: 0.3,
            soft_score_thresh: 0.1,
        }
    }
}

impl NmsKind {
    /// Builds an NMS kind from `nms_type` and `soft_type` names.
    pub fn from_names(nms_type: &str, soft_type: &str, params: NmsParams) -> BoxRefineResult<Self> {
        match nms_type.parse::<NmsType>()? {
            NmsType::Rotated => Ok(NmsKind::Rotated {
                thresh: params.nms_thresh,
            }),
            NmsType::SoftRotated => {
                let decay = match soft_type.parse::<SoftType>()? {
                    SoftType::Linear => SoftDecay::Linear { nt: params.nt },
                    SoftType::Gaussian => SoftDecay::Gaussian {
                        sigma: params.sigma,
                    },
                };
                decay.validate()?;
                Ok(NmsKind::SoftRotated {
                    decay,
                    score_thresh: params.soft_score_thresh,
                })
            }
        }
    }

    /// Checks the decay parameters of a soft kind.
    pub fn validate(&self) -> BoxRefineResult<()> {
        match self {
            NmsKind::Rotated { .. } => Ok(()),
            NmsKind::SoftRotated { decay, .. } => decay.validate(),
        }
    }
}

pub(crate) fn bev_boxes(boxes: ArrayView2<'_, f32>) -> Vec<BevBox> {
    boxes.rows().into_iter().map(BevBox::from_row).collect()
}

pub(crate) fn check_scores(
    context: &'static str,
    boxes: ArrayView2<'_, f32>,
    scores: &[f32],
) -> BoxRefineResult<()> {
    check_boxes_2d(context, boxes)?;
    if boxes.nrows() != scores.len() {
        return Err(BoxRefineError::shape(context, &[boxes.nrows()], &[scores.len()]));
    }
    Ok(())
}

/// Hard rotated NMS.
///
/// Boxes are visited by descending score (ties by index) and kept if their BEV
/// IoU with every previously kept box is at most `thresh`. Returns kept
/// indices in visiting order.
pub fn nms_rotated(boxes: ArrayView2<'_, f32>, scores: &[f32], thresh: f32) -> BoxRefineResult<Vec<usize>> {
    check_scores("nms_rotated", boxes, scores)?;
    if scores.is_empty() {
        return Ok(Vec::new());
    }

    let bev = bev_boxes(boxes);
    let mut order = enumerate_scores(scores);
    sort_scored_desc(&mut order);

    let mut kept: Vec<usize> = Vec::new();
    'outer: for cand in order {
        for &k in kept.iter() {
            if bev[cand.index].iou(&bev[k]) > thresh {
                continue 'outer;
            }
        }
        kept.push(cand.index);
    }

    Ok(kept)
}

/// NMS dispatch with pre/post caps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NmsConfig {
    /// Algorithm and its parameters.
    pub kind: NmsKind,
    /// Candidates kept (by raw score) before NMS.
    pub pre_maxsize: usize,
    /// Boxes kept after NMS.
    pub post_maxsize: usize,
    /// Global per-scene cap applied last.
    pub max_objects_per_scene: usize,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            kind: NmsKind::Rotated { thresh: 0.1 },
            pre_maxsize: 4096,
            post_maxsize: 500,
            max_objects_per_scene: 500,
        }
    }
}

/// Result of an NMS dispatch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    /// Indices into the input candidates, best first.
    pub indices: Vec<usize>,
    /// Decayed scores replacing the originals (soft NMS only).
    pub decayed_scores: Option<Vec<f32>>,
}

impl Selection {
    fn truncate(&mut self, len: usize) {
        self.indices.truncate(len);
        if let Some(scores) = self.decayed_scores.as_mut() {
            scores.truncate(len);
        }
    }
}

impl NmsConfig {
    /// Selects boxes among `boxes` ranked by `raw_scores`.
    ///
    /// An empty input yields an empty selection.
    pub fn select(&self, boxes: ArrayView2<'_, f32>, raw_scores: &[f32]) -> BoxRefineResult<Selection> {
        check_scores("nms select", boxes, raw_scores)?;
        if raw_scores.is_empty() {
            return Ok(Selection::default());
        }
        let _span = trace_span!("nms", candidates = raw_scores.len()).entered();

        let top = top_k_desc(enumerate_scores(raw_scores), self.pre_maxsize);
        let indices: Vec<usize> = top.iter().map(|s| s.index).collect();
        let sub_boxes = boxes.select(ndarray::Axis(0), &indices);

        let mut selection = match self.kind {
            NmsKind::Rotated { thresh } => {
                let sub_scores: Vec<f32> = top.iter().map(|s| s.score).collect();
                let keep = nms_rotated(sub_boxes.view(), &sub_scores, thresh)?;
                Selection {
                    indices: keep.into_iter().map(|k| indices[k]).collect(),
                    decayed_scores: None,
                }
            }
            NmsKind::SoftRotated {
                decay,
                score_thresh,
            } => {
                let sub_scores: Vec<f32> = top.iter().map(|s| sigmoid(s.score)).collect();
                let soft = soft_nms_rotated(
                    sub_boxes.view(),
                    &sub_scores,
                    decay,
                    score_thresh,
                    self.pre_maxsize,
                )?;
                Selection {
                    indices: soft.keep.into_iter().map(|k| indices[k]).collect(),
                    decayed_scores: Some(soft.scores),
                }
            }
        };

        selection.truncate(self.post_maxsize);
        selection.truncate(self.max_objects_per_scene);
        trace_event!("nms_kept", count = selection.indices.len());
        Ok(selection)
    }
}
