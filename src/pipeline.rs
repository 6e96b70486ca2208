//! Detection head post-processing from raw network outputs.

use ndarray::{Array3, ArrayView2, ArrayView3};

use crate::coder::{BoxCoder, CoderConfig, ProposalLocalCoder, ResidualCoder};
use crate::predict::{BatchPredictions, PredictConfig, PredictionAssembler};
use crate::proposal::{DirectionConfig, DirectionRefiner, ProposalConfig, ProposalLayer, ProposalMode, RoiBatch};
use crate::util::{BoxRefineError, BoxRefineResult};

/// Configuration for a [`PostProcessor`].
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    /// Anchor-relative coder for first-stage deltas.
    pub coder: CoderConfig,
    /// Proposal-local coder for second-stage deltas.
    pub rcnn_coder: CoderConfig,
    /// Direction bins; `None` keeps decoded headings as they are.
    pub direction: Option<DirectionConfig>,
    pub proposal: ProposalConfig,
    pub predict: PredictConfig,
    /// Class names indexed by `label - 1`.
    pub class_names: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            coder: CoderConfig::default(),
            rcnn_coder: CoderConfig::default(),
            direction: Some(DirectionConfig::default()),
            proposal: ProposalConfig::default(),
            predict: PredictConfig::default(),
            class_names: vec!["Car".to_string()],
        }
    }
}

/// First-stage network outputs for a batch.
#[derive(Clone, Copy, Debug)]
pub struct RpnOutput<'a> {
    /// `(B, A, C')` class logits.
    pub cls_preds: ArrayView3<'a, f32>,
    /// `(B, A, code_size)` box deltas.
    pub box_preds: ArrayView3<'a, f32>,
    /// `(B, A, num_bins)` direction logits.
    pub dir_cls_preds: Option<ArrayView3<'a, f32>>,
}

/// Second-stage network outputs for a batch of proposals.
#[derive(Clone, Copy, Debug)]
pub struct RcnnOutput<'a> {
    /// `(B, N)` confidence logits.
    pub cls_preds: ArrayView2<'a, f32>,
    /// `(B, N, code_size)` proposal-local deltas.
    pub box_preds: ArrayView3<'a, f32>,
}

/// Decodes, proposes and assembles detections for a two-stage detector.
#[derive(Clone, Debug)]
pub struct PostProcessor {
    coder: ResidualCoder,
    rcnn_coder: ProposalLocalCoder,
    direction: Option<DirectionRefiner>,
    proposals: ProposalLayer,
    assembler: PredictionAssembler,
    class_names: Vec<String>,
}

impl PostProcessor {
    /// Builds every stage, validating the config.
    pub fn new(cfg: DetectorConfig) -> BoxRefineResult<Self> {
        if cfg.class_names.is_empty() {
            return Err(BoxRefineError::InvalidConfig {
                reason: "class_names must not be empty",
            });
        }
        if cfg.proposal.num_classes != cfg.class_names.len() || cfg.predict.num_classes != cfg.class_names.len() {
            return Err(BoxRefineError::InvalidConfig {
                reason: "num_classes must match class_names",
            });
        }
        if cfg.coder.box_dim != cfg.rcnn_coder.box_dim {
            return Err(BoxRefineError::InvalidConfig {
                reason: "coders must share box_dim",
            });
        }
        Ok(Self {
            coder: ResidualCoder::new(cfg.coder)?,
            rcnn_coder: ProposalLocalCoder::new(cfg.rcnn_coder)?,
            direction: cfg.direction.map(DirectionRefiner::new).transpose()?,
            proposals: ProposalLayer::new(cfg.proposal)?,
            assembler: PredictionAssembler::new(cfg.predict)?,
            class_names: cfg.class_names,
        })
    }

    /// Decodes first-stage deltas against `(B, A, box_dim)` anchors and
    /// resolves headings from the direction logits when bins are configured.
    pub fn decode_rpn(
        &self,
        anchors: ArrayView3<'_, f32>,
        box_preds: ArrayView3<'_, f32>,
        dir_cls_preds: Option<ArrayView3<'_, f32>>,
    ) -> BoxRefineResult<Array3<f32>> {
        let mut boxes = self.coder.decode(box_preds, anchors)?;
        if let Some(refiner) = self.direction.as_ref() {
            let dir = dir_cls_preds.ok_or(BoxRefineError::InvalidConfig {
                reason: "direction bins configured but no direction logits given",
            })?;
            refiner.apply(boxes.view_mut(), dir)?;
        }
        Ok(boxes)
    }

    /// Proposals from first-stage outputs.
    pub fn propose(
        &self,
        anchors: ArrayView3<'_, f32>,
        rpn: RpnOutput<'_>,
        mode: ProposalMode,
    ) -> BoxRefineResult<RoiBatch> {
        let boxes = self.decode_rpn(anchors, rpn.box_preds, rpn.dir_cls_preds)?;
        self.proposals.propose(rpn.cls_preds, boxes.view(), mode)
    }

    /// Refined world-frame boxes from proposal-local deltas.
    pub fn decode_rcnn(&self, rois: &RoiBatch, box_preds: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>> {
        self.rcnn_coder.decode(box_preds, rois.rois.view())
    }

    /// Single-stage detections from first-stage outputs.
    pub fn predict_rpn(
        &self,
        anchors: ArrayView3<'_, f32>,
        rpn: RpnOutput<'_>,
        gt: Option<ArrayView3<'_, f32>>,
    ) -> BoxRefineResult<BatchPredictions> {
        let boxes = self.decode_rpn(anchors, rpn.box_preds, rpn.dir_cls_preds)?;
        self.assembler.predict_rpn(rpn.cls_preds, boxes.view(), gt)
    }

    /// Two-stage detections from refined proposals.
    pub fn predict_rcnn(
        &self,
        rois: &RoiBatch,
        rcnn: RcnnOutput<'_>,
        gt: Option<ArrayView3<'_, f32>>,
    ) -> BoxRefineResult<BatchPredictions> {
        let boxes = self.decode_rcnn(rois, rcnn.box_preds)?;
        self.assembler.predict_rcnn(rcnn.cls_preds, boxes.view(), rois, gt)
    }

    /// Name of a 1-based label.
    pub fn class_name(&self, label: usize) -> Option<&str> {
        label
            .checked_sub(1)
            .and_then(|i| self.class_names.get(i))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::{DetectorConfig, PostProcessor, RpnOutput};
    use crate::util::BoxRefineError;
    use ndarray::Array3;

    #[test]
    fn class_names_are_one_based() {
        let post = PostProcessor::new(DetectorConfig::default()).unwrap();
        assert_eq!(post.class_name(1), Some("Car"));
        assert_eq!(post.class_name(0), None);
        assert_eq!(post.class_name(2), None);
    }

    #[test]
    fn class_count_must_match_names() {
        let cfg = DetectorConfig {
            class_names: vec!["Car".into(), "Pedestrian".into()],
            ..DetectorConfig::default()
        };
        assert!(matches!(
            PostProcessor::new(cfg),
            Err(BoxRefineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn missing_direction_logits_are_reported() {
        let post = PostProcessor::new(DetectorConfig::default()).unwrap();
        let anchors = Array3::<f32>::zeros((1, 2, 7));
        let deltas = Array3::<f32>::zeros((1, 2, 7));
        let cls = Array3::<f32>::zeros((1, 2, 1));
        let rpn = RpnOutput {
            cls_preds: cls.view(),
            box_preds: deltas.view(),
            dir_cls_preds: None,
        };
        assert!(post.predict_rpn(anchors.view(), rpn, None).is_err());
    }
}
