//! Boxrefine is the post-processing core of anchor-based two-stage 3D object
//! detectors working on point clouds.
//!
//! It decodes box deltas against anchors and proposals, resolves headings from
//! direction bins, turns dense first-stage predictions into fixed-size
//! proposals with rotated NMS, and assembles final detections with optional
//! recall bookkeeping against ground truth. Scenes can be processed in
//! parallel via the `rayon` feature; spans and counts are emitted through
//! `tracing` with the `tracing` feature.

pub mod candidate;
pub mod coder;
pub mod geometry;
pub mod pipeline;
pub mod predict;
pub mod proposal;
pub mod scoring;
mod trace;
pub mod util;

pub use candidate::nms::{nms_rotated, NmsConfig, NmsKind, NmsParams, Selection, SoftDecay};
pub use candidate::soft::{soft_nms_rotated, SoftNmsResult};
pub use coder::{BoxCoder, CoderConfig, ProposalLocalCoder, ResidualCoder};
pub use geometry::iou::{boxes_iou3d, boxes_iou_bev, BevBox};
pub use geometry::{Box3d, BOX_DIM};
pub use pipeline::{DetectorConfig, PostProcessor, RcnnOutput, RpnOutput};
pub use predict::{
    BatchPredictions, PredictConfig, Prediction, PredictionAssembler, RcnnScoreMode, RecallDict,
    RecallIou, RecallTracker, RoiRecord, SceneRecall,
};
pub use proposal::{
    DirectionConfig, DirectionRefiner, ProposalConfig, ProposalLayer, ProposalMode, ProposalStage,
    RoiBatch,
};
pub use scoring::ScoreConfig;
pub use util::{BoxRefineError, BoxRefineResult};
