//! Candidate selection and pruning utilities.
//!
//! Includes deterministic top-K selection, hard rotated NMS and soft NMS over
//! bird's-eye-view footprints.

pub mod nms;
pub mod soft;
pub(crate) mod topk;
