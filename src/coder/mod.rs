//! Box delta encoding and decoding.
//!
//! A coder maps boxes to regression targets relative to reference boxes
//! (anchors or proposals) and back. All operations work on batched
//! `(batch, n, width)` tensors and reject mismatched pairs instead of
//! broadcasting.

use ndarray::{Array3, ArrayView3};

use crate::geometry::BOX_DIM;
use crate::util::{BoxRefineError, BoxRefineResult};

pub mod local;
pub mod residual;

pub use local::ProposalLocalCoder;
pub use residual::ResidualCoder;

/// Encoder/decoder between boxes and deltas relative to reference boxes.
pub trait BoxCoder {
    /// Number of values per encoded box.
    fn code_size(&self) -> usize;

    /// Number of values per decoded box.
    fn box_dim(&self) -> usize;

    /// Encodes `(B, N, box_dim)` boxes against `(B, N, box_dim)` references.
    fn encode(&self, boxes: ArrayView3<'_, f32>, refs: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>>;

    /// Decodes `(B, N, code_size)` deltas against `(B, N, box_dim)` references.
    fn decode(&self, deltas: ArrayView3<'_, f32>, refs: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>>;
}

/// Per-coder parameters shared by every encode/decode call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoderConfig {
    /// Box width including extra dims (at least 7).
    pub box_dim: usize,
    /// Encode heading as `(cos, sin)` residuals instead of a raw angle delta.
    pub encode_angle_by_sincos: bool,
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            box_dim: BOX_DIM,
            encode_angle_by_sincos: false,
        }
    }
}

impl CoderConfig {
    /// Number of encoded values per box.
    pub fn code_size(&self) -> usize {
        self.box_dim + usize::from(self.encode_angle_by_sincos)
    }

    pub(crate) fn validate(&self) -> BoxRefineResult<()> {
        if self.box_dim < BOX_DIM {
            return Err(BoxRefineError::InvalidConfig {
                reason: "box_dim must be at least 7",
            });
        }
        Ok(())
    }
}

/// Checks a `(values, refs)` pair: same batch and count, exact widths.
pub(crate) fn check_pair(
    context: &'static str,
    values: ArrayView3<'_, f32>,
    value_width: usize,
    refs: ArrayView3<'_, f32>,
    ref_width: usize,
) -> BoxRefineResult<()> {
    let (b, n, w) = values.dim();
    if w != value_width {
        return Err(BoxRefineError::shape(context, &[b, n, value_width], &[b, n, w]));
    }
    let (rb, rn, rw) = refs.dim();
    if rb != b || rn != n || rw != ref_width {
        return Err(BoxRefineError::shape(context, &[b, n, ref_width], &[rb, rn, rw]));
    }
    Ok(())
}
