//! Box representation and overlap measures.
//!
//! Boxes are center-based rows `(x, y, z, dx, dy, dz, heading, extra...)`.
//! Batched tensors are `(batch, n, width)` with `width >= BOX_DIM`.

use ndarray::{ArrayView1, ArrayView2, ArrayView3};

use crate::util::{BoxRefineError, BoxRefineResult};

pub mod iou;

/// Number of geometric box parameters before any extra dims.
pub const BOX_DIM: usize = 7;
/// Column holding the heading angle.
pub const HEADING: usize = 6;

/// A single box with optional trailing extra dims (e.g. velocity).
#[derive(Clone, Debug, PartialEq)]
pub struct Box3d {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
    pub heading: f32,
    pub extra: Vec<f32>,
}

impl Box3d {
    /// Creates a box without extra dims.
    pub fn new(x: f32, y: f32, z: f32, dx: f32, dy: f32, dz: f32, heading: f32) -> Self {
        Self {
            x,
            y,
            z,
            dx,
            dy,
            dz,
            heading,
            extra: Vec::new(),
        }
    }

    /// Reads a box from a row of at least `BOX_DIM` values.
    pub fn from_row(row: ArrayView1<'_, f32>) -> BoxRefineResult<Self> {
        if row.len() < BOX_DIM {
            return Err(BoxRefineError::shape("box row", &[BOX_DIM], &[row.len()]));
        }
        Ok(Self {
            x: row[0],
            y: row[1],
            z: row[2],
            dx: row[3],
            dy: row[4],
            dz: row[5],
            heading: row[HEADING],
            extra: row.iter().skip(BOX_DIM).copied().collect(),
        })
    }

    /// Returns the box as a flat parameter vector.
    pub fn to_vec(&self) -> Vec<f32> {
        let mut out = vec![
            self.x,
            self.y,
            self.z,
            self.dx,
            self.dy,
            self.dz,
            self.heading,
        ];
        out.extend_from_slice(&self.extra);
        out
    }

    /// A box is valid when its dimensions sum to a positive value.
    pub fn is_valid(&self) -> bool {
        self.dx + self.dy + self.dz > 0.0
    }
}

/// Returns true when the dims of `row` sum to a positive value.
pub(crate) fn row_is_valid(row: ArrayView1<'_, f32>) -> bool {
    row[3] + row[4] + row[5] > 0.0
}

/// Checks that `boxes` is `(n, >= BOX_DIM)`.
pub(crate) fn check_boxes_2d(context: &'static str, boxes: ArrayView2<'_, f32>) -> BoxRefineResult<()> {
    let (n, width) = boxes.dim();
    if width < BOX_DIM {
        return Err(BoxRefineError::shape(context, &[n, BOX_DIM], &[n, width]));
    }
    Ok(())
}

/// Checks that `a` and `b` agree in batch size and per-scene count.
pub(crate) fn check_paired_3d(
    context: &'static str,
    a: ArrayView3<'_, f32>,
    b: ArrayView3<'_, f32>,
) -> BoxRefineResult<()> {
    let (ba, na, _) = a.dim();
    let (bb, nb, wb) = b.dim();
    if ba != bb || na != nb {
        return Err(BoxRefineError::shape(context, &[ba, na, wb], &[bb, nb, wb]));
    }
    Ok(())
}
