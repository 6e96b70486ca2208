//! Bird's-eye-view footprints and IoU matrices.
//!
//! A BEV footprint drops the vertical extent of a box and keeps the rotated
//! rectangle `(x, y, dx, dy, heading)`. Rectangle overlap is computed by
//! polygon intersection.

use geo::{Area, BooleanOps, LineString, Polygon};
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::geometry::{check_boxes_2d, HEADING};
use crate::util::BoxRefineResult;

const UNION_EPS: f64 = 1e-8;

/// Rotated rectangle on the ground plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BevBox {
    pub x: f32,
    pub y: f32,
    pub dx: f32,
    pub dy: f32,
    pub heading: f32,
}

impl BevBox {
    /// Projects a box row onto the ground plane.
    pub fn from_row(row: ArrayView1<'_, f32>) -> Self {
        Self {
            x: row[0],
            y: row[1],
            dx: row[3],
            dy: row[4],
            heading: row[HEADING],
        }
    }

    /// Footprint area.
    pub fn area(&self) -> f64 {
        f64::from(self.dx.max(0.0)) * f64::from(self.dy.max(0.0))
    }

    /// Corners in counter-clockwise order.
    pub fn corners(&self) -> [(f64, f64); 4] {
        let (sin, cos) = f64::from(self.heading).sin_cos();
        let hx = f64::from(self.dx) * 0.5;
        let hy = f64::from(self.dy) * 0.5;
        let cx = f64::from(self.x);
        let cy = f64::from(self.y);
        [(hx, hy), (-hx, hy), (-hx, -hy), (hx, -hy)]
            .map(|(lx, ly)| (cx + lx * cos - ly * sin, cy + lx * sin + ly * cos))
    }

    fn polygon(&self) -> Polygon<f64> {
        Polygon::new(LineString::from(self.corners().to_vec()), Vec::new())
    }

    fn bounding_radius(&self) -> f64 {
        0.5 * f64::from(self.dx).hypot(f64::from(self.dy))
    }

    /// Area of the intersection of two footprints.
    pub fn intersection_area(&self, other: &BevBox) -> f64 {
        if self.area() <= 0.0 || other.area() <= 0.0 {
            return 0.0;
        }
        let dist = f64::from(self.x - other.x).hypot(f64::from(self.y - other.y));
        if dist >= self.bounding_radius() + other.bounding_radius() {
            return 0.0;
        }
        self.polygon().intersection(&other.polygon()).unsigned_area()
    }

    /// Intersection over union of two footprints.
    pub fn iou(&self, other: &BevBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = (self.area() + other.area() - inter).max(UNION_EPS);
        (inter / union) as f32
    }
}

/// 3D IoU of two box rows: BEV intersection times vertical overlap.
pub fn iou3d_rows(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    let bev_a = BevBox::from_row(a);
    let bev_b = BevBox::from_row(b);
    let top = (a[2] + 0.5 * a[5]).min(b[2] + 0.5 * b[5]);
    let bottom = (a[2] - 0.5 * a[5]).max(b[2] - 0.5 * b[5]);
    let overlap_h = f64::from((top - bottom).max(0.0));
    if overlap_h <= 0.0 {
        return 0.0;
    }
    let inter = bev_a.intersection_area(&bev_b) * overlap_h;
    if inter <= 0.0 {
        return 0.0;
    }
    let vol_a = bev_a.area() * f64::from(a[5].max(0.0));
    let vol_b = bev_b.area() * f64::from(b[5].max(0.0));
    let union = (vol_a + vol_b - inter).max(UNION_EPS);
    (inter / union) as f32
}

/// Pairwise BEV IoU between `(n, 7+)` and `(m, 7+)` boxes.
pub fn boxes_iou_bev(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>) -> BoxRefineResult<Array2<f32>> {
    check_boxes_2d("boxes_iou_bev lhs", a)?;
    check_boxes_2d("boxes_iou_bev rhs", b)?;
    let bev_b: Vec<BevBox> = b.rows().into_iter().map(BevBox::from_row).collect();
    let mut out = Array2::zeros((a.nrows(), b.nrows()));
    for (i, row) in a.rows().into_iter().enumerate() {
        let bev_a = BevBox::from_row(row);
        for (j, other) in bev_b.iter().enumerate() {
            out[[i, j]] = bev_a.iou(other);
        }
    }
    Ok(out)
}

/// Pairwise 3D IoU between `(n, 7+)` and `(m, 7+)` boxes.
pub fn boxes_iou3d(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>) -> BoxRefineResult<Array2<f32>> {
    check_boxes_2d("boxes_iou3d lhs", a)?;
    check_boxes_2d("boxes_iou3d rhs", b)?;
    let mut out = Array2::zeros((a.nrows(), b.nrows()));
    for (i, row_a) in a.rows().into_iter().enumerate() {
        for (j, row_b) in b.rows().into_iter().enumerate() {
            out[[i, j]] = iou3d_rows(row_a, row_b);
        }
    }
    Ok(out)
}
