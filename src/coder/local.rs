//! Proposal-local coder used by the refinement stage.
//!
//! Refinement deltas are expressed in each proposal's canonical frame: the
//! proposal center sits at the origin and offsets are rotated by the proposal
//! heading plus a quarter turn. Decoding therefore runs in three ordered steps:
//! decode against the zero-centered proposal, rotate the decoded center back by
//! the proposal heading, then re-add the proposal's world center.

use std::f32::consts::FRAC_PI_2;

use ndarray::{Array3, ArrayView3, Axis, Zip};

use crate::coder::{check_pair, BoxCoder, CoderConfig, ResidualCoder};
use crate::geometry::HEADING;
use crate::util::math::rotate_row_xy;
use crate::util::BoxRefineResult;

/// Residual coding relative to zero-centered, heading-aligned proposals.
#[derive(Clone, Copy, Debug)]
pub struct ProposalLocalCoder {
    inner: ResidualCoder,
}

impl ProposalLocalCoder {
    /// Creates a coder after validating the config.
    pub fn new(cfg: CoderConfig) -> BoxRefineResult<Self> {
        Ok(Self {
            inner: ResidualCoder::new(cfg)?,
        })
    }

    /// Returns the wrapped residual coder.
    pub fn residual(&self) -> &ResidualCoder {
        &self.inner
    }
}

fn frame_angle(roi_heading: f32) -> f32 {
    roi_heading + FRAC_PI_2
}

impl BoxCoder for ProposalLocalCoder {
    fn code_size(&self) -> usize {
        self.inner.code_size()
    }

    fn box_dim(&self) -> usize {
        self.inner.box_dim()
    }

    fn encode(&self, boxes: ArrayView3<'_, f32>, rois: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>> {
        let box_dim = self.box_dim();
        check_pair("local encode", boxes, box_dim, rois, box_dim)?;
        let (b, n, _) = boxes.dim();
        let code_size = self.code_size();
        let mut out = Array3::zeros((b, n, code_size));
        let mut local_box = vec![0.0f32; box_dim];
        let mut local_roi = vec![0.0f32; box_dim];
        let mut buf = vec![0.0f32; code_size];
        Zip::from(out.lanes_mut(Axis(2)))
            .and(boxes.lanes(Axis(2)))
            .and(rois.lanes(Axis(2)))
            .for_each(|mut dst, g, roi| {
                for (k, (slot_box, slot_roi)) in local_box.iter_mut().zip(local_roi.iter_mut()).enumerate() {
                    *slot_box = g[k];
                    *slot_roi = roi[k];
                }
                let (ox, oy) = rotate_row_xy(
                    g[0] - roi[0],
                    g[1] - roi[1],
                    -frame_angle(roi[HEADING]),
                );
                local_box[0] = ox;
                local_box[1] = oy;
                local_box[2] = g[2] - roi[2];
                local_roi[0] = 0.0;
                local_roi[1] = 0.0;
                local_roi[2] = 0.0;
                self.inner.encode_row(&local_box, &local_roi, &mut buf);
                for (d, v) in dst.iter_mut().zip(buf.iter()) {
                    *d = *v;
                }
            });
        Ok(out)
    }

    fn decode(&self, deltas: ArrayView3<'_, f32>, rois: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>> {
        let box_dim = self.box_dim();
        check_pair("local decode", deltas, self.code_size(), rois, box_dim)?;
        let (b, n, _) = deltas.dim();
        let mut out = Array3::zeros((b, n, box_dim));
        let mut local_roi = vec![0.0f32; box_dim];
        let mut buf = vec![0.0f32; box_dim];
        Zip::from(out.lanes_mut(Axis(2)))
            .and(deltas.lanes(Axis(2)))
            .and(rois.lanes(Axis(2)))
            .for_each(|mut dst, t, roi| {
                for (k, slot) in local_roi.iter_mut().enumerate() {
                    *slot = if k < 3 { 0.0 } else { roi[k] };
                }
                let t = t.to_vec();
                self.inner.decode_row(&t, &local_roi, &mut buf);
                let (wx, wy) = rotate_row_xy(buf[0], buf[1], frame_angle(roi[HEADING]));
                buf[0] = wx + roi[0];
                buf[1] = wy + roi[1];
                buf[2] += roi[2];
                for (d, v) in dst.iter_mut().zip(buf.iter()) {
                    *d = *v;
                }
            });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::ProposalLocalCoder;
    use crate::coder::{BoxCoder, CoderConfig};
    use ndarray::{arr3, Array3};

    #[test]
    fn zero_deltas_return_the_proposal() {
        let coder = ProposalLocalCoder::new(CoderConfig::default()).unwrap();
        let rois = arr3(&[[[10.0f32, -4.0, 0.5, 4.0, 1.8, 1.5, 1.1]]]);
        let boxes = coder.decode(Array3::zeros((1, 1, 7)).view(), rois.view()).unwrap();
        for (a, b) in boxes.iter().zip(rois.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn forward_offset_follows_roi_heading() {
        let coder = ProposalLocalCoder::new(CoderConfig::default()).unwrap();
        // heading -pi/2 makes the frame angle zero, so local x maps to world x
        let rois = arr3(&[[[1.0f32, 1.0, 0.0, 3.0, 4.0, 2.0, -std::f32::consts::FRAC_PI_2]]]);
        let mut deltas = Array3::zeros((1, 1, 7));
        deltas[[0, 0, 0]] = 1.0;
        let boxes = coder.decode(deltas.view(), rois.view()).unwrap();
        assert!((boxes[[0, 0, 0]] - 6.0).abs() < 1e-5);
        assert!((boxes[[0, 0, 1]] - 1.0).abs() < 1e-5);
    }
}
