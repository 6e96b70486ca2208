//! Anchor-relative residual coder.
//!
//! Centers are encoded as offsets scaled by the anchor BEV diagonal (x, y) and
//! the anchor height (z), dimensions as log ratios and heading as a plain
//! difference or as `(cos, sin)` differences. Extra dims are differences.

use ndarray::{Array3, ArrayView3, Axis, Zip};

use crate::coder::{check_pair, BoxCoder, CoderConfig};
use crate::util::BoxRefineResult;

const MIN_DIM: f32 = 1e-5;

/// Residual coder over `(x, y, z, dx, dy, dz, heading, extra...)` boxes.
#[derive(Clone, Copy, Debug)]
pub struct ResidualCoder {
    cfg: CoderConfig,
}

impl ResidualCoder {
    /// Creates a coder after validating the config.
    pub fn new(cfg: CoderConfig) -> BoxRefineResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Returns the coder configuration.
    pub fn config(&self) -> CoderConfig {
        self.cfg
    }

    /// Encodes one box against one anchor into `out`.
    pub(crate) fn encode_row(&self, g: &[f32], a: &[f32], out: &mut [f32]) {
        let dxa = a[3].max(MIN_DIM);
        let dya = a[4].max(MIN_DIM);
        let dza = a[5].max(MIN_DIM);
        let diag = (dxa * dxa + dya * dya).sqrt();

        out[0] = (g[0] - a[0]) / diag;
        out[1] = (g[1] - a[1]) / diag;
        out[2] = (g[2] - a[2]) / dza;
        out[3] = (g[3].max(MIN_DIM) / dxa).ln();
        out[4] = (g[4].max(MIN_DIM) / dya).ln();
        out[5] = (g[5].max(MIN_DIM) / dza).ln();

        let extra_start = if self.cfg.encode_angle_by_sincos {
            out[6] = g[6].cos() - a[6].cos();
            out[7] = g[6].sin() - a[6].sin();
            8
        } else {
            out[6] = g[6] - a[6];
            7
        };
        for (k, slot) in out[extra_start..].iter_mut().enumerate() {
            *slot = g[7 + k] - a[7 + k];
        }
    }

    /// Decodes one delta row against one anchor into `out`.
    pub(crate) fn decode_row(&self, t: &[f32], a: &[f32], out: &mut [f32]) {
        let diag = (a[3] * a[3] + a[4] * a[4]).sqrt();

        out[0] = t[0] * diag + a[0];
        out[1] = t[1] * diag + a[1];
        out[2] = t[2] * a[5] + a[2];
        out[3] = t[3].exp() * a[3];
        out[4] = t[4].exp() * a[4];
        out[5] = t[5].exp() * a[5];

        let extra_start = if self.cfg.encode_angle_by_sincos {
            let cos = t[6] + a[6].cos();
            let sin = t[7] + a[6].sin();
            out[6] = sin.atan2(cos);
            8
        } else {
            out[6] = t[6] + a[6];
            7
        };
        for (k, slot) in out[7..].iter_mut().enumerate() {
            *slot = t[extra_start + k] + a[7 + k];
        }
    }
}

impl BoxCoder for ResidualCoder {
    fn code_size(&self) -> usize {
        self.cfg.code_size()
    }

    fn box_dim(&self) -> usize {
        self.cfg.box_dim
    }

    fn encode(&self, boxes: ArrayView3<'_, f32>, refs: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>> {
        let box_dim = self.cfg.box_dim;
        check_pair("residual encode", boxes, box_dim, refs, box_dim)?;
        let (b, n, _) = boxes.dim();
        let mut out = Array3::zeros((b, n, self.code_size()));
        let mut buf = vec![0.0f32; self.code_size()];
        Zip::from(out.lanes_mut(Axis(2)))
            .and(boxes.lanes(Axis(2)))
            .and(refs.lanes(Axis(2)))
            .for_each(|mut dst, g, a| {
                let g = g.to_vec();
                let a = a.to_vec();
                self.encode_row(&g, &a, &mut buf);
                for (d, v) in dst.iter_mut().zip(buf.iter()) {
                    *d = *v;
                }
            });
        Ok(out)
    }

    fn decode(&self, deltas: ArrayView3<'_, f32>, refs: ArrayView3<'_, f32>) -> BoxRefineResult<Array3<f32>> {
        let box_dim = self.cfg.box_dim;
        check_pair("residual decode", deltas, self.code_size(), refs, box_dim)?;
        let (b, n, _) = deltas.dim();
        let mut out = Array3::zeros((b, n, box_dim));
        let mut buf = vec![0.0f32; box_dim];
        Zip::from(out.lanes_mut(Axis(2)))
            .and(deltas.lanes(Axis(2)))
            .and(refs.lanes(Axis(2)))
            .for_each(|mut dst, t, a| {
                let t = t.to_vec();
                let a = a.to_vec();
                self.decode_row(&t, &a, &mut buf);
                for (d, v) in dst.iter_mut().zip(buf.iter()) {
                    *d = *v;
                }
            });
        Ok(out)
    }
}
