//! Heading disambiguation from direction-classification bins.

use std::f32::consts::{FRAC_PI_4, PI};

use ndarray::{ArrayView3, ArrayViewMut3, Axis, Zip};

use crate::geometry::HEADING;
use crate::util::math::{argmax, limit_period};
use crate::util::{BoxRefineError, BoxRefineResult};

/// Direction bin parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DirectionConfig {
    /// Number of bins splitting `[0, 2π)`.
    pub num_bins: usize,
    /// Angle subtracted before period reduction.
    pub dir_offset: f32,
    /// Fraction of the period placed below zero after reduction.
    pub dir_limit_offset: f32,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self {
            num_bins: 2,
            dir_offset: FRAC_PI_4,
            dir_limit_offset: 0.0,
        }
    }
}

/// Resolves the heading of decoded boxes using direction logits.
#[derive(Clone, Copy, Debug)]
pub struct DirectionRefiner {
    cfg: DirectionConfig,
    period: f32,
}

impl DirectionRefiner {
    /// Creates a refiner; `num_bins` must be positive.
    pub fn new(cfg: DirectionConfig) -> BoxRefineResult<Self> {
        if cfg.num_bins == 0 {
            return Err(BoxRefineError::InvalidConfig {
                reason: "num_bins must be > 0",
            });
        }
        Ok(Self {
            cfg,
            period: 2.0 * PI / cfg.num_bins as f32,
        })
    }

    /// Width of one bin in radians.
    pub fn period(&self) -> f32 {
        self.period
    }

    /// Maps `heading` into the period selected by `bin`.
    pub fn resolve(&self, heading: f32, bin: usize) -> f32 {
        let reduced = limit_period(heading - self.cfg.dir_offset, self.cfg.dir_limit_offset, self.period);
        reduced + self.cfg.dir_offset + self.period * bin as f32
    }

    /// Rewrites the heading column of `(B, A, 7+)` boxes in place from
    /// `(B, A, num_bins)` logits.
    pub fn apply(&self, mut boxes: ArrayViewMut3<'_, f32>, dir_logits: ArrayView3<'_, f32>) -> BoxRefineResult<()> {
        let (b, a, width) = boxes.dim();
        let (lb, la, bins) = dir_logits.dim();
        if width <= HEADING {
            return Err(BoxRefineError::shape("direction boxes", &[b, a, HEADING + 1], &[b, a, width]));
        }
        if lb != b || la != a || bins != self.cfg.num_bins {
            return Err(BoxRefineError::shape(
                "direction logits",
                &[b, a, self.cfg.num_bins],
                &[lb, la, bins],
            ));
        }

        Zip::from(boxes.lanes_mut(Axis(2)))
            .and(dir_logits.lanes(Axis(2)))
            .for_each(|mut row, logits| {
                let bin = argmax(logits.iter().copied()).map_or(0, |(idx, _)| idx);
                row[HEADING] = self.resolve(row[HEADING], bin);
            });
        Ok(())
    }
}
