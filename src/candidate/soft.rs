//! Soft non-maximum suppression on BEV footprints.

use ndarray::ArrayView2;

use crate::candidate::nms::{bev_boxes, check_scores, SoftDecay};
use crate::util::BoxRefineResult;

/// Kept indices and their decayed scores, best first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SoftNmsResult {
    pub keep: Vec<usize>,
    pub scores: Vec<f32>,
}

/// Soft NMS.
///
/// Repeatedly keeps the highest remaining score (ties by index), decays the
/// scores of the remaining boxes by `decay` of their IoU with it, and drops
/// boxes whose score falls below `score_thresh`. Stops when no candidate
/// remains or `max_keep` boxes are kept. Decayed scores never exceed the
/// originals.
pub fn soft_nms_rotated(
    boxes: ArrayView2<'_, f32>,
    scores: &[f32],
    decay: SoftDecay,
    score_thresh: f32,
    max_keep: usize,
) -> BoxRefineResult<SoftNmsResult> {
    check_scores("soft_nms_rotated", boxes, scores)?;
    decay.validate()?;
    let mut out = SoftNmsResult::default();
    if scores.is_empty() || max_keep == 0 {
        return Ok(out);
    }

    let bev = bev_boxes(boxes);
    let mut current = scores.to_vec();
    let mut remaining: Vec<usize> = (0..scores.len())
        .filter(|&i| current[i] >= score_thresh)
        .collect();

    while !remaining.is_empty() && out.keep.len() < max_keep {
        let mut best_pos = 0usize;
        for (pos, &idx) in remaining.iter().enumerate().skip(1) {
            let best = remaining[best_pos];
            if current[idx] > current[best] || (current[idx] == current[best] && idx < best) {
                best_pos = pos;
            }
        }
        let best = remaining.swap_remove(best_pos);
        out.keep.push(best);
        out.scores.push(current[best]);

        for &idx in remaining.iter() {
            let w = decay.weight(bev[best].iou(&bev[idx])).clamp(0.0, 1.0);
            current[idx] *= w;
        }
        remaining.retain(|&idx| current[idx] >= score_thresh);
    }

    Ok(out)
}
