//! Scalar helpers for angles, logits and frame rotations.

/// Reduces `value` into `[-offset * period, (1 - offset) * period)`.
pub(crate) fn limit_period(value: f32, offset: f32, period: f32) -> f32 {
    value - (value / period + offset).floor() * period
}

/// Logistic sigmoid.
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softmax over `logits`, written into `out`.
pub(crate) fn softmax_into(logits: &[f32], out: &mut Vec<f32>) {
    out.clear();
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for &v in logits {
        let e = (v - max).exp();
        out.push(e);
        sum += e;
    }
    if sum > 0.0 {
        for v in out.iter_mut() {
            *v /= sum;
        }
    }
}

/// Index of the first maximum in `values`; `None` when empty.
pub(crate) fn argmax(values: impl IntoIterator<Item = f32>) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, v) in values.into_iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((idx, v)),
        }
    }
    best
}

/// Rotates `(x, y)` as a row vector multiplied by `[[cos, -sin], [sin, cos]]`.
///
/// This is the ROI-frame convention: `(x cos + y sin, -x sin + y cos)`.
/// Rotating by `angle` and then by `-angle` is the identity.
pub(crate) fn rotate_row_xy(x: f32, y: f32, angle: f32) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    (x * cos + y * sin, -x * sin + y * cos)
}
