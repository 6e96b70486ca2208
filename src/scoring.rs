//! Per-anchor class scoring shared by proposal generation and prediction.
//!
//! Class index 0 is background when it is encoded explicitly and is never
//! scored. Output labels are 1-based; 0 is reserved for background/padding.

use ndarray::{s, Array2, ArrayView2};

use crate::util::math::{argmax, sigmoid, softmax_into};
use crate::util::{BoxRefineError, BoxRefineResult};

/// How classification logits turn into foreground scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreConfig {
    /// Logits carry no background column.
    pub encode_bg_as_zeros: bool,
    /// Sigmoid scores; softmax otherwise.
    pub use_sigmoid_score: bool,
    /// Run NMS per class instead of on the best class per anchor.
    pub use_multi_classes_nms: bool,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            encode_bg_as_zeros: true,
            use_sigmoid_score: true,
            use_multi_classes_nms: false,
        }
    }
}

impl ScoreConfig {
    pub(crate) fn validate(&self) -> BoxRefineResult<()> {
        if self.encode_bg_as_zeros && !self.use_sigmoid_score {
            return Err(BoxRefineError::unsupported(
                "score mode",
                "softmax scoring without a background class",
            ));
        }
        Ok(())
    }

    /// Width of the logit tensor for `num_classes` foreground classes.
    pub fn logit_width(&self, num_classes: usize) -> usize {
        if self.encode_bg_as_zeros {
            num_classes
        } else {
            num_classes + 1
        }
    }

    /// Scores one scene's `(A, C')` logits.
    pub fn score(&self, logits: ArrayView2<'_, f32>, num_classes: usize) -> BoxRefineResult<ClassScores> {
        let (anchors, width) = logits.dim();
        let expected = self.logit_width(num_classes);
        if width != expected {
            return Err(BoxRefineError::shape("class logits", &[anchors, expected], &[anchors, width]));
        }

        if self.encode_bg_as_zeros {
            return Ok(ClassScores {
                scores: logits.mapv(sigmoid),
                raw: logits.to_owned(),
            });
        }

        let raw = logits.slice(s![.., 1..]).to_owned();
        let scores = if self.use_sigmoid_score {
            raw.mapv(sigmoid)
        } else {
            let mut scores = Array2::zeros((anchors, num_classes));
            let mut probs = Vec::with_capacity(width);
            for (mut dst, row) in scores.rows_mut().into_iter().zip(logits.rows()) {
                let row = row.to_vec();
                softmax_into(&row, &mut probs);
                for (d, p) in dst.iter_mut().zip(probs.iter().skip(1)) {
                    *d = *p;
                }
            }
            scores
        };
        Ok(ClassScores { scores, raw })
    }
}

/// Foreground scores and raw logits, both `(A, num_classes)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassScores {
    pub scores: Array2<f32>,
    pub raw: Array2<f32>,
}

/// Best foreground class per anchor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BestClass {
    pub scores: Vec<f32>,
    pub raw: Vec<f32>,
    /// 1-based labels.
    pub labels: Vec<usize>,
}

impl ClassScores {
    /// Number of scored anchors.
    pub fn len(&self) -> usize {
        self.scores.nrows()
    }

    /// Returns true when no anchor is scored.
    pub fn is_empty(&self) -> bool {
        self.scores.nrows() == 0
    }

    /// Collapses to the best class per anchor with labels in `[1, C]`.
    pub fn best_class(&self) -> BestClass {
        let mut best = BestClass::default();
        for (row, raw_row) in self.scores.rows().into_iter().zip(self.raw.rows()) {
            let (label, score) = argmax(row.iter().copied()).unwrap_or((0, 0.0));
            let raw = raw_row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            best.scores.push(score);
            best.raw.push(raw);
            best.labels.push(label + 1);
        }
        best
    }
}
