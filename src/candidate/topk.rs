//! Deterministic top-K selection over scored candidates.

use std::cmp::Ordering;

/// Candidate index paired with its ranking score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scored {
    /// Index into the caller's candidate array.
    pub index: usize,
    /// Ranking score (raw logit or calibrated score).
    pub score: f32,
}

fn scored_cmp_desc(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.index.cmp(&b.index))
}

/// Sorts candidates by descending score with ties broken by index.
pub(crate) fn sort_scored_desc(items: &mut [Scored]) {
    items.sort_by(scored_cmp_desc);
}

/// Keeps the `k` best candidates, sorted by descending score.
pub(crate) fn top_k_desc(mut items: Vec<Scored>, k: usize) -> Vec<Scored> {
    if k == 0 {
        return Vec::new();
    }
    if items.len() > k {
        items.select_nth_unstable_by(k - 1, scored_cmp_desc);
        items.truncate(k);
    }
    sort_scored_desc(&mut items);
    items
}

/// Pairs every score with its index.
pub(crate) fn enumerate_scores(scores: &[f32]) -> Vec<Scored> {
    scores
        .iter()
        .enumerate()
        .map(|(index, &score)| Scored { index, score })
        .collect()
}
