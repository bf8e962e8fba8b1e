//! Reciprocal Rank Fusion over the lexical and vector candidate lists.
//!
//! Raw lexical and vector scores live on incomparable scales, so fusion is
//! rank-based only: each list contributes `1 / (rank_constant + rank)` per
//! candidate, absence contributes nothing. Linear combination of raw
//! scores is deliberately not offered.

use std::collections::HashMap;

use gentab_index::Hit;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub row_id: String,
    pub fts_score: Option<f32>,
    pub vec_score: Option<f32>,
    pub fused: f32,
}

impl FusedHit {
    fn best_raw(&self) -> f32 {
        let a = self.fts_score.unwrap_or(f32::MIN);
        let b = self.vec_score.unwrap_or(f32::MIN);
        a.max(b)
    }
}

/// Fuse the two ranked lists. The output is deduplicated by chunk
/// identity, sorted by fused score descending with ties broken by the
/// higher raw score and then by first-appearance order, which makes
/// repeated fusions of the same inputs byte-identical.
pub fn fuse(fts: &[Hit], vec: &[Hit], rank_constant: f32) -> Vec<FusedHit> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, FusedHit> = HashMap::new();

    for (rank, hit) in fts.iter().enumerate() {
        let entry = by_id.entry(hit.row_id.clone()).or_insert_with(|| {
            order.push(hit.row_id.clone());
            FusedHit { row_id: hit.row_id.clone(), fts_score: None, vec_score: None, fused: 0.0 }
        });
        entry.fts_score = Some(hit.score);
        entry.fused += 1.0 / (rank_constant + (rank + 1) as f32);
    }
    for (rank, hit) in vec.iter().enumerate() {
        let entry = by_id.entry(hit.row_id.clone()).or_insert_with(|| {
            order.push(hit.row_id.clone());
            FusedHit { row_id: hit.row_id.clone(), fts_score: None, vec_score: None, fused: 0.0 }
        });
        entry.vec_score = Some(hit.score);
        entry.fused += 1.0 / (rank_constant + (rank + 1) as f32);
    }

    // Collect in first-appearance order, then stable-sort: full ties keep
    // that order.
    let mut out: Vec<FusedHit> = order
        .iter()
        .filter_map(|id| by_id.get(id).cloned())
        .collect();
    out.sort_by(|a, b| {
        b.fused
            .total_cmp(&a.fused)
            .then_with(|| b.best_raw().total_cmp(&a.best_raw()))
    });
    out
}
