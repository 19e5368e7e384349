// ── Recall: Reciprocal Rank Fusion ──────────────────────────────────────────
//
// Merges the full-text and vector rankings into one list.
//
//   score(id) = Σ over arms containing id of 1 / (k + rank)     (rank is 1-based)
//
// An id found by both arms collects both terms, so it outranks an id found by
// one arm at the same position. Fusion is a pure function of the two inputs.

use crate::atoms::recall_types::RankedCandidate;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Which retrieval arm produced a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchArm {
    Text,
    Vector,
}

#[inline]
fn rrf_term(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

/// Fuse two ranked id lists and keep the top `top_k`.
///
/// Ties are broken deterministically: dual-arm presence first, then best
/// single rank, then first-seen order (text arm before vector arm).
/// A duplicate id inside one arm keeps its first (best) rank.
pub fn reciprocal_rank_fusion(
    text_ids: &[String],
    vector_ids: &[String],
    k: f64,
    top_k: usize,
) -> Vec<RankedCandidate> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(text_ids.len() + vector_ids.len());
    let mut fused: Vec<RankedCandidate> = Vec::with_capacity(text_ids.len() + vector_ids.len());

    for (pos, id) in text_ids.iter().enumerate() {
        if index.contains_key(id.as_str()) {
            continue;
        }
        index.insert(id.as_str(), fused.len());
        fused.push(RankedCandidate {
            id: id.clone(),
            text_rank: Some(pos + 1),
            vector_rank: None,
            score: rrf_term(k, pos + 1),
        });
    }

    for (pos, id) in vector_ids.iter().enumerate() {
        match index.get(id.as_str()) {
            Some(&i) => {
                let entry = &mut fused[i];
                if entry.vector_rank.is_none() {
                    entry.vector_rank = Some(pos + 1);
                    entry.score += rrf_term(k, pos + 1);
                }
            }
            None => {
                index.insert(id.as_str(), fused.len());
                fused.push(RankedCandidate {
                    id: id.clone(),
                    text_rank: None,
                    vector_rank: Some(pos + 1),
                    score: rrf_term(k, pos + 1),
                });
            }
        }
    }

    // `sort_by` is stable, so full ties keep first-seen order.
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.in_both_arms().cmp(&a.in_both_arms()))
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
    });
    fused.truncate(top_k);
    fused
}

/// Single-arm pass-through: truncate to `top_k`, fill only that arm's rank.
pub fn single_arm(ids: &[String], arm: SearchArm, k: f64, top_k: usize) -> Vec<RankedCandidate> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .take(top_k)
        .enumerate()
        .map(|(pos, id)| {
            let rank = Some(pos + 1);
            let (text_rank, vector_rank) = match arm {
                SearchArm::Text => (rank, None),
                SearchArm::Vector => (None, rank),
            };
            RankedCandidate { id: id.clone(), text_rank, vector_rank, score: rrf_term(k, pos + 1) }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
