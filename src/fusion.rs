// Reciprocal Rank Fusion
//
// Implements RRF as described in:
//     Cormack, Clarke & Buettcher (2009) "Reciprocal Rank Fusion outperforms
//     Condorcet and individual Rank Learning Methods"
//
// A document's score is the sum of 1/(k + rank) over every ranked list that
// contains it; missing lists contribute 0. Kept dependency-free and testable
// in isolation.

use std::collections::HashMap;

use crate::store::RetrievedNote;

/// Smoothing constant from the original paper. Larger values make ranks more
/// uniform; smaller values amplify top ranks.
pub const RRF_K: f64 = 60.0;

/// Fuse any number of ranked lists, best-first each, into a single list
/// sorted by descending RRF score. Every returned document keeps the fields
/// of its first occurrence and carries its score in `rrf_score`. A single
/// input list passes through with its order preserved; empty input yields
/// empty output.
pub fn reciprocal_rank_fusion(
    ranked_lists: Vec<Vec<RetrievedNote>>,
    k: f64,
) -> Vec<RetrievedNote> {
    let list_count = ranked_lists.len();
    let mut scores: HashMap<i64, f64> = HashMap::new();
    let mut docs: HashMap<i64, RetrievedNote> = HashMap::new();
    let mut first_seen: Vec<i64> = Vec::new();

    for ranked_list in ranked_lists {
        for (rank_0based, doc) in ranked_list.into_iter().enumerate() {
            *scores.entry(doc.id).or_insert(0.0) += 1.0 / (k + rank_0based as f64 + 1.0);
            docs.entry(doc.id).or_insert_with(|| {
                first_seen.push(doc.id);
                doc
            });
        }
    }

    // Stable sort keeps first-seen order among ties
    first_seen.sort_by(|a, b| {
        let sa = scores.get(a).copied().unwrap_or(0.0);
        let sb = scores.get(b).copied().unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut result = Vec::with_capacity(first_seen.len());
    for doc_id in first_seen {
        if let Some(mut doc) = docs.remove(&doc_id) {
            doc.rrf_score = scores.get(&doc_id).copied();
            result.push(doc);
        }
    }

    log::debug!(
        "[fusion] RRF: {} input lists fused into {} unique docs",
        list_count,
        result.len()
    );
    result
}
