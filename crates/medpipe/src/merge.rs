//! Context merger: dedup, rank, and budget the combined evidence into a
//! stable source registry. Record indices assigned here are the only valid
//! citation keys for the rest of the query's lifetime.

use medpipe_core::{ContentChunk, MergedContext, RetrievalResult, SourceRecord};
use std::collections::HashMap;

/// Characters of excerpt carried on each source record for citation display.
const EXCERPT_CHARS: usize = 280;

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Evidence text for one result: ranked chunk texts when the fetch pool
/// produced any, otherwise the result's own content or snippet.
fn text_for(result: &RetrievalResult, chunks: &[ContentChunk]) -> Option<String> {
    let own: Vec<&str> = chunks
        .iter()
        .filter(|c| c.result_uri == result.uri_or_id)
        .map(|c| c.text.as_str())
        .collect();
    if !own.is_empty() {
        return Some(own.join("\n\n"));
    }
    result.best_text().map(|s| s.to_string())
}

pub fn merge(
    results: &[RetrievalResult],
    chunks: &[ContentChunk],
    budget_chars: usize,
) -> MergedContext {
    // Dedup keeps the highest-scoring instance per key; ties keep the first.
    let mut kept: Vec<(usize, &RetrievalResult)> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (orig_idx, r) in results.iter().enumerate() {
        let key = r.dedup_key();
        match by_key.get(&key) {
            Some(&slot) => {
                if r.relevance_score > kept[slot].1.relevance_score {
                    kept[slot] = (orig_idx, r);
                }
            }
            None => {
                by_key.insert(key, kept.len());
                kept.push((orig_idx, r));
            }
        }
    }

    // Score desc, then recency desc, then original provider order.
    kept.sort_by(|(ia, a), (ib, b)| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.fetched_at_epoch_s.cmp(&a.fetched_at_epoch_s))
            .then_with(|| ia.cmp(ib))
    });

    let mut records = Vec::with_capacity(kept.len());
    let mut context = String::new();
    let mut used = 0usize;
    let mut budget_reached = false;

    for (index, (_, r)) in kept.iter().enumerate() {
        let text = text_for(r, chunks);
        let label = r
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&r.uri_or_id);

        let mut in_context = false;
        if !budget_reached {
            let body = text.as_deref().unwrap_or("");
            let header = format!("[{index}] {label}\n");
            let block_len = header.chars().count() + body.chars().count() + 2;
            if used == 0 {
                // The top record always contributes, clipped to the budget.
                let room = budget_chars.saturating_sub(header.chars().count() + 2);
                context.push_str(&header);
                context.push_str(&truncate_chars(body, room));
                context.push_str("\n\n");
                used = context.chars().count();
                in_context = true;
            } else if used + block_len <= budget_chars {
                context.push_str(&header);
                context.push_str(body);
                context.push_str("\n\n");
                used += block_len;
                in_context = true;
            } else {
                budget_reached = true;
            }
        }

        records.push(SourceRecord {
            index,
            kind: r.kind,
            uri_or_id: r.uri_or_id.clone(),
            title: r.title.clone(),
            excerpt: text.as_deref().map(|t| truncate_chars(t.trim(), EXCERPT_CHARS)),
            score: r.relevance_score,
            in_context,
        });
    }

    MergedContext {
        records,
        context_text: context,
    }
}
