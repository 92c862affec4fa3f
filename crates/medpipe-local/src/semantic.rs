//! Deterministic query-relevance chunking.
//!
//! This is the fallback ranker used when no embeddings backend is configured
//! (or when it fails): paragraph chunks scored by query-token overlap. Often
//! good enough to order evidence without a network call.

use serde::Serialize;

/// Lossy normalization used only for matching, never for display: lowercase,
/// non-alphanumerics collapse to single spaces.
pub fn scrub(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for ch in s.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn tokenize_query(query: &str) -> Vec<String> {
    let q = scrub(query);
    let mut toks: Vec<String> = q
        .split_whitespace()
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect();
    toks.sort();
    toks.dedup();
    toks
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn byte_to_char_index(s: &str, byte: usize) -> usize {
    s.get(..byte).map(|p| p.chars().count()).unwrap_or(0)
}

/// Paragraph spans (byte offsets), split on blank lines.
fn find_paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            if i > start {
                spans.push((start, i));
            }
            while i < bytes.len() && bytes[i] == b'\n' {
                i += 1;
            }
            start = i;
            continue;
        }
        i += 1;
    }
    if start < bytes.len() {
        spans.push((start, bytes.len()));
    }
    spans
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    /// Character offset into the provided `text`.
    pub start_char: usize,
    pub end_char: usize,
    /// Query tokens matched (higher is better).
    pub score: u64,
    /// Bounded chunk text.
    pub text: String,
}

/// Paragraph chunks of `text`, bounded to `max_chunk_chars`, in document
/// order. Used as embedding candidates before any scoring happens.
pub fn chunk_paragraphs(text: &str, max_chunk_chars: usize) -> Vec<ScoredChunk> {
    let max_chunk_chars = max_chunk_chars.clamp(50, 5_000);
    find_paragraph_spans(text)
        .into_iter()
        .filter_map(|(sb, eb)| {
            let slice = text.get(sb..eb).unwrap_or("").trim();
            if slice.is_empty() {
                return None;
            }
            Some(ScoredChunk {
                start_char: byte_to_char_index(text, sb),
                end_char: byte_to_char_index(text, eb),
                score: 0,
                text: truncate_chars(slice, max_chunk_chars),
            })
        })
        .collect()
}

/// Top chunks of `text` for `query`, scored by token overlap. Deterministic:
/// score desc, then start offset asc.
pub fn best_chunks_for_query(
    text: &str,
    query: &str,
    top_k: usize,
    max_chunk_chars: usize,
) -> Vec<ScoredChunk> {
    let top_k = top_k.clamp(1, 50);
    let q_toks = tokenize_query(query);
    if q_toks.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<ScoredChunk> = chunk_paragraphs(text, max_chunk_chars)
        .into_iter()
        .filter_map(|mut c| {
            let hay = scrub(&c.text);
            let score = q_toks.iter().filter(|t| hay.contains(t.as_str())).count() as u64;
            if score == 0 {
                return None;
            }
            c.score = score;
            Some(c)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.start_char.cmp(&b.start_char))
    });
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_collapses_punctuation_and_case() {
        assert_eq!(scrub("Flu-Shots: 2024!"), "flu shots 2024");
        assert_eq!(scrub("  "), "");
    }

    #[test]
    fn chunking_splits_on_blank_lines_and_bounds_text() {
        let text = "first paragraph here\n\nsecond paragraph is much longer than the cap\n\n\nthird";
        let chunks = chunk_paragraphs(text, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "first paragraph here");
        assert!(chunks[1].text.chars().count() <= 50);
        assert_eq!(chunks[2].text, "third");
        // Offsets are in document order.
        assert!(chunks[0].start_char < chunks[1].start_char);
        assert!(chunks[1].start_char < chunks[2].start_char);
    }

    #[test]
    fn best_chunks_rank_by_overlap_then_position() {
        let text = "dehydration symptoms include thirst\n\nunrelated paragraph\n\nfluids help with dehydration and thirst in children";
        let got = best_chunks_for_query(text, "dehydration thirst", 5, 500);
        assert_eq!(got.len(), 2, "zero-overlap paragraphs are dropped");
        // Equal scores: earlier paragraph wins.
        assert_eq!(got[0].score, got[1].score);
        assert!(got[0].start_char < got[1].start_char);
    }

    #[test]
    fn empty_query_yields_no_chunks() {
        assert!(best_chunks_for_query("some text", "  !!", 5, 500).is_empty());
    }

    #[test]
    fn scoring_is_deterministic_across_runs() {
        let text = "alpha beta gamma\n\nbeta gamma delta\n\ngamma delta epsilon";
        let a = best_chunks_for_query(text, "beta gamma", 3, 500);
        let b = best_chunks_for_query(text, "beta gamma", 3, 500);
        let ka: Vec<(usize, u64)> = a.iter().map(|c| (c.start_char, c.score)).collect();
        let kb: Vec<(usize, u64)> = b.iter().map(|c| (c.start_char, c.score)).collect();
        assert_eq!(ka, kb);
    }

    proptest::proptest! {
        #[test]
        fn scrub_is_idempotent_and_ascii_lowercase_safe(s in ".*") {
            let once = scrub(&s);
            // Re-scrubbing scrubbed text changes nothing.
            proptest::prop_assert_eq!(&scrub(&once), &once);
            proptest::prop_assert!(!once.starts_with(' ') && !once.ends_with(' '));
            proptest::prop_assert!(!once.contains("  "));
        }

        #[test]
        fn chunking_never_panics_and_respects_bounds(
            s in ".*",
            cap in 50usize..2_000,
        ) {
            for c in chunk_paragraphs(&s, cap) {
                proptest::prop_assert!(c.text.chars().count() <= cap);
                proptest::prop_assert!(c.start_char <= c.end_char);
            }
        }
    }
}
