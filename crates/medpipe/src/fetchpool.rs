//! Fetch & extract pool: bounded-concurrency page hydration for one
//! retrieval round, joined under a round deadline.
//!
//! The semaphore is process-wide (shared across concurrent queries); the
//! round deadline belongs to the query. Stragglers are aborted, not awaited.

use crate::PipelineConfig;
use medpipe_core::{
    ContentChunk, EmbeddingBackend, FetchBackend, FetchCachePolicy, FetchRequest, Result,
    RetrievalResult, SearchHit, SourceKind,
};
use medpipe_local::{embed::cosine, extract, semantic};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct WebCandidate {
    pub kind: SourceKind,
    pub hit: SearchHit,
    /// Rank-normalized provider score.
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub results: Vec<RetrievalResult>,
    pub chunks: Vec<ContentChunk>,
    /// Candidates lost to fetch errors, per-item timeouts, or the round
    /// deadline.
    pub dropped: usize,
}

fn epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Embed the query up front so each task only embeds its own chunks.
/// Any failure here simply disables the rerank for the round.
async fn query_embedding(
    embedder: &Option<Arc<dyn EmbeddingBackend>>,
    query: &str,
) -> Option<Arc<Vec<f32>>> {
    let embedder = embedder.as_ref()?;
    match tokio::time::timeout(Duration::from_millis(3_000), embedder.embed(query)).await {
        Ok(Ok(v)) => Some(Arc::new(v)),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "query embedding failed; using lexical chunk order");
            None
        }
        Err(_) => {
            tracing::debug!("query embedding timed out; using lexical chunk order");
            None
        }
    }
}

async fn hydrate_one(
    fetcher: Arc<dyn FetchBackend>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    query_vec: Option<Arc<Vec<f32>>>,
    query: String,
    candidate: WebCandidate,
    config: PoolKnobs,
) -> Result<(RetrievalResult, Vec<ContentChunk>)> {
    let req = FetchRequest {
        url: candidate.hit.url.clone(),
        timeout_ms: Some(config.fetch_timeout_ms),
        max_bytes: Some(config.fetch_max_bytes),
        cache: FetchCachePolicy {
            read: true,
            write: true,
            ttl_s: Some(config.fetch_cache_ttl_s),
        },
    };
    // The request carries its own timeout; this outer one also covers
    // extraction so a pathological page cannot hold a permit forever.
    let resp = tokio::time::timeout(
        Duration::from_millis(config.fetch_timeout_ms + 1_000),
        fetcher.fetch(&req),
    )
    .await
    .map_err(|_| medpipe_core::Error::Fetch(format!("fetch timed out: {}", req.url)))??;

    let text = extract::readable_text(&resp, config.extract_width, config.min_extract_chars);

    let mut chunks = Vec::new();
    if let Some(text) = &text {
        let mut scored = semantic::best_chunks_for_query(
            text,
            &query,
            config.chunk_top_k,
            config.max_chunk_chars,
        );
        if scored.is_empty() {
            // No query overlap at all: keep the leading paragraphs so the
            // page still contributes context.
            scored = semantic::chunk_paragraphs(text, config.max_chunk_chars);
            scored.truncate(config.chunk_top_k);
        }

        let mut out: Vec<(f32, ContentChunk)> = Vec::with_capacity(scored.len());
        for c in scored {
            let mut chunk = ContentChunk {
                result_uri: candidate.hit.url.clone(),
                start_char: c.start_char,
                end_char: c.end_char,
                text: c.text,
                embedding: None,
            };
            let mut sim = c.score as f32;
            if let (Some(emb), Some(qv)) = (&embedder, &query_vec) {
                match tokio::time::timeout(Duration::from_millis(3_000), emb.embed(&chunk.text))
                    .await
                {
                    Ok(Ok(v)) => {
                        sim = cosine(qv, &v);
                        chunk.embedding = Some(v);
                    }
                    // Best-effort path: embedding trouble keeps lexical order.
                    Ok(Err(_)) | Err(_) => {}
                }
            }
            out.push((sim, chunk));
        }
        out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        chunks = out.into_iter().map(|(_, c)| c).collect();
    }

    let result = RetrievalResult {
        kind: candidate.kind,
        uri_or_id: candidate.hit.url,
        title: candidate.hit.title,
        snippet: candidate.hit.snippet,
        raw_content: text,
        relevance_score: candidate.score,
        fetched_at_epoch_s: epoch_s(),
    };
    Ok((result, chunks))
}

/// The subset of PipelineConfig each fetch task needs, kept Copy so tasks
/// don't borrow the config.
#[derive(Debug, Clone, Copy)]
struct PoolKnobs {
    fetch_timeout_ms: u64,
    fetch_max_bytes: u64,
    fetch_cache_ttl_s: u64,
    extract_width: usize,
    min_extract_chars: usize,
    chunk_top_k: usize,
    max_chunk_chars: usize,
}

impl From<&PipelineConfig> for PoolKnobs {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            fetch_timeout_ms: c.fetch_timeout_ms,
            fetch_max_bytes: c.fetch_max_bytes,
            fetch_cache_ttl_s: c.fetch_cache_ttl_s,
            extract_width: c.extract_width,
            min_extract_chars: c.min_extract_chars,
            chunk_top_k: c.chunk_top_k,
            max_chunk_chars: c.max_chunk_chars,
        }
    }
}

pub async fn run_round(
    fetcher: Arc<dyn FetchBackend>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    permits: Arc<Semaphore>,
    config: &PipelineConfig,
    query: &str,
    candidates: Vec<WebCandidate>,
    round_timeout: Duration,
) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();
    if candidates.is_empty() {
        return outcome;
    }

    let query_vec = query_embedding(&embedder, query).await;
    let knobs = PoolKnobs::from(config);
    let total = candidates.len();

    let mut set: JoinSet<(usize, Result<(RetrievalResult, Vec<ContentChunk>)>)> = JoinSet::new();
    for (idx, candidate) in candidates.into_iter().enumerate() {
        let fetcher = fetcher.clone();
        let embedder = embedder.clone();
        let query_vec = query_vec.clone();
        let permits = permits.clone();
        let query = query.to_string();
        set.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (
                    idx,
                    Err(medpipe_core::Error::Fetch("fetch pool closed".to_string())),
                );
            };
            (
                idx,
                hydrate_one(fetcher, embedder, query_vec, query, candidate, knobs).await,
            )
        });
    }

    let mut hydrated: Vec<(usize, RetrievalResult, Vec<ContentChunk>)> = Vec::new();
    let deadline = tokio::time::sleep(round_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::warn!("fetch round deadline hit; cancelling stragglers");
                set.abort_all();
                break;
            }
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok((idx, Ok((result, chunks))))) => hydrated.push((idx, result, chunks)),
                Some(Ok((_, Err(e)))) => {
                    tracing::warn!(error = %e, "dropping candidate after fetch failure");
                }
                Some(Err(_)) => {}
            }
        }
    }

    // Provider order back in place so downstream tie-breaks are stable.
    hydrated.sort_by_key(|(idx, _, _)| *idx);
    for (_, result, chunks) in hydrated {
        outcome.results.push(result);
        outcome.chunks.extend(chunks);
    }
    outcome.dropped = total - outcome.results.len();
    outcome
}
