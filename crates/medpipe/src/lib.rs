//! Hybrid retrieval-augmented answer pipeline.
//!
//! Evidence comes from a local document index and, when the local hits are
//! not convincing enough, from live web search; the merged evidence is fed to
//! a routed generation model and the structured, cited answer is streamed
//! back to the caller.

pub mod answer;
pub mod fetchpool;
pub mod gate;
pub mod merge;
pub mod pipeline;
pub mod router;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

/// Pipeline tunables. The defaults are starting points, not contracts; every
/// field has a `MEDPIPE_*` environment override.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Results requested from the local knowledge store.
    pub local_top_k: usize,
    /// Confidence gate score threshold (τ).
    pub gate_tau: f64,
    /// Confidence gate minimum hit count (k).
    pub gate_min_hits: usize,
    /// Web candidates fetched per retrieval round (N).
    pub max_web_candidates: usize,
    /// Permits in the process-wide fetch pool.
    pub fetch_pool_size: usize,
    /// Per-page fetch timeout.
    pub fetch_timeout_ms: u64,
    /// Deadline for one whole fetch round; stragglers are cancelled.
    pub fetch_round_timeout_ms: u64,
    /// Byte cap per fetched page.
    pub fetch_max_bytes: u64,
    /// TTL for the on-disk page cache.
    pub fetch_cache_ttl_s: u64,
    /// Timeout for each source-client call (local store, search providers).
    pub source_timeout_ms: u64,
    /// Wall-clock budget for the whole pipeline run.
    pub overall_budget_ms: u64,
    /// Merged-context budget in characters (~4 chars per token).
    pub context_budget_chars: usize,
    /// Column width for HTML→text extraction.
    pub extract_width: usize,
    /// Extractions shorter than this fall back to the search snippet.
    pub min_extract_chars: usize,
    /// Chunks kept per fetched page.
    pub chunk_top_k: usize,
    /// Character cap per chunk.
    pub max_chunk_chars: usize,
    /// Timeout for a single model call.
    pub generation_timeout_ms: u64,
    /// Backoff before the single per-call retry.
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            local_top_k: 4,
            gate_tau: 0.6,
            gate_min_hits: 2,
            max_web_candidates: 5,
            fetch_pool_size: 4,
            fetch_timeout_ms: 8_000,
            fetch_round_timeout_ms: 10_000,
            fetch_max_bytes: 2_000_000,
            fetch_cache_ttl_s: 24 * 60 * 60,
            source_timeout_ms: 10_000,
            overall_budget_ms: 20_000,
            context_budget_chars: 24_000,
            extract_width: 100,
            min_extract_chars: 200,
            chunk_top_k: 5,
            max_chunk_chars: 1_500,
            generation_timeout_ms: 15_000,
            retry_backoff_ms: 250,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            local_top_k: env_usize("MEDPIPE_LOCAL_TOP_K", d.local_top_k),
            gate_tau: env_f64("MEDPIPE_GATE_TAU", d.gate_tau),
            gate_min_hits: env_usize("MEDPIPE_GATE_MIN_HITS", d.gate_min_hits),
            max_web_candidates: env_usize("MEDPIPE_MAX_WEB_CANDIDATES", d.max_web_candidates),
            fetch_pool_size: env_usize("MEDPIPE_FETCH_POOL_SIZE", d.fetch_pool_size).max(1),
            fetch_timeout_ms: env_u64("MEDPIPE_FETCH_TIMEOUT_MS", d.fetch_timeout_ms),
            fetch_round_timeout_ms: env_u64(
                "MEDPIPE_FETCH_ROUND_TIMEOUT_MS",
                d.fetch_round_timeout_ms,
            ),
            fetch_max_bytes: env_u64("MEDPIPE_FETCH_MAX_BYTES", d.fetch_max_bytes),
            fetch_cache_ttl_s: env_u64("MEDPIPE_FETCH_CACHE_TTL_S", d.fetch_cache_ttl_s),
            source_timeout_ms: env_u64("MEDPIPE_SOURCE_TIMEOUT_MS", d.source_timeout_ms),
            overall_budget_ms: env_u64("MEDPIPE_OVERALL_BUDGET_MS", d.overall_budget_ms),
            context_budget_chars: env_usize(
                "MEDPIPE_CONTEXT_BUDGET_CHARS",
                d.context_budget_chars,
            ),
            extract_width: env_usize("MEDPIPE_EXTRACT_WIDTH", d.extract_width),
            min_extract_chars: env_usize("MEDPIPE_MIN_EXTRACT_CHARS", d.min_extract_chars),
            chunk_top_k: env_usize("MEDPIPE_CHUNK_TOP_K", d.chunk_top_k),
            max_chunk_chars: env_usize("MEDPIPE_MAX_CHUNK_CHARS", d.max_chunk_chars),
            generation_timeout_ms: env_u64(
                "MEDPIPE_GENERATION_TIMEOUT_MS",
                d.generation_timeout_ms,
            ),
            retry_backoff_ms: env_u64("MEDPIPE_RETRY_BACKOFF_MS", d.retry_backoff_ms),
        }
    }
}
