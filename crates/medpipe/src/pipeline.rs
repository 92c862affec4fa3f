//! Pipeline orchestrator: drives retrieval → gate → fetch → merge → route →
//! generate for one query under a wall-clock budget, with per-query-id
//! coalescing and graceful degradation.

use crate::answer::{snippet_answer, AnswerGenerator, Delivery, EventSink};
use crate::fetchpool::{self, WebCandidate};
use crate::gate::{self, GateDecision};
use crate::merge;
use crate::router::ModelTable;
use crate::PipelineConfig;
use medpipe_core::{
    ContentChunk, EmbeddingBackend, Error, FetchBackend, GenerationBackend, KnowledgeStore, Mode,
    Query, Result, RetrievalResult, SearchHit, SearchProvider, SearchQuery, SourceKind,
    StreamEvent, StructuredAnswer,
};
use medpipe_local::search::{filter_trusted, score_for_rank};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex, Semaphore};

/// Everything the pipeline talks to. Optional collaborators degrade to
/// "source unavailable" behavior instead of failing construction.
pub struct Backends {
    pub store: Option<Arc<dyn KnowledgeStore>>,
    pub web_primary: Option<Arc<dyn SearchProvider>>,
    pub web_secondary: Option<Arc<dyn SearchProvider>>,
    pub fetcher: Arc<dyn FetchBackend>,
    pub embedder: Option<Arc<dyn EmbeddingBackend>>,
    pub generator: Arc<dyn GenerationBackend>,
    /// Domains web evidence is restricted to; empty disables the filter.
    pub trusted_domains: Vec<String>,
}

/// Cheap to clone: every clone shares the same fetch pool and in-flight
/// registry, so one `Pipeline` value per process is the expected shape.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    models: ModelTable,
    backends: Arc<Backends>,
    /// Process-wide fetch ceiling, shared by every concurrent query.
    fetch_permits: Arc<Semaphore>,
    /// In-flight runs by query id; duplicates subscribe instead of re-running.
    inflight: Arc<Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>>,
}

fn epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

fn error_from_code(code: &str, message: String) -> Error {
    match code {
        "invalid_query" => Error::InvalidQuery(message),
        "no_evidence" => Error::NoEvidence(message),
        "generation_exhausted" => Error::GenerationExhausted(message),
        "budget_exceeded" => Error::BudgetExceeded(message),
        "malformed_output" => Error::MalformedOutput(message),
        _ => Error::Generation(message),
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig, models: ModelTable, backends: Backends) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(config.fetch_pool_size.max(1)));
        Self {
            config,
            models,
            backends: Arc::new(backends),
            fetch_permits,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    /// Start (or join) the pipeline run for `query` and return its event
    /// stream. A duplicate submission for a pending query id subscribes to
    /// the existing run instead of starting a second one.
    pub async fn submit(
        &self,
        query: Query,
        delivery: Delivery,
    ) -> Result<broadcast::Receiver<StreamEvent>> {
        query.validate()?;

        let mut inflight = self.inflight.lock().await;
        if let Some(tx) = inflight.get(&query.id) {
            tracing::debug!(query_id = %query.id, "coalescing duplicate submission");
            return Ok(tx.subscribe());
        }
        let (tx, rx) = broadcast::channel(256);
        inflight.insert(query.id.clone(), tx.clone());
        drop(inflight);

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(query, delivery, tx).await;
        });
        Ok(rx)
    }

    /// Convenience for batch callers: run the pipeline and wait for the
    /// terminal event.
    pub async fn answer(&self, query: Query) -> Result<StructuredAnswer> {
        let mut rx = self.submit(query, Delivery::Batch).await?;
        loop {
            match rx.recv().await {
                Ok(StreamEvent::Done { answer }) => return Ok(answer),
                Ok(StreamEvent::Error { code, message }) => {
                    return Err(error_from_code(&code, message))
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Generation(
                        "pipeline ended without a terminal event".to_string(),
                    ))
                }
            }
        }
    }

    async fn drive(self, query: Query, delivery: Delivery, tx: broadcast::Sender<StreamEvent>) {
        let deadline = Instant::now() + Duration::from_millis(self.config.overall_budget_ms);
        let sink = EventSink::new(tx.clone());
        let query_id = query.id.clone();
        let result = self.run_stages(&query, delivery, &sink, deadline).await;

        // Clear the in-flight slot before the terminal event goes out, so a
        // resubmission arriving right after `done` starts a fresh run rather
        // than joining a finished channel.
        self.inflight.lock().await.remove(&query_id);
        match result {
            Ok(answer) => {
                tracing::debug!(query_id = %query_id, degraded = answer.degraded, "pipeline finalized");
                let _ = tx.send(StreamEvent::Done { answer });
            }
            Err(e) => {
                tracing::error!(query_id = %query_id, error = %e, "pipeline failed");
                let _ = tx.send(StreamEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn time_left(&self, deadline: Instant) -> Duration {
        deadline.saturating_duration_since(Instant::now())
    }

    fn source_timeout(&self, deadline: Instant) -> Duration {
        Duration::from_millis(self.config.source_timeout_ms).min(self.time_left(deadline))
    }

    async fn local_results(&self, query: &Query, deadline: Instant) -> Vec<RetrievalResult> {
        let Some(store) = &self.backends.store else {
            return Vec::new();
        };
        let budget = self.source_timeout(deadline);
        match tokio::time::timeout(budget, store.search(&query.text, self.config.local_top_k)).await
        {
            Ok(Ok(hits)) => {
                let now = epoch_s();
                hits.into_iter()
                    .map(|h| RetrievalResult {
                        kind: SourceKind::Local,
                        uri_or_id: h.id,
                        title: h.title,
                        snippet: None,
                        raw_content: Some(h.text),
                        relevance_score: h.score.clamp(0.0, 1.0),
                        fetched_at_epoch_s: now,
                    })
                    .collect()
            }
            Ok(Err(e)) => {
                // Recoverable: the pipeline continues on web evidence alone.
                tracing::warn!(error = %e, "local store unavailable");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("local store timed out");
                Vec::new()
            }
        }
    }

    async fn provider_hits(
        &self,
        provider: &Arc<dyn SearchProvider>,
        query: &Query,
        deadline: Instant,
    ) -> Vec<SearchHit> {
        let budget = self.source_timeout(deadline);
        let q = SearchQuery {
            query: query.text.clone(),
            max_results: Some(self.config.max_web_candidates),
            timeout_ms: Some(budget.as_millis() as u64),
        };
        match tokio::time::timeout(budget, provider.search(&q)).await {
            Ok(Ok(hits)) => filter_trusted(hits, &self.backends.trusted_domains),
            Ok(Err(e)) => {
                tracing::warn!(provider = provider.name(), error = %e, "web search failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(provider = provider.name(), "web search timed out");
                Vec::new()
            }
        }
    }

    /// Primary provider first; the secondary is consulted only when the
    /// primary yields fewer usable candidates than the gate's minimum.
    async fn web_candidates(&self, query: &Query, deadline: Instant) -> Vec<WebCandidate> {
        let mut out: Vec<WebCandidate> = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        let mut push_hits = |hits: Vec<SearchHit>, kind: SourceKind, out: &mut Vec<WebCandidate>| {
            let total = hits.len();
            for (rank, hit) in hits.into_iter().enumerate() {
                let key = medpipe_core::normalize_uri(&hit.url);
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                out.push(WebCandidate {
                    kind,
                    score: score_for_rank(rank, total),
                    hit,
                });
            }
        };

        if let Some(primary) = &self.backends.web_primary {
            let hits = self.provider_hits(primary, query, deadline).await;
            push_hits(hits, SourceKind::WebPrimary, &mut out);
        }
        if out.len() < self.config.gate_min_hits {
            if let Some(secondary) = &self.backends.web_secondary {
                let hits = self.provider_hits(secondary, query, deadline).await;
                push_hits(hits, SourceKind::WebSecondary, &mut out);
            }
        }
        out.truncate(self.config.max_web_candidates);
        out
    }

    async fn run_stages(
        &self,
        query: &Query,
        delivery: Delivery,
        sink: &EventSink,
        deadline: Instant,
    ) -> Result<StructuredAnswer> {
        // Local retrieval always settles before the gate decision.
        let mut results = self.local_results(query, deadline).await;
        let local_scores: Vec<f64> = results.iter().map(|r| r.relevance_score).collect();

        let decision = gate::decide(
            &local_scores,
            self.config.gate_tau,
            self.config.gate_min_hits,
        );
        let web_needed = query.mode == Mode::WebGrounded || decision == GateDecision::Insufficient;
        tracing::debug!(?decision, web_needed, local_hits = results.len(), "confidence gate");

        let mut chunks: Vec<ContentChunk> = Vec::new();
        if web_needed && !self.time_left(deadline).is_zero() {
            let candidates = self.web_candidates(query, deadline).await;
            if !candidates.is_empty() {
                let round_timeout = Duration::from_millis(self.config.fetch_round_timeout_ms)
                    .min(self.time_left(deadline));
                let outcome = fetchpool::run_round(
                    self.backends.fetcher.clone(),
                    self.backends.embedder.clone(),
                    self.fetch_permits.clone(),
                    &self.config,
                    &query.text,
                    candidates,
                    round_timeout,
                )
                .await;
                tracing::debug!(
                    fetched = outcome.results.len(),
                    dropped = outcome.dropped,
                    "fetch round joined"
                );
                results.extend(outcome.results);
                chunks = outcome.chunks;
            }
        }

        // Merge starts only after the fetch round has been joined.
        let ctx = merge::merge(&results, &chunks, self.config.context_budget_chars);
        if ctx.is_empty() {
            tracing::warn!("no evidence from any source; falling back to direct reasoning");
        }

        let route = match self.models.route(
            query.mode,
            query.modality(),
            query.requested_model.as_deref(),
        ) {
            Ok(route) => route,
            Err(e) if ctx.is_empty() => {
                // Total exhaustion: nothing to cite and nothing to generate
                // with. The only terminal condition.
                return Err(Error::GenerationExhausted(format!(
                    "no evidence and no usable model: {e}"
                )));
            }
            Err(e) => {
                tracing::warn!(error = %e, "no usable model; degrading to snippet answer");
                return Ok(snippet_answer(query, &ctx));
            }
        };
        tracing::debug!(primary = %route.primary, reason = %route.reason, "model route");

        let generator = AnswerGenerator {
            backend: self.backends.generator.as_ref(),
            config: &self.config,
        };
        match generator
            .generate(query, &ctx, &route, delivery, sink, deadline)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e @ (Error::GenerationExhausted(_) | Error::BudgetExceeded(_))) => {
                if ctx.is_empty() {
                    Err(e)
                } else {
                    tracing::warn!(error = %e, "generation unavailable; degrading to snippet answer");
                    Ok(snippet_answer(query, &ctx))
                }
            }
            Err(e) => Err(e),
        }
    }
}
