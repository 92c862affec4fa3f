//! End-to-end orchestration scenarios over in-process stub collaborators.

use medpipe::answer::Delivery;
use medpipe::pipeline::{Backends, Pipeline};
use medpipe::router::ModelTable;
use medpipe::PipelineConfig;
use medpipe_core::{
    Error, FetchBackend, FetchRequest, FetchResponse, FetchSource, GenerationBackend,
    GenerationRequest, KnowledgeStore, LocalHit, Mode, ModelSpec, Query, Result, SearchHit,
    SearchProvider, SearchQuery, SourceKind, StreamEvent, TokenStream,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct StubStore {
    scores: Vec<f64>,
}

#[async_trait::async_trait]
impl KnowledgeStore for StubStore {
    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<LocalHit>> {
        Ok(self
            .scores
            .iter()
            .enumerate()
            .map(|(i, s)| LocalHit {
                id: format!("doc-{i}"),
                title: Some(format!("Local doc {i}")),
                text: format!("local evidence number {i} about the question"),
                score: *s,
            })
            .collect())
    }
}

struct StubSearch {
    name: &'static str,
    hits: Vec<SearchHit>,
    delay_ms: u64,
    calls: Arc<AtomicUsize>,
}

impl StubSearch {
    fn with_hits(name: &'static str, urls: &[&str]) -> Self {
        Self {
            name,
            hits: urls
                .iter()
                .map(|u| SearchHit {
                    url: u.to_string(),
                    title: Some("Web page".to_string()),
                    snippet: Some("web snippet about the question".to_string()),
                })
                .collect(),
            delay_ms: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn empty(name: &'static str) -> Self {
        Self::with_hits(name, &[])
    }
}

#[async_trait::async_trait]
impl SearchProvider for StubSearch {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn search(&self, _q: &SearchQuery) -> Result<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(self.hits.clone())
    }
}

struct StubFetcher;

#[async_trait::async_trait]
impl FetchBackend for StubFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse> {
        let body = format!(
            "<html><body><p>{}</p></body></html>",
            "fetched page text about the question ".repeat(10)
        );
        Ok(FetchResponse {
            url: req.url.clone(),
            final_url: req.url.clone(),
            status: 200,
            content_type: Some("text/html".to_string()),
            bytes: body.into_bytes(),
            truncated: false,
            source: FetchSource::Network,
        })
    }
}

struct StubGen {
    fail_models: Vec<&'static str>,
    calls: Arc<AtomicUsize>,
    text: String,
}

impl StubGen {
    fn ok() -> Self {
        Self {
            fail_models: vec![],
            calls: Arc::new(AtomicUsize::new(0)),
            text: "# Advice\n## Summary\nShort version. [0]\n## Key Points\n- Main point\n## Answer\nLonger answer with a citation. [0]\n".to_string(),
        }
    }

    fn failing(models: Vec<&'static str>) -> Self {
        Self {
            fail_models: models,
            ..Self::ok()
        }
    }
}

#[async_trait::async_trait]
impl GenerationBackend for StubGen {
    async fn generate(&self, req: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_models.iter().any(|m| *m == req.model) {
            return Err(Error::Llm(format!("{} unavailable", req.model)));
        }
        Ok(self.text.clone())
    }

    async fn generate_stream(&self, req: &GenerationRequest) -> Result<TokenStream> {
        let text = self.generate(req).await?;
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(text)])))
    }
}

fn table3() -> ModelTable {
    let spec = |id: &str| ModelSpec {
        id: id.to_string(),
        supports_vision: false,
        is_free_tier: true,
        context_window: 32_768,
    };
    serde_json::from_value(serde_json::json!({
        "models": [spec("m1"), spec("m2"), spec("m3")],
        "default_chain": ["m1", "m2", "m3"],
    }))
    .unwrap()
}

struct Fixture {
    pipeline: Pipeline,
    primary_calls: Arc<AtomicUsize>,
    secondary_calls: Arc<AtomicUsize>,
    gen_calls: Arc<AtomicUsize>,
}

fn fixture(
    store: Option<StubStore>,
    primary: StubSearch,
    secondary: StubSearch,
    gen: StubGen,
) -> Fixture {
    let primary_calls = primary.calls.clone();
    let secondary_calls = secondary.calls.clone();
    let gen_calls = gen.calls.clone();
    let config = PipelineConfig {
        source_timeout_ms: 300,
        retry_backoff_ms: 1,
        min_extract_chars: 50,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(
        config,
        table3(),
        Backends {
            store: store.map(|s| Arc::new(s) as Arc<dyn KnowledgeStore>),
            web_primary: Some(Arc::new(primary)),
            web_secondary: Some(Arc::new(secondary)),
            fetcher: Arc::new(StubFetcher),
            embedder: None,
            generator: Arc::new(gen),
            trusted_domains: vec![],
        },
    );
    Fixture {
        pipeline,
        primary_calls,
        secondary_calls,
        gen_calls,
    }
}

fn query(text: &str, mode: Mode) -> Query {
    Query {
        id: text.to_string(),
        text: text.to_string(),
        mode,
        requested_model: None,
        max_tokens: None,
        temperature: None,
        image: None,
    }
}

#[tokio::test]
async fn sufficient_local_evidence_skips_web_retrieval() {
    let f = fixture(
        Some(StubStore {
            scores: vec![0.8, 0.75, 0.3],
        }),
        StubSearch::with_hits("tavily", &["https://cdc.gov/a"]),
        StubSearch::with_hits("brave", &["https://who.int/b"]),
        StubGen::ok(),
    );
    let answer = f
        .pipeline
        .answer(query("is a fever dangerous", Mode::AssistedReasoning))
        .await
        .unwrap();

    assert_eq!(f.primary_calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.secondary_calls.load(Ordering::SeqCst), 0);
    assert_eq!(answer.sources.len(), 3);
    assert!(answer
        .sources
        .iter()
        .all(|s| s.kind == SourceKind::Local));
    assert!(!answer.citations.is_empty());
}

#[tokio::test]
async fn weak_local_evidence_triggers_web_and_secondary_covers_primary_timeout() {
    let mut primary = StubSearch::with_hits("tavily", &["https://cdc.gov/a"]);
    primary.delay_ms = 5_000;
    let f = fixture(
        Some(StubStore { scores: vec![0.4] }),
        primary,
        StubSearch::with_hits("brave", &["https://who.int/b", "https://nih.gov/c"]),
        StubGen::ok(),
    );
    let answer = f
        .pipeline
        .answer(query("newest flu guidance", Mode::AssistedReasoning))
        .await
        .unwrap();

    assert_eq!(f.primary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.secondary_calls.load(Ordering::SeqCst), 1);
    assert!(answer
        .sources
        .iter()
        .any(|s| s.kind == SourceKind::WebSecondary));
    // The timed-out primary contributed nothing.
    assert!(answer
        .sources
        .iter()
        .all(|s| s.kind != SourceKind::WebPrimary));
}

#[tokio::test]
async fn all_sources_empty_falls_back_to_direct_reasoning() {
    let f = fixture(
        None,
        StubSearch::empty("tavily"),
        StubSearch::empty("brave"),
        StubGen::ok(),
    );
    let answer = f
        .pipeline
        .answer(query("what is hydration", Mode::AssistedReasoning))
        .await
        .unwrap();

    assert!(answer.sources.is_empty());
    assert!(answer.citations.is_empty(), "no fabricated citations");
    assert!(!answer.answer.is_empty());
    // Direct reasoning still went through the model.
    assert!(f.gen_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn fallback_chain_of_three_recovers_from_two_failures() {
    let f = fixture(
        Some(StubStore {
            scores: vec![0.9, 0.9],
        }),
        StubSearch::empty("tavily"),
        StubSearch::empty("brave"),
        StubGen::failing(vec!["m1", "m2"]),
    );
    let answer = f
        .pipeline
        .answer(query("sore throat care", Mode::AssistedReasoning))
        .await
        .unwrap();
    assert!(!answer.degraded);
    assert!(answer.answer.contains("citation"));
    // m1 and m2 each get one retry before the chain advances; m3 succeeds.
    assert_eq!(f.gen_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn exhausted_chain_with_evidence_degrades_to_snippets() {
    let f = fixture(
        Some(StubStore {
            scores: vec![0.9, 0.9],
        }),
        StubSearch::empty("tavily"),
        StubSearch::empty("brave"),
        StubGen::failing(vec!["m1", "m2", "m3"]),
    );
    let answer = f
        .pipeline
        .answer(query("sprained ankle", Mode::AssistedReasoning))
        .await
        .unwrap();
    assert!(answer.degraded);
    assert!(!answer.sources.is_empty());
    assert!(answer.answer.contains("[0]"));
}

#[tokio::test]
async fn total_exhaustion_is_the_only_terminal_error() {
    let f = fixture(
        None,
        StubSearch::empty("tavily"),
        StubSearch::empty("brave"),
        StubGen::failing(vec!["m1", "m2", "m3"]),
    );
    let err = f
        .pipeline
        .answer(query("anything at all", Mode::AssistedReasoning))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "generation_exhausted");
}

#[tokio::test]
async fn web_grounded_mode_always_runs_web_retrieval() {
    let f = fixture(
        Some(StubStore {
            scores: vec![0.95, 0.95, 0.95],
        }),
        StubSearch::with_hits("tavily", &["https://cdc.gov/a", "https://cdc.gov/b"]),
        StubSearch::empty("brave"),
        StubGen::ok(),
    );
    let answer = f
        .pipeline
        .answer(query("todays flu numbers", Mode::WebGrounded))
        .await
        .unwrap();
    assert_eq!(f.primary_calls.load(Ordering::SeqCst), 1);
    assert!(answer
        .sources
        .iter()
        .any(|s| s.kind == SourceKind::WebPrimary));
}

#[tokio::test]
async fn streaming_delivery_ends_with_done_after_partials() {
    let f = fixture(
        Some(StubStore {
            scores: vec![0.9, 0.9],
        }),
        StubSearch::empty("tavily"),
        StubSearch::empty("brave"),
        StubGen::ok(),
    );
    let mut rx = f
        .pipeline
        .submit(
            query("streamed question", Mode::AssistedReasoning),
            Delivery::Streaming,
        )
        .await
        .unwrap();

    let mut saw_partial = false;
    let mut terminal = None;
    loop {
        match rx.recv().await {
            Ok(StreamEvent::PartialText { .. }) => saw_partial = true,
            Ok(ev @ StreamEvent::Done { .. }) | Ok(ev @ StreamEvent::Error { .. }) => {
                terminal = Some(ev);
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_partial);
    match terminal {
        Some(StreamEvent::Done { answer }) => {
            assert!(!answer.answer.is_empty());
        }
        other => panic!("expected Done, got {other:?}"),
    }
}
