use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Logically invalid input (e.g. empty question). Never retried.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// One provider failed or timed out; the pipeline continues without it.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Every evidence source came back empty.
    #[error("no evidence: {0}")]
    NoEvidence(String),
    /// A single model call failed; the fallback chain may still recover.
    #[error("generation failed: {0}")]
    Generation(String),
    /// Every model in the fallback chain failed.
    #[error("generation exhausted: {0}")]
    GenerationExhausted(String),
    /// Wall-clock or token budget hit; partial results are used.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    /// Model output did not parse into the structured shape.
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("embedding failed: {0}")]
    Embed(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl Error {
    /// Stable taxonomy code carried on error stream events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidQuery(_) => "invalid_query",
            Error::SourceUnavailable(_) => "source_unavailable",
            Error::NoEvidence(_) => "no_evidence",
            Error::Generation(_) | Error::Llm(_) => "generation_error",
            Error::GenerationExhausted(_) => "generation_exhausted",
            Error::BudgetExceeded(_) => "budget_exceeded",
            Error::MalformedOutput(_) => "malformed_output",
            Error::InvalidUrl(_) | Error::Fetch(_) => "fetch_error",
            Error::Cache(_) => "cache_error",
            Error::Search(_) => "search_error",
            Error::Embed(_) => "embed_error",
            Error::NotConfigured(_) => "not_configured",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    TextImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Direct reasoning over whatever local evidence clears the gate.
    AssistedReasoning,
    /// Always ground the answer in live web evidence.
    WebGrounded,
}

/// Image attachment for multimodal questions (base64 payload + mime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime: String,
    pub base64_data: String,
}

/// One user question plus its generation knobs. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub text: String,
    pub mode: Mode,
    pub requested_model: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub image: Option<ImageAttachment>,
}

impl Query {
    pub fn modality(&self) -> Modality {
        if self.image.is_some() {
            Modality::TextImage
        } else {
            Modality::Text
        }
    }

    /// Rejects logically invalid input before any provider is touched.
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::InvalidQuery("empty question".to_string()));
        }
        if self.id.trim().is_empty() {
            return Err(Error::InvalidQuery("empty query id".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    WebPrimary,
    WebSecondary,
}

/// Normalized evidence item from any source. Created once, never mutated;
/// downstream stages only filter and rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub kind: SourceKind,
    /// Document id (local) or URL (web).
    pub uri_or_id: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub raw_content: Option<String>,
    /// Normalized to [0,1]; rank-derived for web providers.
    pub relevance_score: f64,
    pub fetched_at_epoch_s: u64,
}

impl RetrievalResult {
    /// Key used for merge-time deduplication: normalized URI for web results,
    /// the document id verbatim for local ones.
    pub fn dedup_key(&self) -> String {
        match self.kind {
            SourceKind::Local => self.uri_or_id.clone(),
            SourceKind::WebPrimary | SourceKind::WebSecondary => {
                normalize_uri(&self.uri_or_id)
            }
        }
    }

    /// Best available text for this result: extracted content, else snippet.
    pub fn best_text(&self) -> Option<&str> {
        self.raw_content
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.snippet.as_deref().filter(|s| !s.trim().is_empty()))
    }
}

/// Canonical form of a URL used as the dedup key: lowercase scheme/host,
/// `www.` stripped, default ports, fragments and trailing slashes dropped.
/// Unparseable inputs fall back to a trimmed lowercase of the raw string so
/// dedup still works on garbage URIs.
pub fn normalize_uri(raw: &str) -> String {
    let Ok(u) = url::Url::parse(raw.trim()) else {
        return raw.trim().trim_end_matches('/').to_ascii_lowercase();
    };
    let scheme = u.scheme().to_ascii_lowercase();
    let host = u
        .host_str()
        .map(|h| {
            let h = h.to_ascii_lowercase();
            h.strip_prefix("www.").map(str::to_string).unwrap_or(h)
        })
        .unwrap_or_default();
    let port = match (u.port(), scheme.as_str()) {
        (Some(443), "https") | (Some(80), "http") | (None, _) => String::new(),
        (Some(p), _) => format!(":{p}"),
    };
    let path = u.path().trim_end_matches('/');
    let query = u
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    format!("{scheme}://{host}{port}{path}{query}")
}

/// Span of extracted page text, optionally embedded for re-ranking.
/// Owned by the fetch & extract pool; consumed only by the merger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChunk {
    /// `uri_or_id` of the parent RetrievalResult.
    pub result_uri: String,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Deduplicated, stably-indexed view of a RetrievalResult. The `index` is the
/// only valid citation key downstream — never a URL or title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub index: usize,
    pub kind: SourceKind,
    pub uri_or_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Bounded excerpt shown to callers resolving citations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    pub score: f64,
    /// False when the record ranked past the context budget: it can still be
    /// cited, but its full text was not included in the prompt.
    pub in_context: bool,
}

impl SourceRecord {
    pub fn url(&self) -> Option<&str> {
        match self.kind {
            SourceKind::Local => None,
            _ => Some(self.uri_or_id.as_str()),
        }
    }
}

/// Token-budgeted evidence context handed to the generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedContext {
    pub records: Vec<SourceRecord>,
    pub context_text: String,
}

impl MergedContext {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_index(&self, index: usize) -> bool {
        index < self.records.len()
    }
}

/// Static capability row for one generation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub supports_vision: bool,
    pub is_free_tier: bool,
    pub context_window: u64,
}

/// Model choice plus ordered fallbacks. Chosen once per query; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub reason: String,
}

impl ModelRoute {
    /// Primary followed by fallbacks, in try-order.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(|s| s.as_str()))
    }

    pub fn chain_len(&self) -> usize {
        1 + self.fallbacks.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Index into the query's SourceRecord list.
    pub source_index: usize,
    /// The marker as it appears in the answer text, e.g. "[2]".
    pub locator: String,
}

/// Final structured answer. Built incrementally during generation, frozen on
/// completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredAnswer {
    pub title: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub answer: String,
    pub citations: Vec<Citation>,
    /// Full source list so callers can resolve citation indices to links.
    pub sources: Vec<SourceRecord>,
    /// True when a degradation path produced this answer (snippet-only or
    /// unparsed raw text).
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Title,
    Summary,
    KeyPoints,
    Answer,
}

/// Ephemeral streaming protocol; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    PartialText { text: String },
    SectionComplete { section: SectionKind },
    Citation { citation: Citation },
    Error { code: String, message: String },
    Done { answer: StructuredAnswer },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Hit from the local knowledge store, pre-normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHit {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
    /// Normalized relevance in [0,1].
    pub score: f64,
}

#[async_trait::async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<LocalHit>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<Vec<SearchHit>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchCachePolicy {
    pub read: bool,
    pub write: bool,
    /// Cached entries older than this are treated as a miss.
    pub ttl_s: Option<u64>,
}

impl Default for FetchCachePolicy {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            ttl_s: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
    pub cache: FetchCachePolicy,
}

impl FetchRequest {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub source: FetchSource,
}

impl FetchResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/pdf")
            .unwrap_or(false)
            || self.bytes.starts_with(b"%PDF-")
    }
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse>;
}

#[async_trait::async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    /// System instruction; backends fold it into the user turn for models
    /// that reject a system role.
    pub system: Option<String>,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub timeout_ms: u64,
}

pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Single blocking call returning the full completion text.
    async fn generate(&self, req: &GenerationRequest) -> Result<String>;
    /// Token-by-token delivery. The stream is finite and restartable from
    /// scratch; dropping it cancels the underlying call.
    async fn generate_stream(&self, req: &GenerationRequest) -> Result<TokenStream>;
}
