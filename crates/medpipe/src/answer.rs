//! Answer generation: prompt assembly, the generation state machine with its
//! model fallback chain, tolerant structured parsing, and citation
//! validation against the merged context's source registry.

use crate::PipelineConfig;
use medpipe_core::{
    Citation, Error, GenerationBackend, GenerationRequest, MergedContext, ModelRoute, Query,
    Result, SectionKind, StreamEvent, StructuredAnswer,
};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::sync::broadcast;

const SYSTEM_INSTRUCTION: &str = "You are a concise, cautious medical assistant. When uncertain, \
say you are not a doctor and recommend a clinical consult. Use only the provided source documents \
when sources are given.";

/// Generator phases. `Failed` is reachable from `Generating` and `Parsing`;
/// a provider error inside `Generating` re-enters `PromptBuilt` with the next
/// model in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenPhase {
    Idle,
    PromptBuilt,
    Generating,
    Parsing,
    Finalized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Batch,
    Streaming,
}

/// Outbound event channel. `emit` returns false once every receiver is gone,
/// which the generator treats as a client disconnect.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<broadcast::Sender<StreamEvent>>,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<StreamEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, ev: StreamEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(ev).is_ok(),
            None => true,
        }
    }
}

pub fn build_prompt(query: &Query, ctx: &MergedContext) -> (String, String) {
    let mut user = String::new();
    user.push_str("Question: ");
    user.push_str(query.text.trim());
    user.push_str("\n\n");
    if !ctx.is_empty() {
        user.push_str("Evidence (cite only by bracketed index):\n");
        user.push_str(&ctx.context_text);
        user.push('\n');
    }
    user.push_str(
        "Format the reply in markdown with exactly these sections:\n\
         # <short title>\n\
         ## Summary\n\
         <two or three sentences>\n\
         ## Key Points\n\
         - <point>\n\
         ## Answer\n\
         <full answer>\n\n",
    );
    if ctx.is_empty() {
        user.push_str("No sources are available; answer from general knowledge and do not invent citations.\n");
    } else {
        user.push_str(
            "Cite claims with the bracketed source index, e.g. [0]. \
             Only use indices that appear in the evidence above.\n",
        );
    }
    (SYSTEM_INSTRUCTION.to_string(), user)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSections {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub key_points: Vec<String>,
    pub answer: Option<String>,
}

fn first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, ch) in raw[start..].char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_json_sections(raw: &str) -> Option<ParsedSections> {
    #[derive(serde::Deserialize)]
    struct Wire {
        title: Option<String>,
        summary: Option<String>,
        #[serde(default, alias = "points")]
        key_points: Vec<String>,
        answer: Option<String>,
    }
    let obj = first_json_object(raw)?;
    let wire: Wire = serde_json::from_str(obj).ok()?;
    if wire.title.is_none() && wire.summary.is_none() && wire.answer.is_none() {
        return None;
    }
    Some(ParsedSections {
        title: wire.title,
        summary: wire.summary,
        key_points: wire.key_points,
        answer: wire.answer,
    })
}

fn heading_kind(line: &str) -> Option<SectionKind> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("## ") {
        let name = rest.trim().to_ascii_lowercase();
        return match name.as_str() {
            "summary" => Some(SectionKind::Summary),
            "key points" | "key-points" => Some(SectionKind::KeyPoints),
            "answer" => Some(SectionKind::Answer),
            _ => None,
        };
    }
    if line.starts_with("# ") {
        return Some(SectionKind::Title);
    }
    None
}

fn parse_markdown_sections(raw: &str) -> Option<ParsedSections> {
    let mut out = ParsedSections::default();
    let mut current: Option<SectionKind> = None;
    let mut saw_heading = false;
    let mut answer_lines: Vec<&str> = Vec::new();
    let mut summary_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(kind) = heading_kind(line) {
            saw_heading = true;
            if kind == SectionKind::Title {
                let t = line.trim().trim_start_matches('#').trim();
                if !t.is_empty() {
                    out.title = Some(t.to_string());
                }
            }
            current = Some(kind);
            continue;
        }
        match current {
            Some(SectionKind::Summary) => {
                if !line.trim().is_empty() {
                    summary_lines.push(line.trim());
                }
            }
            Some(SectionKind::KeyPoints) => {
                let t = line.trim();
                if let Some(point) = t.strip_prefix("- ").or_else(|| t.strip_prefix("* ")) {
                    if !point.trim().is_empty() {
                        out.key_points.push(point.trim().to_string());
                    }
                }
            }
            Some(SectionKind::Answer) => answer_lines.push(line),
            _ => {}
        }
    }

    if !saw_heading {
        return None;
    }
    if !summary_lines.is_empty() {
        out.summary = Some(summary_lines.join(" "));
    }
    let answer = answer_lines.join("\n").trim().to_string();
    if !answer.is_empty() {
        out.answer = Some(answer);
    }
    Some(out)
}

/// Tolerant structured parse: JSON object first, markdown headings second.
/// None means the raw text carries no recognizable structure.
pub fn parse_structured(raw: &str) -> Option<ParsedSections> {
    parse_json_sections(raw).or_else(|| parse_markdown_sections(raw))
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("static regex"))
}

/// Keep markers that reference a known source index; strip the rest. Returns
/// the cleaned text plus citations in order of first appearance.
pub fn validate_citations(text: &str, ctx: &MergedContext) -> (String, Vec<Citation>) {
    let mut citations: Vec<Citation> = Vec::new();
    let cleaned = citation_re().replace_all(text, |caps: &regex::Captures| {
        let Ok(index) = caps[1].parse::<usize>() else {
            return String::new();
        };
        if !ctx.has_index(index) {
            return String::new();
        }
        if !citations.iter().any(|c| c.source_index == index) {
            citations.push(Citation {
                source_index: index,
                locator: caps[0].to_string(),
            });
        }
        caps[0].to_string()
    });
    (cleaned.into_owned(), citations)
}

/// Incremental section detection for streaming delivery: a section completes
/// when the next heading shows up in the accumulated text.
#[derive(Debug, Default)]
pub struct SectionTracker {
    emitted: usize,
}

impl SectionTracker {
    pub fn observe(&mut self, accumulated: &str) -> Vec<SectionKind> {
        let headings: Vec<SectionKind> = accumulated.lines().filter_map(heading_kind).collect();
        let completed = headings.len().saturating_sub(1);
        let mut out = Vec::new();
        while self.emitted < completed {
            out.push(headings[self.emitted]);
            self.emitted += 1;
        }
        out
    }

    /// End of stream: the open section (if any) is complete too.
    pub fn finish(&mut self, accumulated: &str) -> Vec<SectionKind> {
        let headings: Vec<SectionKind> = accumulated.lines().filter_map(heading_kind).collect();
        let mut out = Vec::new();
        while self.emitted < headings.len() {
            out.push(headings[self.emitted]);
            self.emitted += 1;
        }
        out
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Degraded answer assembled from source excerpts only — used when every
/// model in the chain failed but evidence exists.
pub fn snippet_answer(query: &Query, ctx: &MergedContext) -> StructuredAnswer {
    let mut key_points = Vec::new();
    let mut body = String::new();
    let mut citations = Vec::new();
    for r in &ctx.records {
        let label = r
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&r.uri_or_id);
        if key_points.len() < 5 {
            key_points.push(format!("{label} [{}]", r.index));
        }
        if let Some(excerpt) = &r.excerpt {
            body.push_str(&format!("[{}] {excerpt}\n\n", r.index));
            citations.push(Citation {
                source_index: r.index,
                locator: format!("[{}]", r.index),
            });
        }
    }
    StructuredAnswer {
        title: format!("Sources for \"{}\"", truncate_chars(query.text.trim(), 80)),
        summary: "A generated answer was unavailable; the most relevant source excerpts are \
                  listed instead."
            .to_string(),
        key_points,
        answer: body.trim_end().to_string(),
        citations,
        sources: ctx.records.clone(),
        degraded: true,
    }
}

pub struct AnswerGenerator<'a> {
    pub backend: &'a dyn GenerationBackend,
    pub config: &'a PipelineConfig,
}

enum ModelOutcome {
    Text(String),
    ClientGone,
}

impl<'a> AnswerGenerator<'a> {
    fn remaining_ms(&self, deadline: Instant) -> Result<u64> {
        let left = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
        if left < 200 {
            return Err(Error::BudgetExceeded(
                "wall-clock budget exhausted before generation".to_string(),
            ));
        }
        Ok(left.min(self.config.generation_timeout_ms))
    }

    async fn run_model(
        &self,
        req: &GenerationRequest,
        delivery: Delivery,
        sink: &EventSink,
    ) -> Result<ModelOutcome> {
        let mut attempt = 0u8;
        loop {
            let r = match delivery {
                Delivery::Batch => self.backend.generate(req).await.map(ModelOutcome::Text),
                Delivery::Streaming => self.stream_once(req, sink).await,
            };
            match r {
                Ok(out) => return Ok(out),
                // One bounded retry per model for transient provider trouble.
                Err(e) if attempt == 0 => {
                    tracing::warn!(model = %req.model, error = %e, "model call failed; retrying once");
                    attempt = 1;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.retry_backoff_ms,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once(&self, req: &GenerationRequest, sink: &EventSink) -> Result<ModelOutcome> {
        use futures_util::StreamExt;
        let mut stream = self.backend.generate_stream(req).await?;
        let mut accumulated = String::new();
        let mut tracker = SectionTracker::default();
        while let Some(tok) = stream.next().await {
            let tok = tok?;
            accumulated.push_str(&tok);
            if !sink.emit(StreamEvent::PartialText { text: tok }) {
                return Ok(ModelOutcome::ClientGone);
            }
            for section in tracker.observe(&accumulated) {
                sink.emit(StreamEvent::SectionComplete { section });
            }
        }
        for section in tracker.finish(&accumulated) {
            sink.emit(StreamEvent::SectionComplete { section });
        }
        Ok(ModelOutcome::Text(accumulated))
    }

    fn finalize(
        &self,
        query: &Query,
        ctx: &MergedContext,
        raw: String,
        sink: &EventSink,
    ) -> StructuredAnswer {
        let parsed = parse_structured(&raw);
        let degraded = parsed.is_none();
        if degraded {
            tracing::warn!("model output failed structured parsing; using raw text");
        }
        let sections = parsed.unwrap_or_default();

        let answer_text = sections.answer.unwrap_or_else(|| raw.trim().to_string());
        let (answer_text, citations) = validate_citations(&answer_text, ctx);
        for citation in &citations {
            sink.emit(StreamEvent::Citation {
                citation: citation.clone(),
            });
        }
        let (summary, _) =
            validate_citations(sections.summary.as_deref().unwrap_or_default(), ctx);

        StructuredAnswer {
            title: sections
                .title
                .unwrap_or_else(|| truncate_chars(query.text.trim(), 80)),
            summary,
            key_points: sections.key_points,
            answer: answer_text,
            citations,
            sources: ctx.records.clone(),
            degraded,
        }
    }

    fn enter(&self, phase: GenPhase, model: &str) {
        tracing::debug!(?phase, model, "generator state");
    }

    /// Drive `PromptBuilt → Generating → Parsing → Finalized`, advancing the
    /// fallback chain on provider errors. `Err(GenerationExhausted)` means
    /// the whole chain failed; the orchestrator decides how to degrade.
    pub async fn generate(
        &self,
        query: &Query,
        ctx: &MergedContext,
        route: &ModelRoute,
        delivery: Delivery,
        sink: &EventSink,
        deadline: Instant,
    ) -> Result<StructuredAnswer> {
        let (system, user) = build_prompt(query, ctx);
        let mut last_err: Option<Error> = None;

        for model in route.chain() {
            self.enter(GenPhase::PromptBuilt, model);
            let timeout_ms = self.remaining_ms(deadline)?;
            let req = GenerationRequest {
                model: model.to_string(),
                system: Some(system.clone()),
                user: user.clone(),
                image: query.image.clone(),
                max_tokens: query.max_tokens,
                temperature: query.temperature,
                timeout_ms,
            };

            self.enter(GenPhase::Generating, model);
            match self.run_model(&req, delivery, sink).await {
                Ok(ModelOutcome::ClientGone) => {
                    return Err(Error::Generation("client disconnected".to_string()));
                }
                Ok(ModelOutcome::Text(raw)) => {
                    self.enter(GenPhase::Parsing, model);
                    let answer = self.finalize(query, ctx, raw, sink);
                    self.enter(GenPhase::Finalized, model);
                    return Ok(answer);
                }
                Err(e) => {
                    tracing::warn!(model, error = %e, "model failed; advancing fallback chain");
                    last_err = Some(e);
                }
            }
        }

        self.enter(GenPhase::Failed, "");
        Err(Error::GenerationExhausted(format!(
            "all {} models failed; last error: {}",
            route.chain_len(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medpipe_core::{Mode, SourceKind, SourceRecord, TokenStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn query() -> Query {
        Query {
            id: "q1".to_string(),
            text: "how to treat mild dehydration".to_string(),
            mode: Mode::AssistedReasoning,
            requested_model: None,
            max_tokens: Some(256),
            temperature: Some(0.1),
            image: None,
        }
    }

    fn ctx_with(n: usize) -> MergedContext {
        let records = (0..n)
            .map(|i| SourceRecord {
                index: i,
                kind: SourceKind::WebPrimary,
                uri_or_id: format!("https://cdc.gov/{i}"),
                title: Some(format!("Source {i}")),
                excerpt: Some(format!("excerpt {i}")),
                score: 1.0 - i as f64 / 10.0,
                in_context: true,
            })
            .collect::<Vec<_>>();
        let context_text = records
            .iter()
            .map(|r| format!("[{}] {}\n", r.index, r.uri_or_id))
            .collect();
        MergedContext {
            records,
            context_text,
        }
    }

    const MD: &str = "# Dehydration care\n## Summary\nDrink fluids early. [0]\n## Key Points\n- Sip water often [1]\n- Seek care if severe\n## Answer\nMild dehydration responds to oral fluids. [0] Rest as needed. [7]\n";

    #[test]
    fn json_parse_comes_first_and_tolerates_prose_wrapping() {
        let raw = "Sure, here is the answer:\n{\"title\":\"T\",\"summary\":\"S\",\"points\":[\"p1\"],\"answer\":\"A [0]\"}\nthanks";
        let p = parse_structured(raw).unwrap();
        assert_eq!(p.title.as_deref(), Some("T"));
        assert_eq!(p.key_points, vec!["p1".to_string()]);
        assert_eq!(p.answer.as_deref(), Some("A [0]"));
    }

    #[test]
    fn markdown_fallback_parses_headed_sections() {
        let p = parse_structured(MD).unwrap();
        assert_eq!(p.title.as_deref(), Some("Dehydration care"));
        assert_eq!(p.summary.as_deref(), Some("Drink fluids early. [0]"));
        assert_eq!(p.key_points.len(), 2);
        assert!(p.answer.unwrap().starts_with("Mild dehydration"));
    }

    #[test]
    fn unstructured_output_yields_none() {
        assert!(parse_structured("just a plain sentence").is_none());
    }

    #[test]
    fn citations_to_unknown_indices_are_stripped_never_fabricated() {
        let ctx = ctx_with(2);
        let (clean, cites) =
            validate_citations("Fluids help. [0] Rest. [7] More fluids. [1] Again. [0]", &ctx);
        assert_eq!(clean, "Fluids help. [0] Rest.  More fluids. [1] Again. [0]");
        assert_eq!(
            cites,
            vec![
                Citation {
                    source_index: 0,
                    locator: "[0]".to_string()
                },
                Citation {
                    source_index: 1,
                    locator: "[1]".to_string()
                },
            ]
        );
    }

    #[test]
    fn empty_context_strips_every_citation() {
        let ctx = MergedContext::default();
        let (clean, cites) = validate_citations("Claim. [0][1]", &ctx);
        assert_eq!(clean, "Claim. ");
        assert!(cites.is_empty());
    }

    #[test]
    fn section_tracker_completes_sections_as_headings_arrive() {
        let mut tracker = SectionTracker::default();
        assert!(tracker.observe("# Title\npartial").is_empty());
        assert_eq!(
            tracker.observe("# Title\npartial\n## Summary\n"),
            vec![SectionKind::Title]
        );
        assert_eq!(
            tracker.observe("# Title\npartial\n## Summary\ntext\n## Answer\nbody"),
            vec![SectionKind::Summary]
        );
        assert_eq!(
            tracker.finish("# Title\npartial\n## Summary\ntext\n## Answer\nbody"),
            vec![SectionKind::Answer]
        );
    }

    struct StubBackend {
        text: String,
        fail_models: Vec<String>,
        calls: AtomicUsize,
    }

    impl StubBackend {
        fn ok(text: &str) -> Self {
            Self {
                text: text.to_string(),
                fail_models: vec![],
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl GenerationBackend for StubBackend {
        async fn generate(&self, req: &GenerationRequest) -> medpipe_core::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_models.contains(&req.model) {
                return Err(Error::Llm(format!("{} down", req.model)));
            }
            Ok(self.text.clone())
        }

        async fn generate_stream(
            &self,
            req: &GenerationRequest,
        ) -> medpipe_core::Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_models.contains(&req.model) {
                return Err(Error::Llm(format!("{} down", req.model)));
            }
            // Word-sized tokens exercise incremental parsing.
            let toks: Vec<medpipe_core::Result<String>> = self
                .text
                .split_inclusive(' ')
                .map(|s| Ok(s.to_string()))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(toks)))
        }
    }

    fn route3() -> ModelRoute {
        ModelRoute {
            primary: "m1".to_string(),
            fallbacks: vec!["m2".to_string(), "m3".to_string()],
            reason: "test".to_string(),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn streaming_and_batch_deliveries_agree_on_the_final_answer() {
        let backend = StubBackend::ok(MD);
        let config = PipelineConfig::default();
        let gen = AnswerGenerator {
            backend: &backend,
            config: &config,
        };
        let ctx = ctx_with(2);
        let q = query();

        let batch = gen
            .generate(
                &q,
                &ctx,
                &route3(),
                Delivery::Batch,
                &EventSink::disabled(),
                deadline(),
            )
            .await
            .unwrap();
        let streamed = gen
            .generate(
                &q,
                &ctx,
                &route3(),
                Delivery::Streaming,
                &EventSink::disabled(),
                deadline(),
            )
            .await
            .unwrap();

        assert_eq!(batch.title, streamed.title);
        assert_eq!(batch.summary, streamed.summary);
        assert_eq!(batch.key_points, streamed.key_points);
        assert_eq!(batch.answer, streamed.answer);
        assert_eq!(batch.citations, streamed.citations);
        // The [7] marker references no source and must be gone.
        assert!(!batch.answer.contains("[7]"));
        assert!(batch.citations.iter().all(|c| c.source_index < 2));
        assert!(!batch.degraded);
    }

    #[tokio::test]
    async fn fallback_chain_recovers_after_two_failing_models() {
        let backend = StubBackend {
            text: MD.to_string(),
            fail_models: vec!["m1".to_string(), "m2".to_string()],
            calls: AtomicUsize::new(0),
        };
        let config = PipelineConfig {
            retry_backoff_ms: 1,
            ..PipelineConfig::default()
        };
        let gen = AnswerGenerator {
            backend: &backend,
            config: &config,
        };
        let out = gen
            .generate(
                &query(),
                &ctx_with(2),
                &route3(),
                Delivery::Batch,
                &EventSink::disabled(),
                deadline(),
            )
            .await
            .unwrap();
        assert!(out.answer.contains("oral fluids"));
        // Two failing models retried once each, then the third succeeded.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn exhausted_chain_is_a_generation_exhausted_error() {
        let backend = StubBackend {
            text: MD.to_string(),
            fail_models: vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
            calls: AtomicUsize::new(0),
        };
        let config = PipelineConfig {
            retry_backoff_ms: 1,
            ..PipelineConfig::default()
        };
        let gen = AnswerGenerator {
            backend: &backend,
            config: &config,
        };
        let err = gen
            .generate(
                &query(),
                &ctx_with(1),
                &route3(),
                Delivery::Batch,
                &EventSink::disabled(),
                deadline(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "generation_exhausted");
    }

    #[tokio::test]
    async fn malformed_output_degrades_to_raw_answer_with_empty_sections() {
        let backend = StubBackend::ok("The model ignored the format. Drink fluids. [5]");
        let config = PipelineConfig::default();
        let gen = AnswerGenerator {
            backend: &backend,
            config: &config,
        };
        let out = gen
            .generate(
                &query(),
                &ctx_with(1),
                &route3(),
                Delivery::Batch,
                &EventSink::disabled(),
                deadline(),
            )
            .await
            .unwrap();
        assert!(out.degraded);
        assert!(out.answer.starts_with("The model ignored"));
        assert!(out.key_points.is_empty());
        assert!(out.summary.is_empty());
        assert!(!out.answer.contains("[5]"), "unknown index stripped");
    }

    #[tokio::test]
    async fn streaming_emits_partials_sections_citations_in_order() {
        let backend = StubBackend::ok(MD);
        let config = PipelineConfig::default();
        let gen = AnswerGenerator {
            backend: &backend,
            config: &config,
        };
        let (tx, mut rx) = broadcast::channel(256);
        let sink = EventSink::new(tx);
        let out = gen
            .generate(
                &query(),
                &ctx_with(2),
                &route3(),
                Delivery::Streaming,
                &sink,
                deadline(),
            )
            .await
            .unwrap();

        let mut partials = String::new();
        let mut sections = Vec::new();
        let mut citations = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            match ev {
                StreamEvent::PartialText { text } => partials.push_str(&text),
                StreamEvent::SectionComplete { section } => sections.push(section),
                StreamEvent::Citation { citation } => citations.push(citation),
                _ => {}
            }
        }
        assert_eq!(partials, MD);
        assert_eq!(
            sections,
            vec![
                SectionKind::Title,
                SectionKind::Summary,
                SectionKind::KeyPoints,
                SectionKind::Answer,
            ]
        );
        assert_eq!(citations, out.citations);
    }

    #[test]
    fn snippet_answer_is_degraded_and_cites_every_excerpted_source() {
        let ctx = ctx_with(3);
        let out = snippet_answer(&query(), &ctx);
        assert!(out.degraded);
        assert_eq!(out.citations.len(), 3);
        assert!(out.answer.contains("[0] excerpt 0"));
        assert_eq!(out.sources.len(), 3);
    }

    #[test]
    fn prompt_embeds_context_and_cite_by_index_instruction() {
        let (system, user) = build_prompt(&query(), &ctx_with(2));
        assert!(system.contains("not a doctor"));
        assert!(user.contains("[0] https://cdc.gov/0"));
        assert!(user.contains("bracketed source index"));

        let (_, no_ctx) = build_prompt(&query(), &MergedContext::default());
        assert!(no_ctx.contains("do not invent citations"));
    }
}
