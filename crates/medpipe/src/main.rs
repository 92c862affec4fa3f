use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use medpipe::answer::Delivery;
use medpipe::pipeline::{Backends, Pipeline};
use medpipe::router::ModelTable;
use medpipe::PipelineConfig;
use medpipe_core::{ImageAttachment, Mode, Query, StreamEvent};
use medpipe_local::openai_compat::OpenAiCompatClient;
use medpipe_local::search::{trusted_domains_from_env, BraveSearchProvider, TavilySearchProvider};
use medpipe_local::vectorstore::ChromaStore;
use medpipe_local::{embed::OllamaEmbedder, PageFetcher};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "medpipe")]
#[command(about = "Hybrid retrieval-augmented answers for health questions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer one question end to end (retrieval, routing, generation).
    Ask(AskCmd),
    /// Print the model capability table (json).
    Models,
    /// Print version info.
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Local evidence first; the web only when the gate finds it thin.
    AssistedReasoning,
    /// Always ground the answer in live web evidence.
    WebGrounded,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::AssistedReasoning => Mode::AssistedReasoning,
            ModeArg::WebGrounded => Mode::WebGrounded,
        }
    }
}

#[derive(clap::Args, Debug)]
struct AskCmd {
    /// Question text.
    question: String,
    #[arg(long, value_enum, default_value = "assisted-reasoning")]
    mode: ModeArg,
    /// Preferred generation model id (falls back to the routed chain).
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_tokens: Option<u64>,
    #[arg(long)]
    temperature: Option<f64>,
    /// Attach an image (routes to a vision-capable model).
    #[arg(long)]
    image: Option<PathBuf>,
    /// Stream tokens to stdout as they arrive instead of one JSON document.
    #[arg(long, default_value_t = false)]
    stream: bool,
    /// Emit the raw event stream as JSON lines (implies --stream).
    #[arg(long, default_value_t = false)]
    json_events: bool,
    /// Query id used for duplicate-submission coalescing (default: the
    /// question text).
    #[arg(long)]
    query_id: Option<String>,
    /// Page-cache directory (default: the OS cache dir).
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

fn image_attachment(path: &PathBuf) -> Result<ImageAttachment> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => anyhow::bail!("unsupported image type: {}", path.display()),
    };
    Ok(ImageAttachment {
        mime: mime.to_string(),
        base64_data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("medpipe")
        .join("fetch")
}

fn build_pipeline(cache_dir: Option<PathBuf>) -> Result<Pipeline> {
    let client = reqwest::Client::new();

    let store = match ChromaStore::from_env(client.clone()) {
        Ok(s) => Some(Arc::new(s) as Arc<dyn medpipe_core::KnowledgeStore>),
        Err(e) => {
            tracing::debug!(error = %e, "local knowledge store disabled");
            None
        }
    };
    let web_primary = match TavilySearchProvider::from_env(client.clone()) {
        Ok(p) => Some(Arc::new(p) as Arc<dyn medpipe_core::SearchProvider>),
        Err(e) => {
            tracing::debug!(error = %e, "primary web search disabled");
            None
        }
    };
    let web_secondary = match BraveSearchProvider::from_env(client.clone()) {
        Ok(p) => Some(Arc::new(p) as Arc<dyn medpipe_core::SearchProvider>),
        Err(e) => {
            tracing::debug!(error = %e, "secondary web search disabled");
            None
        }
    };
    let embedder = match OllamaEmbedder::from_env(client.clone()) {
        Ok(b) => Some(Arc::new(b) as Arc<dyn medpipe_core::EmbeddingBackend>),
        Err(e) => {
            tracing::debug!(error = %e, "embeddings rerank disabled");
            None
        }
    };
    let generator = OpenAiCompatClient::from_env(client)
        .context("a generation backend is required (set MEDPIPE_OPENROUTER_API_KEY)")?;
    let fetcher = PageFetcher::new(Some(cache_dir.unwrap_or_else(default_cache_dir)))
        .context("building page fetcher")?;

    Ok(Pipeline::new(
        PipelineConfig::from_env(),
        ModelTable::from_env().context("loading model table")?,
        Backends {
            store,
            web_primary,
            web_secondary,
            fetcher: Arc::new(fetcher),
            embedder,
            generator: Arc::new(generator),
            trusted_domains: trusted_domains_from_env(),
        },
    ))
}

async fn run_ask(cmd: AskCmd) -> Result<()> {
    let pipeline = build_pipeline(cmd.cache_dir.clone())?;
    let query = Query {
        id: cmd
            .query_id
            .clone()
            .unwrap_or_else(|| cmd.question.trim().to_string()),
        text: cmd.question.clone(),
        mode: cmd.mode.into(),
        requested_model: cmd.model.clone(),
        max_tokens: cmd.max_tokens,
        temperature: cmd.temperature,
        image: cmd.image.as_ref().map(image_attachment).transpose()?,
    };

    if cmd.stream || cmd.json_events {
        let mut rx = pipeline.submit(query, Delivery::Streaming).await?;
        let mut stdout = std::io::stdout();
        loop {
            let ev = match rx.recv().await {
                Ok(ev) => ev,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if cmd.json_events {
                serde_json::to_writer(&mut stdout, &ev)?;
                writeln!(stdout)?;
                stdout.flush()?;
                if ev.is_terminal() {
                    break;
                }
                continue;
            }
            match ev {
                StreamEvent::PartialText { text } => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
                StreamEvent::Done { answer } => {
                    writeln!(stdout)?;
                    if !answer.sources.is_empty() {
                        writeln!(stdout, "\nSources:")?;
                        for s in &answer.sources {
                            let label = s.title.as_deref().unwrap_or("");
                            writeln!(stdout, "[{}] {} {}", s.index, label, s.uri_or_id)?;
                        }
                    }
                    break;
                }
                StreamEvent::Error { code, message } => {
                    anyhow::bail!("pipeline failed ({code}): {message}");
                }
                _ => {}
            }
        }
        return Ok(());
    }

    let answer = pipeline.answer(query).await?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ask(cmd) => run_ask(cmd).await,
        Commands::Models => {
            let table = ModelTable::from_env()?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "models": table.model_ids(),
            }))?);
            Ok(())
        }
        Commands::Version => {
            println!(
                "{}",
                serde_json::json!({
                    "name": "medpipe",
                    "version": env!("CARGO_PKG_VERSION"),
                })
            );
            Ok(())
        }
    }
}
