use crate::env;
use medpipe_core::{EmbeddingBackend, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ollama-style embeddings client. Strictly best-effort: the fetch pool falls
/// back to lexical chunk scoring whenever this backend is absent or errors.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let base_url = env("MEDPIPE_OLLAMA_ENDPOINT")
            .ok_or_else(|| Error::NotConfigured("missing MEDPIPE_OLLAMA_ENDPOINT".to_string()))?;
        let model = env("MEDPIPE_EMBED_MODEL").unwrap_or_else(|| "nomic-embed-text".to_string());
        Ok(Self {
            client,
            base_url,
            model,
            timeout: Duration::from_millis(
                env("MEDPIPE_EMBED_TIMEOUT_MS")
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(5_000)
                    .clamp(500, 30_000),
            ),
        })
    }

    pub fn new(client: reqwest::Client, base_url: String, model: String) -> Self {
        Self {
            client,
            base_url,
            model,
            timeout: Duration::from_millis(5_000),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let resp = self
            .client
            .post(self.endpoint())
            .json(&EmbedRequest {
                model: &self.model,
                prompt: text,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Embed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Embed(format!("embeddings HTTP {status}")));
        }
        let parsed: EmbedResponse = resp.json().await.map_err(|e| Error::Embed(e.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(Error::Embed("empty embedding".to_string()));
        }
        Ok(parsed.embedding)
    }
}

/// Cosine similarity; 0.0 for mismatched or zero-norm vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
