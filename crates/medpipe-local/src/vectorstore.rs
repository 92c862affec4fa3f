use crate::env;
use medpipe_core::{Error, KnowledgeStore, LocalHit, Result};
use serde::Deserialize;
use std::time::Duration;

/// Chroma-style HTTP client for the local document index.
///
/// The index itself is built by a separate ingestion job; this adapter only
/// issues `query` calls against an existing collection.
#[derive(Debug, Clone)]
pub struct ChromaStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    timeout: Duration,
}

impl ChromaStore {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let base_url = env("MEDPIPE_VECTORSTORE_ENDPOINT").ok_or_else(|| {
            Error::NotConfigured("missing MEDPIPE_VECTORSTORE_ENDPOINT".to_string())
        })?;
        let collection =
            env("MEDPIPE_VECTORSTORE_COLLECTION").unwrap_or_else(|| "hc_docs".to_string());
        let timeout_ms = env("MEDPIPE_VECTORSTORE_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(5_000)
            .clamp(500, 30_000);
        Ok(Self {
            client,
            base_url,
            collection,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub fn new(client: reqwest::Client, base_url: String, collection: String) -> Self {
        Self {
            client,
            base_url,
            collection,
            timeout: Duration::from_millis(5_000),
        }
    }

    fn endpoint_query(&self) -> String {
        format!(
            "{}/api/v1/collections/{}/query",
            self.base_url.trim_end_matches('/'),
            self.collection
        )
    }

    /// Cosine distance (0 = identical, 2 = opposite) → relevance in [0,1].
    fn score_from_distance(distance: f64) -> f64 {
        (1.0 - distance / 2.0).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Deserialize)]
struct ChromaQueryResponse {
    /// Chroma nests one inner list per query text; we always send one.
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<serde_json::Value>>>,
    #[serde(default)]
    distances: Vec<Vec<f64>>,
}

#[async_trait::async_trait]
impl KnowledgeStore for ChromaStore {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<LocalHit>> {
        let body = serde_json::json!({
            "query_texts": [query],
            "n_results": top_k.max(1),
            "include": ["documents", "metadatas", "distances"],
        });

        let resp = self
            .client
            .post(self.endpoint_query())
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("vector store HTTP {status}")));
        }

        let parsed: ChromaQueryResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let ids = parsed.ids.into_iter().next().unwrap_or_default();
        let docs = parsed.documents.into_iter().next().unwrap_or_default();
        let metas = parsed.metadatas.into_iter().next().unwrap_or_default();
        let dists = parsed.distances.into_iter().next().unwrap_or_default();

        let mut out = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            let text = docs
                .get(i)
                .and_then(|d| d.clone())
                .unwrap_or_default();
            if text.trim().is_empty() {
                continue;
            }
            let title = metas.get(i).and_then(|m| {
                m.as_ref()
                    .and_then(|v| v.get("title"))
                    .and_then(|t| t.as_str())
                    .map(|s| s.to_string())
            });
            let score = dists
                .get(i)
                .copied()
                .map(Self::score_from_distance)
                .unwrap_or(0.0);
            out.push(LocalHit {
                id,
                title,
                text,
                score,
            });
        }
        Ok(out)
    }
}
