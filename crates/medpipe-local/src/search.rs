use crate::env_or;
use medpipe_core::{Error, Result, SearchHit, SearchProvider, SearchQuery};
use serde::Deserialize;

/// Default allowlist of medical domains live web evidence is restricted to.
/// Subdomains are allowed; an empty allowlist disables filtering.
pub const TRUSTED_DOMAINS: &[&str] = &[
    "who.int",
    "cdc.gov",
    "nih.gov",
    "medlineplus.gov",
    "pubmed.ncbi.nlm.nih.gov",
];

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    q.timeout_ms.unwrap_or(10_000).clamp(1_000, 60_000)
}

pub fn trusted_domains_from_env() -> Vec<String> {
    match crate::env("MEDPIPE_TRUSTED_DOMAINS") {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => TRUSTED_DOMAINS.iter().map(|s| s.to_string()).collect(),
    }
}

/// Keep only hits whose host is on (or under) a trusted domain.
pub fn filter_trusted(hits: Vec<SearchHit>, allowlist: &[String]) -> Vec<SearchHit> {
    if allowlist.is_empty() {
        return hits;
    }
    hits.into_iter()
        .filter(|h| {
            let Ok(u) = url::Url::parse(&h.url) else {
                return false;
            };
            let Some(host) = u.host_str().map(|h| h.to_ascii_lowercase()) else {
                return false;
            };
            allowlist
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        })
        .collect()
}

/// Provider-native rank → relevance score in [0,1], best rank first.
pub fn score_for_rank(rank: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    1.0 - (rank as f64 / total as f64)
}

#[derive(Debug, Clone)]
pub struct TavilySearchProvider {
    client: reqwest::Client,
    api_key: String,
}

impl TavilySearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = env_or("MEDPIPE_TAVILY_API_KEY", "TAVILY_API_KEY").ok_or_else(|| {
            Error::NotConfigured("missing MEDPIPE_TAVILY_API_KEY (or TAVILY_API_KEY)".to_string())
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        crate::env("MEDPIPE_TAVILY_ENDPOINT")
            .unwrap_or_else(|| "https://api.tavily.com/search".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    title: Option<String>,
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for TavilySearchProvider {
    fn name(&self) -> &'static str {
        "tavily"
    }

    async fn search(&self, q: &SearchQuery) -> Result<Vec<SearchHit>> {
        let max_results = q.max_results.unwrap_or(5).min(20);
        let timeout_ms = timeout_ms_from_query(q);

        let body = serde_json::json!({
            "query": q.query,
            "max_results": max_results,
            "include_answer": false,
            "include_raw_content": false,
            "search_depth": "basic",
        });

        let resp = self
            .client
            .post(Self::endpoint())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&body)
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("tavily search HTTP {status}")));
        }

        let parsed: TavilySearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                snippet: r.content,
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
}

impl BraveSearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key =
            env_or("MEDPIPE_BRAVE_API_KEY", "BRAVE_SEARCH_API_KEY").ok_or_else(|| {
                Error::NotConfigured(
                    "missing MEDPIPE_BRAVE_API_KEY (or BRAVE_SEARCH_API_KEY)".to_string(),
                )
            })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        crate::env("MEDPIPE_BRAVE_ENDPOINT")
            .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for BraveSearchProvider {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<Vec<SearchHit>> {
        let timeout_ms = timeout_ms_from_query(q);

        let mut req = self
            .client
            .get(Self::endpoint())
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str())]);
        if let Some(n) = q.max_results {
            req = req.query(&[("count", n.to_string())]);
        }

        let resp = req
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("brave search HTTP {status}")));
        }

        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let mut out = Vec::new();
        if let Some(results) = parsed.web.and_then(|w| w.results) {
            for r in results {
                out.push(SearchHit {
                    url: r.url,
                    title: r.title,
                    snippet: r.description,
                });
            }
        }
        Ok(out)
    }
}
