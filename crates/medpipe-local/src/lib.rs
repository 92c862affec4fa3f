use medpipe_core::{
    Error, FetchBackend, FetchRequest, FetchResponse, FetchSource, Result,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod embed;
pub mod extract;
pub mod openai_compat;
pub mod search;
pub mod semantic;
pub mod vectorstore;

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_or(primary: &str, fallback: &str) -> Option<String> {
    env(primary).or_else(|| env(fallback))
}

pub(crate) fn epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Filesystem cache for fetched pages, keyed on url + read cap.
///
/// Repeated questions hit the same evidence URLs; a TTL'd disk cache keeps the
/// fetch round cheap and makes tests reproducible offline.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn key_for_fetch(req: &FetchRequest) -> String {
        let mut h = Sha256::new();
        h.update(b"url:");
        h.update(req.url.as_bytes());
        h.update(b"\nmax_bytes:");
        match req.max_bytes {
            Some(n) => h.update(n.to_string().as_bytes()),
            None => h.update(b"none"),
        }
        hex::encode(h.finalize())
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let dir = self.root.join(&key[0..2]).join(&key[2..4]);
        let meta = dir.join(format!("{key}.json"));
        let body = dir.join(format!("{key}.bin"));
        (meta, body)
    }

    pub fn get(&self, req: &FetchRequest) -> Result<Option<FetchResponse>> {
        if !req.cache.read {
            return Ok(None);
        }
        let key = Self::key_for_fetch(req);
        let (meta_p, body_p) = self.paths(&key);
        if !meta_p.exists() || !body_p.exists() {
            return Ok(None);
        }
        let meta_bytes = fs::read(&meta_p).map_err(|e| Error::Cache(e.to_string()))?;
        let body = fs::read(&body_p).map_err(|e| Error::Cache(e.to_string()))?;

        let meta: serde_json::Value =
            serde_json::from_slice(&meta_bytes).map_err(|e| Error::Cache(e.to_string()))?;
        let fetched_at = meta
            .get("fetched_at_epoch_s")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if let Some(ttl_s) = req.cache.ttl_s {
            if epoch_s().saturating_sub(fetched_at) > ttl_s {
                return Ok(None);
            }
        }

        Ok(Some(FetchResponse {
            url: meta
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or(&req.url)
                .to_string(),
            final_url: meta
                .get("final_url")
                .and_then(|v| v.as_str())
                .unwrap_or(&req.url)
                .to_string(),
            status: meta.get("status").and_then(|v| v.as_u64()).unwrap_or(0) as u16,
            content_type: meta
                .get("content_type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            bytes: body,
            truncated: meta
                .get("truncated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            source: FetchSource::Cache,
        }))
    }

    pub fn put(&self, req: &FetchRequest, resp: &FetchResponse) -> Result<()> {
        if !req.cache.write {
            return Ok(());
        }
        let key = Self::key_for_fetch(req);
        let (meta_p, body_p) = self.paths(&key);
        if let Some(parent) = meta_p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        }
        let meta = serde_json::json!({
            "schema_version": 1,
            "fetched_at_epoch_s": epoch_s(),
            "url": resp.url,
            "final_url": resp.final_url,
            "status": resp.status,
            "content_type": resp.content_type,
            "truncated": resp.truncated,
        });
        fs::write(&body_p, &resp.bytes).map_err(|e| Error::Cache(e.to_string()))?;
        fs::write(
            &meta_p,
            serde_json::to_vec(&meta).map_err(|e| Error::Cache(e.to_string()))?,
        )
        .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(())
    }
}

/// Plain HTTP GET fetcher with an optional filesystem cache.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    cache: Option<FsCache>,
}

impl PageFetcher {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("medpipe/0.1")
            .redirect(reqwest::redirect::Policy::limited(10))
            // Per-request timeouts still override these; the builder caps are
            // here so DNS/TLS/body stalls cannot hang a fetch round.
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            cache: cache_dir.map(FsCache::new),
        })
    }
}

#[async_trait::async_trait]
impl FetchBackend for PageFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse> {
        if let Some(cache) = self.cache.clone() {
            let req2 = req.clone();
            let hit = tokio::task::spawn_blocking(move || cache.get(&req2))
                .await
                .map_err(|e| Error::Cache(format!("cache get join failed: {e}")))??;
            if let Some(hit) = hit {
                return Ok(hit);
            }
        }

        let url = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let mut rb = self.client.get(url);
        if let Some(to) = req.timeout() {
            rb = rb.timeout(to);
        }
        let resp = rb.send().await.map_err(|e| Error::Fetch(e.to_string()))?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let max_bytes = req.max_bytes.unwrap_or(u64::MAX) as usize;
        let mut truncated = false;
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > max_bytes {
                let can_take = max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let out = FetchResponse {
            url: req.url.clone(),
            final_url,
            status,
            content_type,
            bytes,
            truncated,
            source: FetchSource::Network,
        };

        if let Some(cache) = self.cache.clone() {
            let req2 = req.clone();
            let out2 = out.clone();
            tokio::task::spawn_blocking(move || cache.put(&req2, &out2))
                .await
                .map_err(|e| Error::Cache(format!("cache put join failed: {e}")))??;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, routing::get, Router};
    use medpipe_core::FetchCachePolicy;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn req_for(addr: SocketAddr, ttl_s: Option<u64>) -> FetchRequest {
        FetchRequest {
            url: format!("http://{addr}/"),
            timeout_ms: Some(2_000),
            max_bytes: Some(1_000_000),
            cache: FetchCachePolicy {
                read: true,
                write: true,
                ttl_s,
            },
        }
    }

    #[tokio::test]
    async fn fetcher_hits_cache_on_second_fetch() {
        let app = Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "hello") }),
        );
        let addr = serve(app).await;

        let tmp = tempfile::tempdir().unwrap();
        let fetcher = PageFetcher::new(Some(tmp.path().to_path_buf())).unwrap();

        let req = req_for(addr, Some(60));
        let r1 = fetcher.fetch(&req).await.unwrap();
        assert_eq!(r1.source, FetchSource::Network);
        assert_eq!(r1.text_lossy(), "hello");
        let r2 = fetcher.fetch(&req).await.unwrap();
        assert_eq!(r2.source, FetchSource::Cache);
        assert_eq!(r2.text_lossy(), "hello");
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let app = Router::new().route("/", get(|| async { "hello" }));
        let addr = serve(app).await;

        let tmp = tempfile::tempdir().unwrap();
        let fetcher = PageFetcher::new(Some(tmp.path().to_path_buf())).unwrap();

        let req = req_for(addr, Some(0));
        let r1 = fetcher.fetch(&req).await.unwrap();
        assert_eq!(r1.source, FetchSource::Network);
        // A zero TTL means the entry written a second ago is already stale.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let r2 = fetcher.fetch(&req).await.unwrap();
        assert_eq!(r2.source, FetchSource::Network);
    }

    #[tokio::test]
    async fn body_is_capped_at_max_bytes() {
        let app = Router::new().route("/", get(|| async { "a".repeat(10_000) }));
        let addr = serve(app).await;

        let fetcher = PageFetcher::new(None).unwrap();
        let mut req = req_for(addr, None);
        req.max_bytes = Some(100);
        let r = fetcher.fetch(&req).await.unwrap();
        assert!(r.truncated);
        assert_eq!(r.bytes.len(), 100);
    }

    #[test]
    fn cache_key_distinguishes_none_from_zero_cap() {
        let base = FetchRequest {
            url: "https://example.com/".to_string(),
            timeout_ms: None,
            max_bytes: None,
            cache: FetchCachePolicy::default(),
        };
        let mut zero = base.clone();
        zero.max_bytes = Some(0);
        assert_ne!(
            FsCache::key_for_fetch(&base),
            FsCache::key_for_fetch(&zero)
        );
    }
}
