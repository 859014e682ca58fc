//! Conditional HTTP fetch with an on-disk cache.
//!
//! ```text
//! <cache>/http/<sha256(key)>.body        last good body
//! <cache>/http/<sha256(key)>.meta.json   etag, last_modified, content_type, retrieved_at
//! ```
//!
//! Every fetch sends the cached validators. A `304` serves the cached body.
//! Failures are retried with exponential backoff; once attempts run out the
//! cached body is served stale if there is one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, HeaderName, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// Attempts per fetch.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay after the first failed attempt; doubles each time.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(300);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A fetched (or cached) text resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCacheResult {
    pub content: String,
    pub from_cache: bool,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheMetadata {
    etag: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    content_type: Option<String>,
    retrieved_at: Option<DateTime<Utc>>,
}

/// HTTP fetcher backed by a cache directory.
#[derive(Debug, Clone)]
pub struct HttpCache {
    client: reqwest::Client,
    dir: PathBuf,
    allow_plain_http: bool,
    initial_backoff: Duration,
}

impl HttpCache {
    /// Creates a cache rooted at `dir`. The client never uses a system proxy.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Skiff/{}", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            dir: dir.into(),
            allow_plain_http: false,
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    /// Accepts `http://` sources. Only meant for local test servers.
    pub fn allow_plain_http(mut self, allow: bool) -> Self {
        self.allow_plain_http = allow;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Body file for a cache key.
    pub fn body_path(&self, cache_key: &str) -> PathBuf {
        self.dir.join(format!("{}.body", hash_key(cache_key)))
    }

    /// Metadata file for a cache key.
    pub fn metadata_path(&self, cache_key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", hash_key(cache_key)))
    }

    /// Fetches `url` as text, at most `max_bytes` long.
    pub async fn get_string(
        &self,
        url: &str,
        cache_key: &str,
        max_bytes: u64,
    ) -> Result<HttpCacheResult> {
        let url = self.check_source(url)?;
        let body_path = self.body_path(cache_key);
        let meta_path = self.metadata_path(cache_key);
        let metadata = read_metadata(&meta_path).await;

        let mut delay = self.initial_backoff;
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .fetch_once(&url, &metadata, &body_path, &meta_path, max_bytes)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt < MAX_ATTEMPTS {
                        warn!(attempt, max = MAX_ATTEMPTS, url = %url, error = %e, "HTTP fetch attempt failed");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    last_error = Some(e);
                }
            }
        }

        if let Some(content) = read_body(&body_path).await {
            // Metadata without a timestamp reports the epoch.
            let retrieved_at = metadata.retrieved_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            warn!(url = %url, %retrieved_at, "Using stale cache");
            return Ok(HttpCacheResult {
                content,
                from_cache: true,
                etag: metadata.etag,
                last_modified: metadata.last_modified,
                content_type: metadata.content_type,
                retrieved_at,
            });
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(ProxyError::Http(format!("Unable to fetch resource: {url}: {reason}")))
    }

    fn check_source(&self, url: &str) -> Result<Url> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| ProxyError::Http(format!("Invalid URL '{url}': {e}")))?;
        match parsed.scheme() {
            "https" => Ok(parsed),
            "http" if self.allow_plain_http => Ok(parsed),
            _ => Err(ProxyError::Http("Only HTTPS sources are allowed.".into())),
        }
    }

    async fn fetch_once(
        &self,
        url: &Url,
        metadata: &CacheMetadata,
        body_path: &Path,
        meta_path: &Path,
        max_bytes: u64,
    ) -> Result<HttpCacheResult> {
        let mut request = self.client.get(url.clone());
        if let Some(etag) = metadata.etag.as_deref().filter(|e| !e.trim().is_empty()) {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(modified) = metadata.last_modified {
            request = request.header(IF_MODIFIED_SINCE, modified.format(HTTP_DATE).to_string());
        }

        let mut response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            let content = read_body(body_path)
                .await
                .ok_or_else(|| ProxyError::Http("Received 304 but cache body is missing.".into()))?;
            debug!(url = %url, "Not modified, serving cached body");
            return Ok(HttpCacheResult {
                content,
                from_cache: true,
                etag: metadata.etag.clone(),
                last_modified: metadata.last_modified,
                content_type: metadata.content_type.clone(),
                retrieved_at: Utc::now(),
            });
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Http(format!("{url} returned {status}")));
        }

        let headers = response.headers();
        let etag = header_str(headers, ETAG);
        let last_modified = header_str(headers, LAST_MODIFIED)
            .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
            .map(|d| d.with_timezone(&Utc));
        let content_type = header_str(headers, CONTENT_TYPE)
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|v| !v.is_empty());

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(oversize(max_bytes));
            }
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (bytes.len() + chunk.len()) as u64 > max_bytes {
                return Err(oversize(max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let fresh = CacheMetadata {
            etag,
            last_modified,
            content_type,
            retrieved_at: Some(Utc::now()),
        };
        skiff_storage::write_atomic(body_path, &bytes).await?;
        skiff_storage::write_atomic(meta_path, &serde_json::to_vec_pretty(&fresh)?).await?;

        Ok(HttpCacheResult {
            content,
            from_cache: false,
            etag: fresh.etag,
            last_modified: fresh.last_modified,
            content_type: fresh.content_type,
            retrieved_at: fresh.retrieved_at.unwrap_or_else(Utc::now),
        })
    }
}

fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn oversize(max_bytes: u64) -> ProxyError {
    ProxyError::Http(format!("Response exceeds max allowed size ({max_bytes} bytes)."))
}

async fn read_metadata(path: &Path) -> CacheMetadata {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => CacheMetadata::default(),
    }
}

async fn read_body(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}
