//! Download function used for manifests and patch payloads.
//!
//! [`UrlFetcher`] speaks HTTP(S) through a ureq agent with a global timeout
//! and reads `file://` URLs from disk. [`StaticFetcher`] serves an in-memory
//! map for embedding and tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound for a single response body.
const MAX_BODY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{url}: bad HTTP status code {status}")]
    Status { url: String, status: u16 },
    #[error("{url}: timed out")]
    Timeout { url: String },
    #[error("{url}: {detail}")]
    Transport { url: String, detail: String },
    #[error("{url}: unsupported URL scheme")]
    UnsupportedScheme { url: String },
}

impl FetchError {
    /// Transient failures worth another attempt against the same URL.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }
}

/// Retrieve the bytes behind a URL.
pub trait Fetch: Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP(S) via ureq plus local `file://` URLs.
pub struct UrlFetcher {
    agent: ureq::Agent,
}

impl UrlFetcher {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: config.into(),
        }
    }

    fn fetch_http(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let start = Instant::now();
        let mut response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| map_ureq_error(url, err))?;
        let bytes = response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_vec()
            .map_err(|err| map_ureq_error(url, err))?;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            response_bytes = bytes.len(),
            url,
            "http fetch complete"
        );
        Ok(bytes)
    }
}

impl Fetch for UrlFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return std::fs::read(path).map_err(|err| FetchError::Transport {
                url: url.to_string(),
                detail: err.to_string(),
            });
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.fetch_http(url);
        }
        Err(FetchError::UnsupportedScheme {
            url: url.to_string(),
        })
    }
}

fn map_ureq_error(url: &str, err: ureq::Error) -> FetchError {
    match err {
        ureq::Error::StatusCode(status) => FetchError::Status {
            url: url.to_string(),
            status,
        },
        ureq::Error::Timeout(_) => FetchError::Timeout {
            url: url.to_string(),
        },
        other => FetchError::Transport {
            url: url.to_string(),
            detail: other.to_string(),
        },
    }
}

/// Serves fixed payloads by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct StaticFetcher {
    payloads: HashMap<String, Vec<u8>>,
    requests: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.payloads.insert(url.into(), bytes.into());
    }

    /// Number of fetch calls served so far, including misses.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Fetch for StaticFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Fetch one URL, retrying transient failures up to `attempts` times total.
pub fn fetch_with_retry<F: Fetch + ?Sized>(
    fetcher: &F,
    url: &str,
    attempts: u32,
) -> Result<Vec<u8>, FetchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(url) {
            Ok(bytes) => return Ok(bytes),
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::warn!(attempt, attempts, error = %err, "retrying download");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Try mirrors in order; a bad status moves on to the next mirror at once,
/// transient errors are retried per mirror first.
pub fn fetch_from_mirrors<F: Fetch + ?Sized>(
    fetcher: &F,
    urls: &[String],
    attempts: u32,
) -> Result<Vec<u8>, FetchError> {
    let mut last_err = None;
    for url in urls {
        match fetch_with_retry(fetcher, url, attempts) {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "mirror failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| FetchError::UnsupportedScheme {
        url: "<no manifest URL configured>".to_string(),
    }))
}
