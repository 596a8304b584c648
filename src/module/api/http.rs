//! Outbound HTTP for the `http.fetch` syscall
//!
//! Only the status and the number of bytes read are reported back to the
//! module. Reading stops at the byte cap; redirects are not followed, so a
//! permitted host cannot bounce the request to a forbidden one.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub max_bytes: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: u16,
    pub bytes: u64,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch request: {0}")]
    Invalid(String),
    #[error("fetch timed out")]
    Timeout,
    #[error("fetch failed: {0}")]
    Transport(String),
}

/// Host lookup for a fetch URL; only `http` and `https` are accepted
pub fn url_host(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    match parsed.scheme() {
        "http" | "https" => parsed.host_str().map(|h| h.to_ascii_lowercase()),
        _ => None,
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, FetchError>;
}

/// Fetcher backed by reqwest
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| FetchError::Invalid(e.to_string()))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;
        let status = response.status().as_u16();

        let mut read = 0usize;
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })? {
            if read + chunk.len() > request.max_bytes {
                read = request.max_bytes;
                truncated = true;
                break;
            }
            read += chunk.len();
        }

        Ok(FetchOutcome {
            status,
            bytes: read as u64,
            truncated,
        })
    }
}
