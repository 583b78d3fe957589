//! Network seam.
//!
//! Everything above this trait is pure policy (retry, limiter, breaker,
//! cache); tests swap the reqwest transport for a scripted one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::HttpClientConfig;
use crate::error::{HttpError, Result};

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub params: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { method: Method::GET, url: url.into(), params: Vec::new() }
    }

    pub fn with_params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.params.extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Stable identifier for caching: method, URL and params sorted by name.
    pub fn cache_identifier(&self) -> String {
        let mut params = self.params.clone();
        params.sort();
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if query.is_empty() {
            format!("{} {}", self.method, self.url)
        } else {
            format!("{} {}?{}", self.method, self.url, query.join("&"))
        }
    }
}

/// Buffered upstream response. Header names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, headers: BTreeMap::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Invalid requests will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

// ── reqwest ───────────────────────────────────────────────────────────────────

/// Production transport backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HttpError::Config(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::Config(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self { client, timeout: config.timeout() })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "Sending request");

        let resp = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.params)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();
        let body = resp
            .text()
            .await
            .map_err(|e| classify_reqwest_error(e, self.timeout))?;

        Ok(HttpResponse { status, headers, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_identifier_sorts_params() {
        let a = HttpRequest::get("https://api.crossref.org/works").with_params([("rows", "0"), ("query", "kras")]);
        let b = HttpRequest::get("https://api.crossref.org/works").with_params([("query", "kras"), ("rows", "0")]);
        assert_eq!(a.cache_identifier(), b.cache_identifier());
        assert_eq!(a.cache_identifier(), "GET https://api.crossref.org/works?query=kras&rows=0");
    }

    #[test]
    fn test_retry_after_seconds() {
        let resp = HttpResponse::new(429, "").with_header("Retry-After", "7");
        assert_eq!(resp.retry_after(), Some(Duration::from_secs(7)));
        let resp = HttpResponse::new(429, "").with_header("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(resp.retry_after(), None);
    }

    #[test]
    fn test_invalid_request_not_retryable() {
        assert!(!TransportError::InvalidRequest("bad url".into()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_reqwest_transport_builds() {
        let cfg = HttpClientConfig::default().with_base_url("https://www.ebi.ac.uk/chembl/api/data");
        assert!(ReqwestTransport::new(&cfg).is_ok());
    }
}
