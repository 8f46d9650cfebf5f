//! Minimal async HTTP client abstraction.
//!
//! The connection and the long-polling transport issue plain GET/POST/DELETE
//! requests and only ever look at the status code and body bytes. Putting
//! that behind [`HttpClient`] keeps the request mechanics (TLS, pooling,
//! timeouts) out of the protocol code and lets tests script responses
//! without a network.

use async_trait::async_trait;
use url::Url;

use crate::error::{Result, SignalRError};

/// A minimal async HTTP client for the requests the core needs.
///
/// Implementations must classify client-side timeouts as
/// [`SignalRError::Timeout`] — the long-polling loop treats a timed-out poll
/// as "reissue", not as a failure. All other network errors are passed
/// through as [`SignalRError::Http`] with the original message.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue a GET request.
    async fn get(&self, url: Url, headers: &[(String, String)]) -> Result<HttpResponse>;

    /// Issue a POST request with the given body.
    async fn post(&self, url: Url, headers: &[(String, String)], body: Vec<u8>)
        -> Result<HttpResponse>;

    /// Issue a DELETE request.
    async fn delete(&self, url: Url, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// A minimal HTTP response: status code plus body bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Construct a response from its parts.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }
}

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[derive(Debug, Clone)]
pub struct DefaultHttpClient {
    inner: reqwest::Client,
}

impl DefaultHttpClient {
    /// Create a client with the given per-request timeout.
    ///
    /// Long-poll GETs sit idle for most of the server's poll window, so the
    /// timeout must comfortably exceed it.
    #[must_use]
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            inner: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<HttpResponse> {
        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(HttpResponse { status, body })
    }

    fn apply_headers(
        mut builder: reqwest::RequestBuilder,
        headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

impl Default for DefaultHttpClient {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(120))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SignalRError {
    if e.is_timeout() {
        SignalRError::Timeout
    } else {
        SignalRError::Http(e.to_string())
    }
}

#[async_trait]
impl HttpClient for DefaultHttpClient {
    async fn get(&self, url: Url, headers: &[(String, String)]) -> Result<HttpResponse> {
        self.execute(Self::apply_headers(self.inner.get(url), headers))
            .await
    }

    async fn post(
        &self,
        url: Url,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse> {
        self.execute(Self::apply_headers(self.inner.post(url), headers).body(body))
            .await
    }

    async fn delete(&self, url: Url, headers: &[(String, String)]) -> Result<HttpResponse> {
        self.execute(Self::apply_headers(self.inner.delete(url), headers))
            .await
    }
}
