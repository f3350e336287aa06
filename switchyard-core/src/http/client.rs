//! HTTP client implementation using reqwest

use crate::http::error::{map_http_error, parse_retry_after, UpstreamError};
use crate::http::{ByteStream, HttpExecutor, HttpMethod, ProviderRequest};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, ClientBuilder, RequestBuilder, Response};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum unary response size
const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Longest error body read for diagnostics
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Default user agent
const USER_AGENT: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client with connection pooling
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client with default settings
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_config(Duration::from_secs(10), 32)
    }

    /// Create a new HTTP client with custom configuration
    ///
    /// Per-request timeouts are supplied on each call, so the client itself
    /// only bounds connection setup.
    pub fn with_config(
        connect_timeout: Duration,
        max_idle_per_host: usize,
    ) -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .map_err(|e| UpstreamError::transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_response_size: MAX_RESPONSE_SIZE,
        })
    }

    fn build(&self, request: &ProviderRequest, timeout: Option<Duration>) -> RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        }
        .header("X-Request-ID", request.request_id.to_string());

        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder
    }

    /// Send and turn any non-2xx reply into an [`UpstreamError`]
    ///
    /// `timeout` of `None` leaves the whole exchange unbounded.
    async fn send(
        &self,
        request: &ProviderRequest,
        timeout: Option<Duration>,
    ) -> Result<Response, UpstreamError> {
        let request_id = request.request_id;
        debug!(
            "{} {} [request_id: {}]",
            request.method,
            request.url.split('?').next().unwrap_or(""),
            request_id
        );

        let response = self
            .build(request, timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout.unwrap_or_default(), request_id))?;

        let status = response.status();
        debug!("Response status: {} [request_id: {}]", status, request_id);

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        // Error bodies are only read for the envelope; cap what we buffer
        let body = response.bytes().await.ok().map(|b| {
            let end = b.len().min(MAX_ERROR_BODY);
            String::from_utf8_lossy(&b[..end]).into_owned()
        });

        let error = map_http_error(status, retry_after, body.as_deref());
        warn!(
            "Upstream returned {} ({}) [request_id: {}]",
            status,
            error.kind(),
            request_id
        );
        Err(error)
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration, request_id: uuid::Uuid) -> UpstreamError {
    // The URL may carry a query-string key
    let e = e.without_url();
    if e.is_timeout() {
        warn!("Request timeout after {:?} [request_id: {}]", timeout, request_id);
        UpstreamError::timeout(timeout)
    } else if e.is_connect() {
        warn!("Connection error [request_id: {}]: {}", request_id, e);
        UpstreamError::transport(format!("Connection failed: {}", e))
    } else {
        warn!("Request error [request_id: {}]: {}", request_id, e);
        UpstreamError::transport(e.to_string())
    }
}

#[async_trait]
impl HttpExecutor for HttpClient {
    async fn execute(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<String, UpstreamError> {
        let request_id = request.request_id;
        let response = self.send(&request, Some(timeout)).await?;

        if let Some(content_length) = response.content_length() {
            if content_length as usize > self.max_response_size {
                return Err(UpstreamError::transport(format!(
                    "Response size {} exceeds maximum {}",
                    content_length, self.max_response_size
                )));
            }
        }

        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, timeout, request_id))?;

        if text.len() > self.max_response_size {
            return Err(UpstreamError::transport(format!(
                "Response size {} exceeds maximum {}",
                text.len(),
                self.max_response_size
            )));
        }

        Ok(text)
    }

    async fn execute_stream(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<ByteStream, UpstreamError> {
        let request_id = request.request_id;
        // A reqwest timeout would cut a long stream off mid-body, so only
        // the wait for response headers is bounded here.
        let response = tokio::time::timeout(timeout, self.send(&request, None))
            .await
            .map_err(|_| {
                warn!("Stream open timed out after {:?} [request_id: {}]", timeout, request_id);
                UpstreamError::timeout(timeout)
            })??;

        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                let e = e.without_url();
                warn!("Stream read error [request_id: {}]: {}", request_id, e);
                UpstreamError::transport(format!("Stream interrupted: {}", e))
            })
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds() {
        let client = HttpClient::new();
        assert!(client.is_ok());
    }
}
