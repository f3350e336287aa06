//! HTTP layer for the upstream leg of a relay attempt
//!
//! This module handles:
//! - The `HttpExecutor` seam the orchestrator and health checker call through
//! - A pooled reqwest client implementing it
//! - Mapping of transport failures and non-2xx responses to [`UpstreamError`]

pub mod client;
pub mod error;

pub use client::HttpClient;
pub use error::{map_http_error, parse_retry_after, ErrorClass, UpstreamError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// HTTP method of an upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// A fully built provider request: URL, headers and JSON body
///
/// Built by a provider adapter from a channel and a canonical request.
/// Headers may carry credentials, so the `Debug` impl only lists header names.
#[derive(Clone)]
pub struct ProviderRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    /// Correlation id sent as `X-Request-ID`
    pub request_id: Uuid,
}

impl ProviderRequest {
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::new(),
            body: Some(body),
            request_id: Uuid::new_v4(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            request_id: Uuid::new_v4(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }
}

impl fmt::Debug for ProviderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut header_names: Vec<&str> = self.headers.keys().map(String::as_str).collect();
        header_names.sort_unstable();
        // Query strings can carry keys (Google), so only the path is shown
        let url = self.url.split('?').next().unwrap_or("");
        f.debug_struct("ProviderRequest")
            .field("method", &self.method)
            .field("url", &url)
            .field("headers", &header_names)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Raw upstream body chunks of a streamed response
pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// Trait for HTTP executors
///
/// Both calls must give up after `timeout`. For streams, `timeout` bounds the
/// wait for response headers; the caller bounds the body.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    /// Execute a request and return the full response body of a 2xx reply
    async fn execute(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<String, UpstreamError>;

    /// Execute a request and return the 2xx response body as a byte stream
    ///
    /// Dropping the returned stream tears down the upstream connection.
    async fn execute_stream(
        &self,
        request: ProviderRequest,
        timeout: Duration,
    ) -> Result<ByteStream, UpstreamError>;
}
