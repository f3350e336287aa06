//! Shared fixtures for relay integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::channel::ChannelConfig;
use switchyard_core::config::RelaySettings;
use switchyard_core::http::{ByteStream, HttpExecutor, ProviderRequest, UpstreamError};
use switchyard_core::relay::{Relay, RetryPolicy, UsageRecord, UsageSink};

/// How a scripted upstream answers every call
#[derive(Clone)]
pub enum Reply {
    Body(String),
    Fail(UpstreamError),
    /// Never answers
    Hang,
    Stream { frames: Vec<String>, end: StreamEnd },
}

/// What a scripted stream does after its frames
#[derive(Clone)]
pub enum StreamEnd {
    Done,
    Error(UpstreamError),
    Hang,
}

/// Upstream double keyed by the first label of the request host
///
/// A channel `a` with base URL `http://a.test/v1` answers with the reply
/// registered under `"a"`.
pub struct ScriptedExecutor {
    replies: HashMap<String, Reply>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(mut self, host: &str, reply: Reply) -> Self {
        self.replies.insert(host.to_string(), reply);
        self
    }

    /// Hosts called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn reply_for(&self, request: &ProviderRequest) -> Reply {
        let host = url::Url::parse(&request.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.split('.').next().unwrap_or(h).to_string()))
            .unwrap_or_default();
        self.calls.lock().push(host.clone());
        self.replies
            .get(&host)
            .cloned()
            .unwrap_or_else(|| Reply::Fail(UpstreamError::transport(format!("no script for {}", host))))
    }
}

#[async_trait]
impl HttpExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ProviderRequest,
        _timeout: Duration,
    ) -> Result<String, UpstreamError> {
        match self.reply_for(&request) {
            Reply::Body(body) => Ok(body),
            Reply::Fail(error) => Err(error),
            Reply::Hang => futures::future::pending().await,
            Reply::Stream { .. } => Err(UpstreamError::transport("unary call on a stream script")),
        }
    }

    async fn execute_stream(
        &self,
        request: ProviderRequest,
        _timeout: Duration,
    ) -> Result<ByteStream, UpstreamError> {
        match self.reply_for(&request) {
            Reply::Stream { frames, end } => {
                let head = stream::iter(frames.into_iter().map(|f| Ok(Bytes::from(f))));
                let tail: ByteStream = match end {
                    StreamEnd::Done => stream::empty().boxed(),
                    StreamEnd::Error(error) => stream::once(async move { Err(error) }).boxed(),
                    StreamEnd::Hang => stream::pending().boxed(),
                };
                Ok(head.chain(tail).boxed())
            }
            Reply::Fail(error) => Err(error),
            Reply::Hang => futures::future::pending().await,
            Reply::Body(_) => Err(UpstreamError::transport("stream call on a unary script")),
        }
    }
}

/// Usage sink that keeps every record
#[derive(Default)]
pub struct CollectingSink(Mutex<Vec<UsageRecord>>);

impl CollectingSink {
    pub fn records(&self) -> Vec<UsageRecord> {
        self.0.lock().clone()
    }
}

impl UsageSink for CollectingSink {
    fn record(&self, record: UsageRecord) {
        self.0.lock().push(record);
    }
}

/// OpenAI channel `id` reachable at `http://{id}.test/v1`
pub fn openai_channel(id: &str, priority: i32) -> ChannelConfig {
    ChannelConfig::new(id, "openai")
        .with_key("sk-test-abcdef123456")
        .with_base_url(format!("http://{}.test/v1", id))
        .with_models(["gpt-4o"])
        .with_priority(priority)
}

/// Relay over `executor` with no backoff between attempts
pub fn relay_with(
    settings: RelaySettings,
    executor: Arc<ScriptedExecutor>,
    sink: Arc<CollectingSink>,
) -> Relay {
    let budget = settings.retry.budget;
    Relay::builder(settings)
        .http_executor(executor)
        .usage_sink(sink)
        .retry_policy(RetryPolicy::immediate(budget))
        .build()
        .unwrap()
}

pub fn settings_with_budget(budget: u32) -> RelaySettings {
    let mut settings = RelaySettings::default();
    settings.retry.budget = budget;
    settings
}

pub fn server_error() -> UpstreamError {
    UpstreamError::Server {
        status: 500,
        message: "internal error".to_string(),
    }
}

/// Unary OpenAI completion body
pub fn completion_body(content: &str) -> String {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    })
    .to_string()
}

/// One SSE frame carrying a content delta
pub fn delta_frame(id: &str, content: &str) -> String {
    let chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    });
    format!("data: {}\n\n", chunk)
}

/// SSE frame announcing the assistant role with no text
pub fn role_frame(id: &str) -> String {
    let chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
    });
    format!("data: {}\n\n", chunk)
}

/// SSE frame closing the stream with a finish reason and usage
pub fn finish_frame(id: &str, prompt_tokens: u32, completion_tokens: u32) -> String {
    let chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    });
    format!("data: {}\n\n", chunk)
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";
