//! Per-request routing state

use crate::config::RoutingSettings;
use crate::protocol::types::ChatRequest;
use crate::providers::ProviderType;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Model name as sent upstream
///
/// Trims, strips a known `provider/` prefix and then applies aliases. Case is
/// kept; other slashes (`org/model`) are kept.
pub fn resolve_model(requested: &str, aliases: &HashMap<String, String>) -> String {
    let trimmed = requested.trim();
    let bare = match trimmed.split_once('/') {
        Some((prefix, model)) if !model.is_empty() && prefix.parse::<ProviderType>().is_ok() => {
            model
        }
        _ => trimmed,
    };

    aliases
        .iter()
        .find(|(alias, _)| alias.trim().eq_ignore_ascii_case(bare))
        .map(|(_, target)| target.trim().to_string())
        .unwrap_or_else(|| bare.to_string())
}

/// Canonical model name used for channel lookup
///
/// [`resolve_model`] lower-cased.
pub fn normalize_model(requested: &str, aliases: &HashMap<String, String>) -> String {
    resolve_model(requested, aliases).to_lowercase()
}

/// One logical client request travelling through the relay
///
/// Owned by the task serving the request; never shared.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: Uuid,
    pub user_id: Option<String>,
    pub requested_model: String,
    /// Normalized model name channels are matched against
    pub model: String,
    /// Caller's model with prefix and alias resolved, case intact
    pub upstream_model: String,
    pub group: Option<String>,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    retry_count: u32,
    used_channels: Vec<String>,
    start: Instant,
    cancellation: CancellationToken,
}

impl RelayContext {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            request_id: Uuid::new_v4(),
            user_id: None,
            model: normalize_model(&model, &HashMap::new()),
            upstream_model: resolve_model(&model, &HashMap::new()),
            requested_model: model,
            group: None,
            stream: false,
            temperature: None,
            max_tokens: None,
            retry_count: 0,
            used_channels: Vec::new(),
            start: Instant::now(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Build a context for a canonical request
    pub fn from_request(request: &ChatRequest, routing: &RoutingSettings) -> Self {
        let mut ctx = Self::new(request.model.clone());
        ctx.model = normalize_model(&request.model, &routing.model_aliases);
        ctx.upstream_model = resolve_model(&request.model, &routing.model_aliases);
        ctx.user_id = request.user.clone();
        ctx.group = request.group.clone();
        ctx.stream = request.stream;
        ctx.temperature = request.temperature;
        ctx.max_tokens = request.max_tokens;
        ctx
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Tie the context to a caller-owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Channel ids tried so far, in order
    pub fn used_channels(&self) -> &[String] {
        &self.used_channels
    }

    pub fn has_tried(&self, channel_id: &str) -> bool {
        self.used_channels.iter().any(|id| id == channel_id)
    }

    /// Number of attempts made so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Record an attempt on a channel
    pub fn mark_used(&mut self, channel_id: &str) {
        if !self.has_tried(channel_id) {
            self.used_channels.push(channel_id.to_string());
        }
        self.retry_count += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left before the overall deadline, `None` once it has passed
    pub fn remaining(&self, deadline: Duration) -> Option<Duration> {
        deadline.checked_sub(self.elapsed()).filter(|d| !d.is_zero())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::Message;

    #[test]
    fn test_normalize_model() {
        let mut aliases = HashMap::new();
        aliases.insert("gpt4".to_string(), "GPT-4o".to_string());

        assert_eq!(normalize_model("  GPT-4o ", &aliases), "gpt-4o");
        assert_eq!(normalize_model("openai/gpt-4o-mini", &aliases), "gpt-4o-mini");
        assert_eq!(normalize_model("gpt4", &aliases), "gpt-4o");
        assert_eq!(normalize_model("claude-3", &aliases), "claude-3");
        assert_eq!(
            normalize_model("meta-llama/Llama-3-8B", &aliases),
            "meta-llama/llama-3-8b"
        );
    }

    #[test]
    fn test_resolve_model_keeps_case() {
        let mut aliases = HashMap::new();
        aliases.insert("llama".to_string(), "meta-llama/Llama-3-8B-Instruct".to_string());

        assert_eq!(
            resolve_model(" openai/meta-llama/Llama-3-8B-Instruct ", &aliases),
            "meta-llama/Llama-3-8B-Instruct"
        );
        assert_eq!(resolve_model("LLAMA", &aliases), "meta-llama/Llama-3-8B-Instruct");
        assert_eq!(resolve_model("Qwen/Qwen2-7B", &aliases), "Qwen/Qwen2-7B");
    }

    #[test]
    fn test_from_request() {
        let request = ChatRequest::new("Claude/Claude-3-Haiku", vec![Message::user("hi")])
            .with_user("u1")
            .with_group("vip")
            .with_streaming();
        let ctx = RelayContext::from_request(&request, &RoutingSettings::default());

        assert_eq!(ctx.requested_model, "Claude/Claude-3-Haiku");
        assert_eq!(ctx.model, "claude-3-haiku");
        assert_eq!(ctx.upstream_model, "Claude-3-Haiku");
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.group.as_deref(), Some("vip"));
        assert!(ctx.stream);
    }

    #[test]
    fn test_used_channels_only_grow() {
        let mut ctx = RelayContext::new("x");
        ctx.mark_used("a");
        ctx.mark_used("b");
        ctx.mark_used("a");
        assert_eq!(ctx.used_channels(), ["a", "b"]);
        assert_eq!(ctx.retry_count(), 3);
        assert!(ctx.has_tried("b"));
    }

    #[test]
    fn test_remaining_deadline() {
        let ctx = RelayContext::new("x");
        assert!(ctx.remaining(Duration::from_secs(60)).is_some());
        assert!(ctx.remaining(Duration::ZERO).is_none());
    }
}
