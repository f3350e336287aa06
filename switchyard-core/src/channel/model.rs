//! Channel configuration and the resolved, routable channel

use crate::config::env::has_placeholder;
use crate::config::{ConfigError, SafeLogging, SecretString, ValidationError, ValidationErrorKind};
use crate::providers::ProviderType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Administrative and health status of a channel
///
/// Maps to an `AtomicU8` in the channel's runtime stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChannelStatus {
    #[default]
    Active = 0,
    Disabled = 1,
    Exhausted = 2,
    Error = 3,
    Testing = 4,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "active",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::Exhausted => "exhausted",
            ChannelStatus::Error => "error",
            ChannelStatus::Testing => "testing",
        }
    }

    /// Whether the selector may route to a channel in this status
    pub fn is_routable(&self) -> bool {
        !matches!(self, ChannelStatus::Disabled | ChannelStatus::Exhausted)
    }
}

impl From<u8> for ChannelStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => ChannelStatus::Disabled,
            2 => ChannelStatus::Exhausted,
            3 => ChannelStatus::Error,
            4 => ChannelStatus::Testing,
            _ => ChannelStatus::Active,
        }
    }
}

impl From<ChannelStatus> for u8 {
    fn from(status: ChannelStatus) -> Self {
        status as u8
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel definition as supplied by a [`ChannelSource`](super::ChannelSource)
///
/// The provider type is kept as text so an unknown type is reported by the
/// registry load rather than by whatever store produced the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Provider type name ("openai", "anthropic", "google", "ollama")
    #[serde(rename = "type")]
    pub provider: String,

    #[serde(default)]
    pub key: SecretString,

    /// Endpoint root; defaults per provider type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Served model names; `*` serves any model, `prefix*` a family
    #[serde(default)]
    pub models: Vec<String>,

    /// Canonical model name -> upstream model name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_mapping: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Lower tries first
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Status the channel starts in
    #[serde(default)]
    pub status: ChannelStatus,

    /// Remaining balance in USD; a non-positive balance starts exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_limit: Option<u64>,
}

fn default_weight() -> u32 {
    1
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            provider: provider.into(),
            key: SecretString::default(),
            base_url: None,
            models: Vec::new(),
            model_mapping: HashMap::new(),
            groups: Vec::new(),
            priority: 0,
            weight: default_weight(),
            status: ChannelStatus::Active,
            balance: None,
            rpm_limit: None,
            tpm_limit: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<SecretString>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn with_rpm_limit(mut self, rpm: u32) -> Self {
        self.rpm_limit = Some(rpm);
        self
    }

    pub fn with_tpm_limit(mut self, tpm: u64) -> Self {
        self.tpm_limit = Some(tpm);
        self
    }

    /// Validate and resolve into a routable [`Channel`]
    pub fn resolve(self) -> Result<Channel, ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::required("channels[].id").into());
        }
        let path = format!("channels[{}]", self.id);

        let provider: ProviderType =
            self.provider
                .parse()
                .map_err(|_| ConfigError::UnknownProvider {
                    channel: self.id.clone(),
                    provider: self.provider.clone(),
                })?;

        if self.weight == 0 {
            return Err(
                ValidationError::out_of_range(format!("{}.weight", path), "Must be at least 1")
                    .into(),
            );
        }

        if self.models.iter().all(|m| m.trim().is_empty()) {
            return Err(ValidationError::required(format!("{}.models", path)).into());
        }

        if provider.requires_key() && self.key.is_empty() {
            return Err(ValidationError::required(format!("{}.key", path)).into());
        }

        if has_placeholder(self.key.expose_secret()) {
            return Err(ValidationError::incompatible(
                format!("{}.key", path),
                "Unresolved environment placeholder",
            )
            .into());
        }

        if let Some(base_url) = &self.base_url {
            validate_url(base_url, &format!("{}.base_url", path))?;
        }

        let name = self.name.unwrap_or_else(|| self.id.clone());
        Ok(Channel {
            id: self.id,
            name,
            provider,
            key: self.key,
            base_url: self.base_url,
            models: self
                .models
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            model_mapping: self
                .model_mapping
                .into_iter()
                .map(|(from, to)| (from.trim().to_lowercase(), to))
                .collect(),
            groups: self.groups,
            priority: self.priority,
            weight: self.weight,
            initial_status: self.status,
            balance: self.balance,
            rpm_limit: self.rpm_limit,
            tpm_limit: self.tpm_limit,
        })
    }
}

fn validate_url(raw: &str, field_path: &str) -> Result<(), ValidationError> {
    let url = Url::parse(raw).map_err(|e| {
        ValidationError::new(
            field_path,
            ValidationErrorKind::InvalidUrl {
                message: e.to_string(),
            },
        )
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::new(
            field_path,
            ValidationErrorKind::InvalidUrl {
                message: format!("Unsupported scheme '{}'", url.scheme()),
            },
        ));
    }

    Ok(())
}

/// A validated channel
///
/// Immutable for the lifetime of a registry epoch; runtime counters live in
/// [`ChannelStats`](super::ChannelStats). Requests refer to channels by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub provider: ProviderType,
    pub key: SecretString,
    pub base_url: Option<String>,
    /// Lower-cased model patterns
    pub models: Vec<String>,
    /// Lower-cased canonical name -> upstream name
    pub model_mapping: HashMap<String, String>,
    pub groups: Vec<String>,
    pub priority: i32,
    pub weight: u32,
    pub initial_status: ChannelStatus,
    pub balance: Option<f64>,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u64>,
}

impl Channel {
    /// Whether this channel serves the (normalized) model name
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => pattern == model,
        })
    }

    /// Whether this channel carries the group tag; no hint matches everything
    pub fn in_group(&self, group: Option<&str>) -> bool {
        match group {
            None => true,
            Some(group) => self.groups.iter().any(|g| g == group),
        }
    }

    /// Upstream model name for a requested model name
    ///
    /// Mapping keys match case-insensitively; unmapped names pass through.
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(&model.to_lowercase())
            .map(String::as_str)
            .unwrap_or(model)
    }

    /// Status a freshly loaded channel starts in
    pub fn starting_status(&self) -> ChannelStatus {
        match self.balance {
            Some(balance) if balance <= 0.0 && self.initial_status != ChannelStatus::Disabled => {
                ChannelStatus::Exhausted
            }
            _ => self.initial_status,
        }
    }
}

impl SafeLogging for Channel {
    fn safe_for_logging(&self) -> String {
        format!(
            "Channel {{ id: {}, provider: {}, base_url: {}, key: {}, priority: {}, weight: {} }}",
            self.id,
            self.provider,
            self.base_url.as_deref().unwrap_or("<default>"),
            self.key.partial_redact(),
            self.priority,
            self.weight
        )
    }
}
