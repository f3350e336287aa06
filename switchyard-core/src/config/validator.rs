//! Cross-field validation for settings and channel sets

use super::error::{ConfigError, ValidationError};
use super::schema::RelaySettings;
use crate::channel::{Channel, ChannelConfig};
use std::collections::HashSet;
use tracing::warn;

/// Validator applying rules that span more than one field
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate relay settings with extended rules
    pub fn validate(&self, settings: &RelaySettings) -> Result<(), ValidationError> {
        settings.validate()?;
        self.validate_aliases(settings)?;
        Ok(())
    }

    fn validate_aliases(&self, settings: &RelaySettings) -> Result<(), ValidationError> {
        for (alias, target) in &settings.routing.model_aliases {
            let path = format!("routing.model_aliases.{}", alias);
            if alias.trim().is_empty() {
                return Err(ValidationError::required("routing.model_aliases"));
            }
            if target.trim().is_empty() {
                return Err(ValidationError::required(path));
            }
            if alias.trim().eq_ignore_ascii_case(target.trim()) {
                return Err(ValidationError::incompatible(path, "Alias maps to itself"));
            }
            // Aliases are resolved once, so a chain silently stops early
            if settings
                .routing
                .model_aliases
                .keys()
                .any(|k| k.trim().eq_ignore_ascii_case(target.trim()))
            {
                return Err(ValidationError::incompatible(
                    path,
                    format!("Target '{}' is itself an alias", target),
                ));
            }
        }
        Ok(())
    }

    /// Resolve a channel set, rejecting it as a whole on the first problem
    pub fn validate_channels(
        &self,
        configs: Vec<ChannelConfig>,
    ) -> Result<Vec<Channel>, ConfigError> {
        let mut seen = HashSet::with_capacity(configs.len());
        let mut channels = Vec::with_capacity(configs.len());

        for config in configs {
            if !seen.insert(config.id.clone()) {
                return Err(
                    ValidationError::duplicate("channels[].id", config.id.clone()).into(),
                );
            }
            let channel = config.resolve()?;
            if channel.models.iter().any(|m| m == "*") && channel.models.len() > 1 {
                warn!(
                    channel_id = %channel.id,
                    "Channel lists '*' alongside explicit models; '*' already matches all"
                );
            }
            channels.push(channel);
        }

        Ok(channels)
    }
}
