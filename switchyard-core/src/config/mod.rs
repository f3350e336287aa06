//! Configuration for the relay core
//!
//! Relay settings (behaviour knobs) load from YAML or JSON with `${VAR}`
//! environment placeholders. Channel sets are not read here; they arrive
//! through a [`ChannelSource`](crate::channel::ChannelSource).

pub mod env;
mod error;
mod schema;
mod secrets;
mod validator;

pub use error::{ConfigError, ConfigResult, ValidationError, ValidationErrorKind};
pub use schema::{
    BreakerSettings, EventSettings, HealthCheckSettings, PriceOverride, RegistrySettings,
    RelaySettings, RetrySettings, RoutingPolicy, RoutingSettings, TimeoutSettings,
    SETTINGS_VERSION,
};
pub use secrets::{SafeLogging, SecretString};
pub use validator::ConfigValidator;

use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

#[derive(Clone, Copy)]
enum Format {
    Yaml,
    Json,
}

fn read(path: &Path) -> ConfigResult<String> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    // Interpolate environment variables before parsing
    env::interpolate_env_vars(&content)
}

fn parse<T: DeserializeOwned>(content: &str, origin: &str, format: Format) -> ConfigResult<T> {
    match format {
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: origin.to_string(),
            line: e.location().map(|l| l.line()),
            column: e.location().map(|l| l.column()),
            message: e.to_string(),
        }),
        Format::Json => serde_json::from_str(content).map_err(|e| ConfigError::ParseError {
            path: origin.to_string(),
            line: Some(e.line()),
            column: Some(e.column()),
            message: e.to_string(),
        }),
    }
}

fn finish_settings(settings: RelaySettings) -> ConfigResult<RelaySettings> {
    ConfigValidator::new().validate(&settings)?;
    Ok(settings)
}

/// Load relay settings from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> ConfigResult<RelaySettings> {
    let path = path.as_ref();
    let content = read(path)?;
    finish_settings(parse(&content, &path.to_string_lossy(), Format::Yaml)?)
}

/// Load relay settings from a JSON file
pub fn load_from_json<P: AsRef<Path>>(path: P) -> ConfigResult<RelaySettings> {
    let path = path.as_ref();
    let content = read(path)?;
    finish_settings(parse(&content, &path.to_string_lossy(), Format::Json)?)
}

/// Parse relay settings from an in-memory YAML document
pub fn from_yaml_str(content: &str) -> ConfigResult<RelaySettings> {
    let interpolated = env::interpolate_env_vars(content)?;
    finish_settings(parse(&interpolated, "<inline>", Format::Yaml)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r#"
version: "0.1"
routing:
  policy: least_connections
  model_aliases:
    gpt4: gpt-4o
retry:
  budget: 2
circuit_breaker:
  failure_threshold: 3
  cooldown_ms: 1000
"#;
        let settings = from_yaml_str(yaml).unwrap();
        assert_eq!(settings.routing.policy, RoutingPolicy::LeastConnections);
        assert_eq!(settings.retry.budget, 2);
        assert_eq!(settings.circuit_breaker.failure_threshold, 3);
        assert_eq!(settings.timeouts.attempt_ms, 30_000);
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let yaml = "version: \"0.1\"\nretries: 3\n";
        assert!(matches!(
            from_yaml_str(yaml),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let err = from_yaml_str("version: \"9.9\"\n").unwrap_err();
        match err {
            ConfigError::ValidationError(e) => assert_eq!(e.field_path, "version"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
