//! Environment variable interpolation for settings and channel files

use super::error::ConfigError;
use regex::Regex;
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env placeholder pattern is valid")
});

/// Whether a value still contains a `${VAR}` placeholder
pub fn has_placeholder(value: &str) -> bool {
    ENV_VAR_PATTERN.is_match(value)
}

/// Replace every `${VAR}` reference with the variable's value
///
/// Fails on the first reference whose variable is unset.
pub fn interpolate_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(content.len());
    let mut last = 0;

    for cap in ENV_VAR_PATTERN.captures_iter(content) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        let value = env::var(var_name).map_err(|_| ConfigError::EnvVarNotFound {
            var: var_name.to_string(),
        })?;

        result.push_str(&content[last..full_match.start()]);
        result.push_str(&value);
        last = full_match.end();
    }

    result.push_str(&content[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars() {
        env::set_var("SWITCHYARD_TEST_VAR", "test_value");

        let content = "key: ${SWITCHYARD_TEST_VAR}";
        let result = interpolate_env_vars(content).unwrap();
        assert_eq!(result, "key: test_value");

        env::remove_var("SWITCHYARD_TEST_VAR");
    }

    #[test]
    fn test_missing_env_var() {
        let content = "key: ${SWITCHYARD_MISSING_VAR}";
        let result = interpolate_env_vars(content);

        match result {
            Err(ConfigError::EnvVarNotFound { var }) => assert_eq!(var, "SWITCHYARD_MISSING_VAR"),
            other => panic!("Expected EnvVarNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_env_vars() {
        env::set_var("SWITCHYARD_VAR1", "value1");
        env::set_var("SWITCHYARD_VAR2", "value2");

        let content = "key1: ${SWITCHYARD_VAR1}, key2: ${SWITCHYARD_VAR2}, again: ${SWITCHYARD_VAR1}";
        let result = interpolate_env_vars(content).unwrap();
        assert_eq!(result, "key1: value1, key2: value2, again: value1");

        env::remove_var("SWITCHYARD_VAR1");
        env::remove_var("SWITCHYARD_VAR2");
    }

    #[test]
    fn test_lowercase_braces_left_alone() {
        let content = "template: ${not_a_var}";
        assert_eq!(interpolate_env_vars(content).unwrap(), content);
        assert!(!has_placeholder(content));
    }
}
