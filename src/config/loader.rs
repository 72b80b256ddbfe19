//! Configuration file loading and parsing.

use std::path::Path;

use anyhow::{Context, Result};

use super::model::AppConfig;
use crate::error::ConfigError;
use crate::validation::report::format_report;
use crate::validation::validate_config;

/// Loads the configuration file from disk and parses it.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: AppConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(config)
}

/// Loads and fully validates the configuration file.
pub fn load_and_validate(path: &Path) -> Result<AppConfig> {
    let config = load_from_path(path).context("Failed to load configuration")?;

    let result = validate_config(&config);

    for issue in result.warnings() {
        tracing::warn!(
            path = %issue.path,
            message = %issue.message,
            suggestion = ?issue.suggestion,
            "Config validation warning"
        );
    }

    if !result.is_valid() {
        tracing::error!("{}", format_report(&result));
        anyhow::bail!(ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_valid_file() {
        let file = write_config(
            r#"
redis:
  host: localhost
retry:
  max_attempts: 4
channels:
  email_webhook_url: http://mailer.internal/send
"#,
        );

        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.redis.host, "localhost");
        assert_eq!(config.retry.max_attempts, 4);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from_path(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let file = write_config("retry: [unclosed");
        let err = load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = write_config("retry:\n  max_attempts: 0\n");
        let err = load_and_validate(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ValidationFailed { error_count: 1 })
        ));
    }
}
