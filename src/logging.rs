//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use crate::error::{BeatError, Result};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Default filter directive (e.g. "info", "sap_audit_beat=debug")
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                BeatError::Config(format!("logging.level '{}': {}", self.level, e))
            }),
        }
    }
}

/// Install the global tracing subscriber
///
/// Fails if the level is not a valid filter or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if install_logging(config)? {
        Ok(())
    } else {
        Err(BeatError::Config(
            "Failed to install logger: a global subscriber is already set".to_string(),
        ))
    }
}

/// Install the global tracing subscriber unless one is already set
///
/// Returns `false` when an embedding application installed its own.
/// An invalid level is still an error.
pub fn install_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    Ok(result.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: LoggingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "sap_audit_beat=verbose".to_string(),
            json: false,
        };
        assert!(matches!(init_logging(&config), Err(BeatError::Config(_))));
    }

    #[test]
    fn test_second_install_fails() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_install_keeps_existing_subscriber() {
        let config = LoggingConfig::default();
        let _ = install_logging(&config);
        assert!(!install_logging(&config).unwrap());
    }
}
