//! Beat configuration
//!
//! JSON document with serde defaults, validated once at startup:
//!
//! ```json
//! {
//!   "pollInterval": "60s",
//!   "cursorPath": "/var/lib/sap-audit-beat/cursors.json",
//!   "sources": [{
//!     "id": "PRD-100",
//!     "timezone": "Asia/Dubai",
//!     "credentials": {"url": "https://sap.example.com/audit", "client": "100",
//!                     "username": "AUDITREADER", "secret": "..."}
//!   }],
//!   "sinks": [
//!     {"type": "file", "path": "/var/log/sap/audit.jsonl"},
//!     {"type": "tcp", "address": "127.0.0.1:12225"}
//!   ]
//! }
//! ```
//!
//! Durations are strings: `"500ms"`, `"30s"`, `"5m"`, `"1h"`.

use crate::credentials::Credentials;
use crate::error::{BeatError, Result};
use crate::logging::LoggingConfig;
use crate::normalize::{FailurePolicy, NormalizerOptions};
use crate::retry::RetryPolicy;
use crate::sink::{FileSinkConfig, TcpSinkConfig};
use crate::source::SapSourceSettings;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for per-source lookback, settle delay, and window size
const MAX_SPAN: Duration = Duration::from_secs(3650 * 86_400);

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatConfig {
    /// Default interval between polls of each source
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// How long shutdown waits for running cycles
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace: Duration,

    /// Cursor document shared by all sources
    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,

    /// Backoff for upstream fetches and sink deliveries
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub logging: LoggingConfig,

    pub sources: Vec<SourceConfig>,

    pub sinks: Vec<SinkEntry>,

    /// Where records that fail normalization are kept (quarantine policy)
    #[serde(default)]
    pub quarantine_path: Option<PathBuf>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_cursor_path() -> PathBuf {
    PathBuf::from("state/cursors.json")
}

/// One monitored SAP system/client
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,

    /// IANA zone of the SAP system clock
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Overrides the top-level poll interval
    #[serde(default, deserialize_with = "duration_serde::deserialize_option")]
    pub poll_interval: Option<Duration>,

    #[serde(default = "default_initial_lookback", with = "duration_serde")]
    pub initial_lookback: Duration,

    #[serde(default, with = "duration_serde")]
    pub settle_delay: Duration,

    #[serde(default = "default_max_window", with = "duration_serde")]
    pub max_window: Duration,

    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    pub credentials: Credentials,

    #[serde(default)]
    pub normalizer: NormalizerOptions,
}

fn default_timezone() -> String {
    "Asia/Dubai".to_string()
}
fn default_initial_lookback() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_max_window() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

impl SourceConfig {
    /// Parsed time zone; unknown names are a configuration error
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            BeatError::Config(format!(
                "Source '{}': unknown time zone '{}': {}",
                self.id, self.timezone, e
            ))
        })
    }

    /// Settings for the SAP HTTP client
    pub fn sap_settings(&self) -> Result<SapSourceSettings> {
        Ok(SapSourceSettings {
            timezone: self.tz()?,
            initial_lookback: self.initial_lookback,
            settle_delay: self.settle_delay,
            max_window: self.max_window,
            request_timeout: self.request_timeout,
        })
    }
}

/// Sink kind and its settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    File(FileSinkConfig),
    Tcp(TcpSinkConfig),
}

/// A configured sink
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkEntry {
    /// Unique sink name; defaults to the sink type
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub sink: SinkConfig,
}

impl SinkEntry {
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| match self.sink {
            SinkConfig::File(_) => "file".to_string(),
            SinkConfig::Tcp(_) => "tcp".to_string(),
        })
    }
}

impl BeatConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| BeatError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&src)
            .map_err(|e| BeatError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(src: &str) -> Result<Self> {
        let cfg: BeatConfig = serde_json::from_str(src)
            .map_err(|e| BeatError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(BeatError::Config("pollInterval must be positive".to_string()));
        }
        self.retry.validate()?;

        if self.sources.is_empty() {
            return Err(BeatError::Config("At least one source is required".to_string()));
        }
        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(BeatError::Config("Source id must not be empty".to_string()));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(BeatError::Config(format!("Duplicate source '{}'", source.id)));
            }
            source.tz()?;
            source.credentials.validate(&source.id)?;
            if source.max_window.is_zero() {
                return Err(BeatError::Config(format!(
                    "Source '{}': maxWindow must be positive",
                    source.id
                )));
            }
            for (name, value) in [
                ("initialLookback", source.initial_lookback),
                ("settleDelay", source.settle_delay),
                ("maxWindow", source.max_window),
            ] {
                if value > MAX_SPAN {
                    return Err(BeatError::Config(format!(
                        "Source '{}': {} must not exceed {} days",
                        source.id,
                        name,
                        MAX_SPAN.as_secs() / 86_400
                    )));
                }
            }
            if source.poll_interval.is_some_and(|d| d.is_zero()) {
                return Err(BeatError::Config(format!(
                    "Source '{}': pollInterval must be positive",
                    source.id
                )));
            }
            if source.normalizer.on_failure == FailurePolicy::Quarantine
                && self.quarantine_path.is_none()
            {
                return Err(BeatError::Config(format!(
                    "Source '{}': onFailure 'quarantine' requires quarantinePath",
                    source.id
                )));
            }
        }

        if self.sinks.is_empty() {
            return Err(BeatError::Config("At least one sink is required".to_string()));
        }
        let mut names = HashSet::new();
        for entry in &self.sinks {
            let name = entry.name();
            if !names.insert(name.clone()) {
                return Err(BeatError::Config(format!(
                    "Duplicate sink name '{}' (set \"name\" to tell sinks apart)",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Poll interval for a source, falling back to the global default
    pub fn interval_for(&self, source: &SourceConfig) -> Duration {
        source.poll_interval.unwrap_or(self.poll_interval)
    }
}

pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("'{s}': {e}"));
        if let Some(v) = s.strip_suffix("ms") {
            return parse(v).map(Duration::from_millis);
        }
        if let Some(v) = s.strip_suffix('s') {
            return parse(v).map(Duration::from_secs);
        }
        let scaled = |v: &str, factor: u64| -> Result<Duration, String> {
            parse(v)?
                .checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("'{s}': duration too large"))
        };
        if let Some(v) = s.strip_suffix('m') {
            return scaled(v, 60);
        }
        if let Some(v) = s.strip_suffix('h') {
            return scaled(v, 3600);
        }
        Err(format!(
            "unknown duration format: '{s}' (use '500ms', '30s', '5m' or '1h')"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "sources": [{
            "id": "PRD-100",
            "credentials": {"url": "https://sap.example.com/audit", "username": "U", "secret": "S"}
        }],
        "sinks": [{"type": "file", "path": "audit.jsonl"}]
    }"#;

    fn with(sources: &str, sinks: &str, extra: &str) -> String {
        format!(r#"{{ "sources": {sources}, "sinks": {sinks} {extra} }}"#)
    }

    const SOURCE: &str = r#"[{"id": "PRD-100",
        "credentials": {"url": "https://sap.example.com/audit", "username": "U", "secret": "S"}}]"#;
    const FILE_SINK: &str = r#"[{"type": "file", "path": "audit.jsonl"}]"#;

    #[test]
    fn test_minimal_defaults() {
        let cfg = BeatConfig::from_json(MINIMAL).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
        assert_eq!(cfg.cursor_path, PathBuf::from("state/cursors.json"));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.logging, LoggingConfig::default());
        assert!(cfg.quarantine_path.is_none());

        let source = &cfg.sources[0];
        assert_eq!(source.timezone, "Asia/Dubai");
        assert_eq!(source.tz().unwrap(), chrono_tz::Asia::Dubai);
        assert_eq!(source.initial_lookback, Duration::from_secs(86_400));
        assert_eq!(source.settle_delay, Duration::ZERO);
        assert_eq!(source.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.interval_for(source), Duration::from_secs(60));

        assert_eq!(cfg.sinks[0].name(), "file");
    }

    #[test]
    fn test_full_document() {
        let src = r#"{
            "pollInterval": "5m",
            "shutdownGrace": "500ms",
            "cursorPath": "/var/lib/beat/cursors.json",
            "retry": {"maxAttempts": 3, "baseDelayMs": 100, "maxDelayMs": 1000, "jitter": 0.1},
            "logging": {"level": "debug", "json": true},
            "quarantinePath": "/var/lib/beat/quarantine.jsonl",
            "sources": [{
                "id": "PRD-100",
                "timezone": "Europe/Berlin",
                "pollInterval": "30s",
                "settleDelay": "1m",
                "maxWindow": "1h",
                "credentials": {"url": "https://sap.example.com/audit", "client": "100",
                                "username": "U", "secret": "S"},
                "normalizer": {"onFailure": "quarantine", "nonexistent": "shift_forward"}
            }],
            "sinks": [
                {"type": "file", "path": "/var/log/sap/audit.jsonl", "maxBytes": 1024},
                {"type": "tcp", "name": "siem", "address": "10.0.0.9:12225"}
            ]
        }"#;
        let cfg = BeatConfig::from_json(src).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(300));
        assert_eq!(cfg.shutdown_grace, Duration::from_millis(500));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.logging.json);

        let source = &cfg.sources[0];
        assert_eq!(cfg.interval_for(source), Duration::from_secs(30));
        let settings = source.sap_settings().unwrap();
        assert_eq!(settings.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(settings.settle_delay, Duration::from_secs(60));
        assert_eq!(settings.max_window, Duration::from_secs(3600));
        assert_eq!(source.normalizer.on_failure, FailurePolicy::Quarantine);

        match &cfg.sinks[0].sink {
            SinkConfig::File(file) => assert_eq!(file.max_bytes, 1024),
            other => panic!("Expected file sink, got {other:?}"),
        }
        assert_eq!(cfg.sinks[1].name(), "siem");
        match &cfg.sinks[1].sink {
            SinkConfig::Tcp(tcp) => assert_eq!(tcp.address, "10.0.0.9:12225"),
            other => panic!("Expected tcp sink, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let sources = r#"[{"id": "PRD-100", "timezone": "Mars/Olympus",
            "credentials": {"url": "https://x", "username": "U", "secret": "S"}}]"#;
        let err = BeatConfig::from_json(&with(sources, FILE_SINK, "")).unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
    }

    #[test]
    fn test_requires_sources_and_sinks() {
        assert!(BeatConfig::from_json(&with("[]", FILE_SINK, "")).is_err());
        assert!(BeatConfig::from_json(&with(SOURCE, "[]", "")).is_err());
    }

    #[test]
    fn test_duplicate_sink_names_rejected() {
        let sinks = r#"[{"type": "file", "path": "a"}, {"type": "file", "path": "b"}]"#;
        assert!(BeatConfig::from_json(&with(SOURCE, sinks, "")).is_err());

        let named = r#"[{"type": "file", "path": "a"}, {"type": "file", "name": "b", "path": "b"}]"#;
        assert!(BeatConfig::from_json(&with(SOURCE, named, "")).is_ok());
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let sources = r#"[
            {"id": "PRD-100", "credentials": {"url": "https://x", "username": "U", "secret": "S"}},
            {"id": "PRD-100", "credentials": {"url": "https://y", "username": "U", "secret": "S"}}
        ]"#;
        assert!(BeatConfig::from_json(&with(sources, FILE_SINK, "")).is_err());
    }

    #[test]
    fn test_quarantine_policy_requires_path() {
        let sources = r#"[{"id": "PRD-100", "normalizer": {"onFailure": "quarantine"},
            "credentials": {"url": "https://x", "username": "U", "secret": "S"}}]"#;
        assert!(BeatConfig::from_json(&with(sources, FILE_SINK, "")).is_err());
        assert!(BeatConfig::from_json(&with(
            sources,
            FILE_SINK,
            r#", "quarantinePath": "q.jsonl""#
        ))
        .is_ok());
    }

    #[test]
    fn test_oversized_window_rejected() {
        let sources = r#"[{"id": "PRD-100", "maxWindow": "100000000h",
            "credentials": {"url": "https://x", "username": "U", "secret": "S"}}]"#;
        let err = BeatConfig::from_json(&with(sources, FILE_SINK, "")).unwrap_err();
        assert!(err.to_string().contains("maxWindow"));

        let sources = r#"[{"id": "PRD-100", "initialLookback": "87601h",
            "credentials": {"url": "https://x", "username": "U", "secret": "S"}}]"#;
        assert!(BeatConfig::from_json(&with(sources, FILE_SINK, "")).is_err());

        let sources = r#"[{"id": "PRD-100", "initialLookback": "87600h",
            "credentials": {"url": "https://x", "username": "U", "secret": "S"}}]"#;
        assert!(BeatConfig::from_json(&with(sources, FILE_SINK, "")).is_ok());
    }

    #[test]
    fn test_invalid_retry_rejected() {
        let extra = r#", "retry": {"maxAttempts": 0}"#;
        assert!(BeatConfig::from_json(&with(SOURCE, FILE_SINK, extra)).is_err());
    }

    #[test]
    fn test_parse_duration() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration(" 2 s"), Ok(Duration::from_secs(2)));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("18446744073709551615h").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beat.json");
        std::fs::write(&path, MINIMAL).unwrap();
        assert_eq!(BeatConfig::from_file(&path).unwrap().sources.len(), 1);

        let missing = BeatConfig::from_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(BeatError::Config(_))));
    }
}
