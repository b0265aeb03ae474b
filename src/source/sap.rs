//! SAP Security Audit Log HTTP client
//!
//! Queries the audit endpoint by time window. Window bounds are rendered
//! in the SAP system's local time zone as `startdate`/`starttime` and
//! `enddate`/`endtime`; the inclusive window end becomes the cursor
//! watermark once the batch is delivered.
//!
//! The next window starts at the watermark second again. Entries written
//! into that second after the previous query are still collected; entries
//! already delivered come back with the same content-derived event ids.

use super::AuditSource;
use crate::credentials::Credentials;
use crate::error::{BeatError, Result};
use crate::retry::{RetryPolicy, RetryableError};
use crate::types::{CursorPosition, RawAuditRecord, RawBatch};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use chrono_tz::Tz;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Per-source settings for the SAP client
#[derive(Debug, Clone, PartialEq)]
pub struct SapSourceSettings {
    /// Time zone of the SAP system clock
    pub timezone: Tz,
    /// How far back the first poll reaches
    pub initial_lookback: Duration,
    /// Lag behind "now" so late-written entries are not missed
    pub settle_delay: Duration,
    /// Largest window a single fetch may cover
    pub max_window: Duration,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl Default for SapSourceSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Dubai,
            initial_lookback: Duration::from_secs(24 * 3600),
            settle_delay: Duration::ZERO,
            max_window: Duration::from_secs(24 * 3600),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Inclusive UTC time range covered by one fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    /// Query parameters in the SAP system's local time
    pub fn query(&self, timezone: Tz) -> Vec<(&'static str, String)> {
        let start = self.start.with_timezone(&timezone);
        let end = self.end.with_timezone(&timezone);
        vec![
            ("startdate", start.format("%d.%m.%Y").to_string()),
            ("starttime", start.format("%H:%M:%S").to_string()),
            ("enddate", end.format("%d.%m.%Y").to_string()),
            ("endtime", end.format("%H:%M:%S").to_string()),
        ]
    }
}

fn chrono_duration(value: Duration, name: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(value)
        .map_err(|e| BeatError::Config(format!("{} out of range: {}", name, e)))
}

/// HTTP client for one SAP system/client
pub struct SapAuditClient {
    source_id: String,
    credentials: Arc<Credentials>,
    timezone: Tz,
    initial_lookback: chrono::Duration,
    settle_delay: chrono::Duration,
    max_window: chrono::Duration,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl SapAuditClient {
    /// Build a client; fails on invalid proxy, CA bundle, or durations
    pub fn new(
        source_id: impl Into<String>,
        credentials: Arc<Credentials>,
        settings: SapSourceSettings,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let source_id = source_id.into();

        let mut builder = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(credentials.tls.accept_invalid_certs);

        if let Some(proxy) = &credentials.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                BeatError::Config(format!("Source '{}': invalid proxy: {}", source_id, e))
            })?;
            builder = builder.proxy(proxy);
        }

        if let Some(path) = &credentials.tls.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                BeatError::Config(format!(
                    "Source '{}': cannot read CA bundle {}: {}",
                    source_id,
                    path.display(),
                    e
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BeatError::Config(format!("Source '{}': invalid CA bundle: {}", source_id, e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder.build().map_err(|e| {
            BeatError::Config(format!("Source '{}': HTTP client: {}", source_id, e))
        })?;

        Ok(Self {
            initial_lookback: chrono_duration(settings.initial_lookback, "initialLookback")?,
            settle_delay: chrono_duration(settings.settle_delay, "settleDelay")?,
            max_window: chrono_duration(settings.max_window, "maxWindow")?,
            timezone: settings.timezone,
            source_id,
            credentials,
            retry,
            http,
        })
    }

    /// The window to query when resuming from `since` at wall-clock `now`
    ///
    /// `None` when there is nothing to query yet (the settle delay has not
    /// elapsed since the last watermark). Fails if the configured
    /// durations reach outside the representable date range.
    pub fn window_for(
        &self,
        since: &CursorPosition,
        now: DateTime<Utc>,
    ) -> Result<Option<FetchWindow>> {
        let out_of_range = |name: &str| {
            BeatError::Config(format!(
                "Source '{}': {} reaches outside the supported date range",
                self.source_id, name
            ))
        };

        let start = match since.watermark {
            Some(watermark) => watermark.trunc_subsecs(0),
            None => now
                .checked_sub_signed(self.initial_lookback)
                .ok_or_else(|| out_of_range("initialLookback"))?
                .trunc_subsecs(0),
        };
        let latest = now
            .checked_sub_signed(self.settle_delay)
            .ok_or_else(|| out_of_range("settleDelay"))?
            .trunc_subsecs(0);
        let end = match start.checked_add_signed(self.max_window) {
            Some(cap) => latest.min(cap),
            None => latest,
        };

        Ok((end >= start).then_some(FetchWindow { start, end }))
    }

    /// Fetch as of an explicit wall-clock time
    pub async fn fetch_at(
        &self,
        source_id: &str,
        since: &CursorPosition,
        now: DateTime<Utc>,
    ) -> Result<RawBatch> {
        let Some(window) = self.window_for(since, now)? else {
            tracing::debug!(source_id, position = %since, "Fetch window not open yet");
            return Ok(RawBatch::empty(since.clone()));
        };

        let operation = format!("fetch {}", source_id);
        let payloads = self
            .retry
            .retry(&operation, |_attempt| self.fetch_once(source_id, &window))
            .await?;

        let records: Vec<RawAuditRecord> = payloads
            .into_iter()
            .zip(since.sequence + 1..)
            .map(|(payload, sequence)| RawAuditRecord::new(sequence, payload))
            .collect();

        let high_water = CursorPosition {
            sequence: since.sequence + records.len() as u64,
            watermark: Some(window.end),
        };

        tracing::debug!(
            source_id,
            start = %window.start,
            end = %window.end,
            records = records.len(),
            "Fetched audit window"
        );

        Ok(RawBatch {
            records,
            high_water,
        })
    }

    async fn fetch_once(
        &self,
        source_id: &str,
        window: &FetchWindow,
    ) -> std::result::Result<Vec<Value>, RetryableError> {
        let mut query = window.query(self.timezone);
        if let Some(client) = &self.credentials.client {
            query.push(("sap-client", client.clone()));
        }

        let response = self
            .http
            .get(&self.credentials.url)
            .basic_auth(&self.credentials.username, Some(self.credentials.secret.expose()))
            .header(ACCEPT, "application/json")
            .query(&query)
            .send()
            .await
            .map_err(|e| self.request_error(source_id, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BeatError::Auth {
                source_id: source_id.to_string(),
                reason: format!("HTTP {}", status),
            }
            .into());
        }

        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            let retry_after = RetryPolicy::parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(RetryableError::with_retry_after(
                BeatError::TransientNetwork {
                    source_id: source_id.to_string(),
                    reason: format!("HTTP {}", status),
                },
                retry_after,
            ));
        }

        if !status.is_success() {
            return Err(BeatError::MalformedResponse {
                source_id: source_id.to_string(),
                reason: format!("unexpected HTTP {}", status),
            }
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.request_error(source_id, e))?;

        parse_records(&body).map_err(|reason| {
            BeatError::MalformedResponse {
                source_id: source_id.to_string(),
                reason,
            }
            .into()
        })
    }

    fn request_error(&self, source_id: &str, error: reqwest::Error) -> RetryableError {
        if error.is_builder() {
            return BeatError::Config(format!("Source '{}': {}", source_id, error)).into();
        }
        let reason = if error.is_timeout() {
            format!("request timed out: {}", error)
        } else {
            error.to_string()
        };
        BeatError::TransientNetwork {
            source_id: source_id.to_string(),
            reason,
        }
        .into()
    }
}

/// Extract the record list from a response body
fn parse_records(body: &[u8]) -> std::result::Result<Vec<Value>, String> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {}", e))?;

    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut obj) => {
            let wrapped = obj
                .get_mut("d")
                .and_then(|d| d.get_mut("results"))
                .map(Value::take)
                .or_else(|| obj.remove("results"))
                .or_else(|| obj.remove("value"));
            match wrapped {
                Some(Value::Array(records)) => Ok(records),
                _ => Err("expected a JSON array of audit records".to_string()),
            }
        }
        _ => Err("expected a JSON array of audit records".to_string()),
    }
}

#[async_trait]
impl AuditSource for SapAuditClient {
    async fn fetch(&self, source_id: &str, since: &CursorPosition) -> Result<RawBatch> {
        self.fetch_at(source_id, since, Utc::now()).await
    }

    fn name(&self) -> &str {
        "sap"
    }
}

impl std::fmt::Debug for SapAuditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SapAuditClient")
            .field("source_id", &self.source_id)
            .field("url", &self.credentials.url)
            .field("timezone", &self.timezone)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Secret, TlsSettings};
    use chrono::TimeZone;

    fn client(settings: SapSourceSettings) -> SapAuditClient {
        let credentials = Credentials {
            url: "http://127.0.0.1:1/sap/audit".to_string(),
            client: Some("100".to_string()),
            username: "user".to_string(),
            secret: Secret::new("secret"),
            proxy: None,
            tls: TlsSettings::default(),
        };
        SapAuditClient::new("PRD-100", Arc::new(credentials), settings, RetryPolicy::disabled())
            .unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_first_window_uses_lookback() {
        let c = client(SapSourceSettings::default());
        let now = at(12, 0, 0) + chrono::Duration::milliseconds(750);
        let window = c.window_for(&CursorPosition::beginning(), now).unwrap().unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 4, 30, 12, 0, 0).unwrap());
        assert_eq!(window.end, at(12, 0, 0));
    }

    #[test]
    fn test_window_resumes_after_watermark() {
        let c = client(SapSourceSettings::default());
        let since = CursorPosition {
            sequence: 100,
            watermark: Some(at(11, 59, 0)),
        };
        let window = c.window_for(&since, at(12, 0, 0)).unwrap().unwrap();
        assert_eq!(window.start, at(11, 59, 0));
        assert_eq!(window.end, at(12, 0, 0));
    }

    #[test]
    fn test_boundary_second_is_queried_again() {
        let c = client(SapSourceSettings::default());
        let first = c
            .window_for(
                &CursorPosition::beginning(),
                at(12, 0, 0) + chrono::Duration::milliseconds(700),
            )
            .unwrap()
            .unwrap();
        assert_eq!(first.end, at(12, 0, 0));

        // Entry stamped 12:00:00.900, written after the first query
        let late = at(12, 0, 0) + chrono::Duration::milliseconds(900);
        let since = CursorPosition {
            sequence: 0,
            watermark: Some(first.end),
        };
        let next = c.window_for(&since, at(12, 1, 0)).unwrap().unwrap();
        assert!(next.start.trunc_subsecs(0) <= late.trunc_subsecs(0));
        assert!(late.trunc_subsecs(0) <= next.end);
    }

    #[test]
    fn test_oversized_durations_fail_instead_of_panicking() {
        let eons = Duration::from_secs(1_000_000 * 365 * 86_400);
        let c = client(SapSourceSettings {
            initial_lookback: eons,
            max_window: eons,
            ..Default::default()
        });
        assert!(matches!(
            c.window_for(&CursorPosition::beginning(), at(12, 0, 0)),
            Err(BeatError::Config(_))
        ));

        // An unreachable window cap falls back to "now"
        let since = CursorPosition {
            sequence: 1,
            watermark: Some(at(11, 0, 0)),
        };
        let window = c.window_for(&since, at(12, 0, 0)).unwrap().unwrap();
        assert_eq!(window.end, at(12, 0, 0));
    }

    #[test]
    fn test_window_capped_at_max_window() {
        let c = client(SapSourceSettings {
            max_window: Duration::from_secs(3600),
            ..Default::default()
        });
        let since = CursorPosition {
            sequence: 5,
            watermark: Some(at(1, 0, 0)),
        };
        let window = c.window_for(&since, at(12, 0, 0)).unwrap().unwrap();
        assert_eq!(window.start, at(1, 0, 0));
        assert_eq!(window.end, at(2, 0, 0));
    }

    #[test]
    fn test_window_closed_within_settle_delay() {
        let c = client(SapSourceSettings {
            settle_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let since = CursorPosition {
            sequence: 5,
            watermark: Some(at(11, 59, 50)),
        };
        assert!(c.window_for(&since, at(12, 0, 0)).unwrap().is_none());
        assert!(c.window_for(&since, at(12, 0, 21)).unwrap().is_some());
    }

    #[test]
    fn test_query_rendered_in_local_time() {
        let window = FetchWindow {
            start: Utc.with_ymd_and_hms(2024, 4, 30, 21, 0, 0).unwrap(),
            end: at(8, 30, 15),
        };
        let query = window.query(chrono_tz::Asia::Dubai);
        assert_eq!(
            query,
            vec![
                ("startdate", "01.05.2024".to_string()),
                ("starttime", "01:00:00".to_string()),
                ("enddate", "01.05.2024".to_string()),
                ("endtime", "12:30:15".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_records_shapes() {
        assert!(parse_records(b"").unwrap().is_empty());
        assert!(parse_records(b"  \n").unwrap().is_empty());
        assert_eq!(parse_records(br#"[{"a":1},{"a":2}]"#).unwrap().len(), 2);
        assert_eq!(parse_records(br#"{"d":{"results":[{"a":1}]}}"#).unwrap().len(), 1);
        assert_eq!(parse_records(br#"{"results":[]}"#).unwrap().len(), 0);
        assert_eq!(parse_records(br#"{"value":[{"a":1}]}"#).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_records_rejects_other_shapes() {
        assert!(parse_records(b"<html>").is_err());
        assert!(parse_records(br#"{"error":"x"}"#).is_err());
        assert!(parse_records(br#"{"results":{"a":1}}"#).is_err());
        assert!(parse_records(b"42").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let c = client(SapSourceSettings::default());
        let debug = format!("{:?}", c);
        assert!(debug.contains("PRD-100"));
        assert!(!debug.contains("secret"));
    }
}
