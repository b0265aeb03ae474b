//! Event normalizer: raw SAP audit records to canonical events
//!
//! SAP systems expose the Security Audit Log in several shapes (SM20 /
//! RSAU field names, OData wrappers, generic JSON). The normalizer looks
//! fields up case-insensitively from configurable candidate lists and
//! converts timestamps to UTC.
//!
//! ## Timestamps
//!
//! - RFC 3339 with offset, OData `/Date(ms)/`, epoch numbers: exact instants
//! - `YYYYMMDDHHMMSS`, `YYYY-MM-DD HH:MM:SS`, `DD.MM.YYYY HH:MM:SS`, or split
//!   date + time fields: local time in the source's configured zone
//!
//! Local times that fall into a DST overlap or gap are resolved by
//! [`AmbiguousTimePolicy`] and [`NonexistentTimePolicy`].
//!
//! ## Event ids
//!
//! With a configured `sequence` field the id is derived from that field.
//! Otherwise it is derived from the SHA-256 of the compact payload JSON
//! plus the occurrence number among identical payloads in the same fetch,
//! so ids survive re-fetches whose record positions shift.

use crate::error::{BeatError, Result};
use crate::types::{AuditEvent, RawAuditRecord};
use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Resolution of a local time that occurs twice (DST fall-back)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguousTimePolicy {
    /// Use the earlier instant (daylight time)
    #[default]
    Earliest,
    /// Use the later instant (standard time)
    Latest,
    /// Fail normalization
    Reject,
}

/// Resolution of a local time skipped by a DST gap (spring-forward)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonexistentTimePolicy {
    /// Fail normalization
    #[default]
    Reject,
    /// Interpret with the offset in effect before the gap
    ShiftForward,
}

/// What to do with a record that cannot be normalized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the whole batch (re-fetched once, then escalated)
    #[default]
    FailBatch,
    /// Hand the record to the quarantine store and continue
    Quarantine,
}

/// Candidate field names per canonical attribute
///
/// Matching is case-insensitive; the first present, non-null field wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldMapping {
    pub timestamp: Vec<String>,
    pub date: Vec<String>,
    pub time: Vec<String>,
    pub actor: Vec<String>,
    pub action: Vec<String>,
    pub object: Vec<String>,
    pub client: Vec<String>,
    pub terminal: Vec<String>,
    pub message: Vec<String>,
    /// Source-native sequence field; when unset the payload content is hashed
    pub sequence: Option<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            timestamp: names(&["timestamp", "occurredAt", "dateTime", "SLGDATTIM", "eventTime"]),
            date: names(&["date", "SLGDATE", "SAL_DATE", "datum"]),
            time: names(&["time", "SLGTIME", "SAL_TIME", "zeit"]),
            actor: names(&["user", "userName", "SLGUSER", "UNAME", "BNAME"]),
            action: names(&["messageId", "msgId", "SLGMID", "auditEvent", "action", "event"]),
            object: names(&["transaction", "tcode", "SLGTC", "report", "SLGREPNA", "program", "object"]),
            client: names(&["client", "MANDT", "SLGMAND", "SAL_CLIENT"]),
            terminal: names(&["terminal", "SLGLTRM", "peer", "host"]),
            message: names(&["message", "messageText", "text", "MSG"]),
            sequence: None,
        }
    }
}

/// Normalizer settings that come from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizerOptions {
    pub fields: FieldMapping,
    pub ambiguous: AmbiguousTimePolicy,
    pub nonexistent: NonexistentTimePolicy,
    pub on_failure: FailurePolicy,
}

/// A parsed timestamp before zone resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stamp {
    Exact(DateTime<Utc>),
    Local(NaiveDateTime),
}

/// Converts raw records into canonical audit events
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    timezone: Tz,
    options: NormalizerOptions,
}

impl EventNormalizer {
    /// Create a normalizer for a source whose local clock runs in `timezone`
    pub fn new(timezone: Tz, options: NormalizerOptions) -> Self {
        Self { timezone, options }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.options.on_failure
    }

    /// Normalize one record, as the first of its payload in the fetch
    pub fn normalize(&self, source_id: &str, record: &RawAuditRecord) -> Result<AuditEvent> {
        self.normalize_occurrence(source_id, record, 0)
    }

    /// Normalize the records of one fetch in order
    ///
    /// Byte-identical payloads are numbered by occurrence so each keeps a
    /// distinct id. Identical payloads carry the same timestamp and so
    /// always land in the same fetch window, which keeps the numbering
    /// stable when a window is fetched again.
    pub fn normalize_batch(
        &self,
        source_id: &str,
        records: &[RawAuditRecord],
    ) -> Vec<Result<AuditEvent>> {
        let mut seen: HashMap<String, u32> = HashMap::new();
        records
            .iter()
            .map(|record| {
                let occurrence = if self.options.fields.sequence.is_some() {
                    0
                } else {
                    let count = seen.entry(payload_digest(&record.payload)).or_insert(0);
                    let occurrence = *count;
                    *count += 1;
                    occurrence
                };
                self.normalize_occurrence(source_id, record, occurrence)
            })
            .collect()
    }

    fn normalize_occurrence(
        &self,
        source_id: &str,
        record: &RawAuditRecord,
        occurrence: u32,
    ) -> Result<AuditEvent> {
        let fail = |reason: String| BeatError::Normalization {
            source_id: source_id.to_string(),
            sequence: record.sequence,
            reason,
        };
        let fields = &self.options.fields;

        let obj = record
            .payload
            .as_object()
            .ok_or_else(|| fail("record is not a JSON object".to_string()))?;

        let occurred_at = self.occurred_at(obj).map_err(fail)?;

        let action_code = lookup_text(obj, &fields.action)
            .ok_or_else(|| fail("missing action code".to_string()))?;

        let native_key = match &fields.sequence {
            Some(field) => {
                let value = lookup_text(obj, std::slice::from_ref(field))
                    .ok_or_else(|| fail(format!("missing sequence field '{}'", field)))?;
                format!("key:{}", value)
            }
            None => format!("raw:{}#{}", payload_digest(&record.payload), occurrence),
        };

        Ok(AuditEvent {
            event_id: AuditEvent::derive_id(source_id, &native_key),
            source_id: source_id.to_string(),
            sequence: record.sequence,
            occurred_at,
            actor: lookup_text(obj, &fields.actor),
            action_code,
            object_reference: lookup_text(obj, &fields.object),
            client: lookup_text(obj, &fields.client),
            terminal: lookup_text(obj, &fields.terminal),
            message: lookup_text(obj, &fields.message),
            raw_payload: record.payload.clone(),
        })
    }

    /// Resolve a local wall-clock time in the source zone to UTC
    pub fn resolve_local(&self, naive: NaiveDateTime) -> std::result::Result<DateTime<Utc>, String> {
        match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, latest) => match self.options.ambiguous {
                AmbiguousTimePolicy::Earliest => Ok(earliest.with_timezone(&Utc)),
                AmbiguousTimePolicy::Latest => Ok(latest.with_timezone(&Utc)),
                AmbiguousTimePolicy::Reject => Err(format!(
                    "local time {} is ambiguous in {}",
                    naive, self.timezone
                )),
            },
            LocalResult::None => match self.options.nonexistent {
                NonexistentTimePolicy::Reject => Err(format!(
                    "local time {} does not exist in {}",
                    naive, self.timezone
                )),
                NonexistentTimePolicy::ShiftForward => self.shift_over_gap(naive),
            },
        }
    }

    fn shift_over_gap(&self, naive: NaiveDateTime) -> std::result::Result<DateTime<Utc>, String> {
        let earlier = naive - chrono::Duration::hours(3);
        let before = self
            .timezone
            .from_local_datetime(&earlier)
            .earliest()
            .ok_or_else(|| format!("cannot find offset before gap at {}", naive))?;
        let offset = before.offset().fix();
        offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| format!("cannot shift local time {}", naive))
    }

    fn occurred_at(&self, obj: &Map<String, Value>) -> std::result::Result<DateTime<Utc>, String> {
        let fields = &self.options.fields;

        if let Some(value) = lookup(obj, &fields.timestamp) {
            return match parse_stamp(value) {
                Some(Stamp::Exact(dt)) => Ok(dt),
                Some(Stamp::Local(naive)) => self.resolve_local(naive),
                None => Err(format!("unrecognized timestamp {}", value)),
            };
        }

        match (lookup(obj, &fields.date), lookup(obj, &fields.time)) {
            (Some(d), Some(t)) => {
                let date = parse_date(d).ok_or_else(|| format!("unrecognized date {}", d))?;
                let time = parse_time(t).ok_or_else(|| format!("unrecognized time {}", t))?;
                self.resolve_local(date.and_time(time))
            }
            (Some(_), None) => Err("date field without time field".to_string()),
            _ => Err("missing timestamp".to_string()),
        }
    }
}

/// Hex SHA-256 of the compact JSON rendering (object keys sorted)
fn payload_digest(payload: &Value) -> String {
    hex::encode(Sha256::digest(payload.to_string().as_bytes()))
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[String]) -> Option<&'a Value> {
    keys.iter().find_map(|key| {
        obj.get(key)
            .or_else(|| {
                obj.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .filter(|v| !v.is_null())
    })
}

fn lookup_text(obj: &Map<String, Value>, keys: &[String]) -> Option<String> {
    lookup(obj, keys).and_then(text)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

const LOCAL_FORMATS: &[&str] = &[
    "%Y%m%d%H%M%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d.%m.%Y %H:%M:%S",
];

fn parse_stamp(value: &Value) -> Option<Stamp> {
    match value {
        Value::Number(n) => n.as_i64().and_then(epoch).map(Stamp::Exact),
        Value::String(s) => {
            let s = s.trim();
            if let Some(dt) = parse_odata_date(s) {
                return Some(Stamp::Exact(dt));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(Stamp::Exact(dt.with_timezone(&Utc)));
            }
            if let Some(naive) = LOCAL_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            {
                return Some(Stamp::Local(naive));
            }
            if (s.len() == 10 || s.len() == 13) && s.bytes().all(|b| b.is_ascii_digit()) {
                return s.parse::<i64>().ok().and_then(epoch).map(Stamp::Exact);
            }
            None
        }
        _ => None,
    }
}

/// Epoch seconds or milliseconds, told apart by magnitude
fn epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// `/Date(1714550400000)/` or `/Date(1714550400000+0400)/`
///
/// The millisecond value is UTC; the optional offset is informational.
fn parse_odata_date(s: &str) -> Option<DateTime<Utc>> {
    let inner = s.strip_prefix("/Date(")?.strip_suffix(")/")?;
    let end = inner
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    let millis = inner[..end].parse::<i64>().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    let s = text(value)?;
    ["%Y%m%d", "%Y-%m-%d", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&s, fmt).ok())
}

fn parse_time(value: &Value) -> Option<NaiveTime> {
    let mut s = text(value)?;
    // Numeric HHMMSS loses its leading zero in JSON (083015 -> 83015)
    if s.len() < 6 && s.bytes().all(|b| b.is_ascii_digit()) {
        s = format!("{:0>6}", s);
    }
    ["%H%M%S", "%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&s, fmt).ok())
}
