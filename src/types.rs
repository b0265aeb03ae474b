//! Core types for the audit collection pipeline
//!
//! All serialized types use camelCase JSON for wire compatibility with
//! downstream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Collection progress within a source
///
/// `sequence` counts consumed records from the beginning of the source.
/// `watermark` is the inclusive upper bound of the last fully consumed
/// time window, for sources that are queried by time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    /// Ordinal of the last consumed record
    pub sequence: u64,

    /// Inclusive end of the last consumed time window (UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,
}

impl CursorPosition {
    /// The "beginning of the source" sentinel
    pub fn beginning() -> Self {
        Self::default()
    }

    /// Position at a record ordinal without a time watermark
    pub fn at_sequence(sequence: u64) -> Self {
        Self {
            sequence,
            watermark: None,
        }
    }

    /// Whether this is the beginning sentinel
    pub fn is_beginning(&self) -> bool {
        self.sequence == 0 && self.watermark.is_none()
    }

    /// True when moving from `previous` to `self` decreases no component
    pub fn advances_from(&self, previous: &CursorPosition) -> bool {
        self.sequence >= previous.sequence && self.watermark >= previous.watermark
    }
}

impl fmt::Display for CursorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.watermark {
            Some(w) => write!(f, "seq={} watermark={}", self.sequence, w.to_rfc3339()),
            None => write!(f, "seq={}", self.sequence),
        }
    }
}

/// Durable collection progress for one source system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// Source system identifier (e.g. "PRD-100")
    pub source_id: String,

    /// Last committed position
    pub position: CursorPosition,

    /// When the position was last committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_time: Option<DateTime<Utc>>,
}

impl Cursor {
    /// Cursor for a source that has never been polled
    pub fn beginning(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            position: CursorPosition::beginning(),
            last_commit_time: None,
        }
    }

    /// Cursor advanced to `position`, stamped with the current time
    pub fn advanced_to(&self, position: CursorPosition) -> Self {
        Self {
            source_id: self.source_id.clone(),
            position,
            last_commit_time: Some(Utc::now()),
        }
    }
}

/// A record exactly as returned by the upstream API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAuditRecord {
    /// Ordinal assigned by the source; strictly increasing within a fetch
    pub sequence: u64,

    /// Unparsed record body
    pub payload: serde_json::Value,
}

impl RawAuditRecord {
    pub fn new(sequence: u64, payload: serde_json::Value) -> Self {
        Self { sequence, payload }
    }
}

/// Result of a single fetch: records plus the position reached
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    /// Records strictly newer than the requested position, in emission order
    pub records: Vec<RawAuditRecord>,

    /// Position to commit once every record has been delivered
    pub high_water: CursorPosition,
}

impl RawBatch {
    /// Batch with no records that leaves the position unchanged
    pub fn empty(position: CursorPosition) -> Self {
        Self {
            records: Vec::new(),
            high_water: position,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Canonical audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Deterministic identifier (evt-<32 hex>), stable across redelivery
    pub event_id: String,

    /// Source system the record came from
    pub source_id: String,

    /// Record ordinal within the source
    pub sequence: u64,

    /// When the audited action happened, normalized to UTC
    pub occurred_at: DateTime<Utc>,

    /// SAP user that performed the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    /// Audit message/event code (e.g. "AU1", "AUW")
    pub action_code: String,

    /// Transaction, report, or other object acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_reference: Option<String>,

    /// SAP client (MANDT)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    /// Terminal or peer host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,

    /// Human-readable audit text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Original record body
    pub raw_payload: serde_json::Value,
}

impl AuditEvent {
    /// Derive the event id for a record
    ///
    /// Depends only on the source id and the record's native key,
    /// so redelivering the same record always yields the same id.
    pub fn derive_id(source_id: &str, native_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(native_key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("evt-{}", &digest[..32])
    }
}

/// Normalized events from one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Source the events came from
    pub source_id: String,

    /// Events in source emission order
    pub events: Vec<AuditEvent>,

    /// Position to commit after confirmed delivery
    pub position: CursorPosition,
}

impl Batch {
    pub fn new(
        source_id: impl Into<String>,
        events: Vec<AuditEvent>,
        position: CursorPosition,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            events,
            position,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
