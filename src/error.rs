//! Error types for sap-audit-beat

use thiserror::Error;

/// Errors that can occur while collecting and forwarding audit records
#[derive(Debug, Error)]
pub enum BeatError {
    /// Connection reset, timeout, or a retryable HTTP status from the upstream API
    #[error("Transient network error for source '{source_id}': {reason}")]
    TransientNetwork { source_id: String, reason: String },

    /// Expired or invalid credentials; the source stays suspended until resumed
    #[error("Authentication failed for source '{source_id}': {reason}")]
    Auth { source_id: String, reason: String },

    /// Upstream response that cannot be interpreted as a batch of records
    #[error("Malformed response from source '{source_id}': {reason}")]
    MalformedResponse { source_id: String, reason: String },

    /// A raw record that cannot be mapped onto the canonical event schema
    #[error("Failed to normalize record {sequence} from source '{source_id}': {reason}")]
    Normalization {
        source_id: String,
        sequence: u64,
        reason: String,
    },

    /// Cursor or quarantine persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Attempt to move a cursor backwards
    #[error("Cursor regression for source '{source_id}': {current} -> {attempted}")]
    CursorRegression {
        source_id: String,
        current: String,
        attempted: String,
    },

    /// A single delivery attempt to a sink failed
    #[error("Sink '{sink}' failed: {reason}")]
    Sink {
        sink: String,
        reason: String,
        transient: bool,
    },

    /// A sink kept failing after the retry budget was spent
    #[error("Sink '{sink}' unavailable after {attempts} attempts: {reason}")]
    PersistentSinkFailure {
        sink: String,
        attempts: u32,
        reason: String,
    },

    /// A transient failure persisted past the retry budget
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    /// Source is suspended after an authentication failure
    #[error("Source '{0}' is suspended")]
    SourceSuspended(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Unknown source, sink, or credential entry
    #[error("Not found: {0}")]
    NotFound(String),
}

impl BeatError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BeatError::TransientNetwork { .. } | BeatError::Timeout(_) => true,
            BeatError::Sink { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Batch-level data errors: the batch is re-fetched once, then escalated
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            BeatError::MalformedResponse { .. } | BeatError::Normalization { .. }
        )
    }

    /// Build a sink error
    pub fn sink(sink: impl Into<String>, reason: impl Into<String>, transient: bool) -> Self {
        BeatError::Sink {
            sink: sink.into(),
            reason: reason.into(),
            transient,
        }
    }
}

/// Result type alias for beat operations
pub type Result<T> = std::result::Result<T, BeatError>;
