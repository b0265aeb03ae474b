//! # sap-audit-beat
//!
//! Incremental collection of SAP security audit logs into downstream sinks.
//!
//! ## Overview
//!
//! `sap-audit-beat` polls each configured SAP system for audit records
//! newer than a persisted cursor, normalizes them into a canonical event
//! shape, delivers every batch to all configured sinks and only then
//! advances the cursor. Interrupted runs redeliver, never skip.
//!
//! ## Quick Start
//!
//! ```rust
//! use sap_audit_beat::{
//!     AuditSink, CursorPosition, EventNormalizer, MemoryCursorStore, MemorySink, MemorySource,
//!     RetryPolicy, SinkDispatcher, SourcePipeline,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> sap_audit_beat::Result<()> {
//! let source = Arc::new(MemorySource::new());
//! let record = serde_json::json!({
//!     "SLGDATTIM": "2024-01-01T08:00:00",
//!     "SLGUSER": "ALICE",
//!     "SLGMID": "AU1",
//! });
//! source.push("PRD-100", 1, record).await;
//!
//! let sink = Arc::new(MemorySink::new("archive"));
//! let sinks: Vec<Arc<dyn AuditSink>> = vec![sink.clone()];
//! let dispatcher = Arc::new(SinkDispatcher::new(sinks, RetryPolicy::default())?);
//!
//! let pipeline = SourcePipeline::new(
//!     "PRD-100",
//!     source,
//!     EventNormalizer::new(chrono_tz::UTC, Default::default()),
//!     dispatcher,
//!     Arc::new(MemoryCursorStore::default()),
//! );
//!
//! let report = pipeline.run_cycle().await?;
//! assert_eq!(report.committed, Some(CursorPosition::at_sequence(1)));
//! # Ok(())
//! # }
//! ```
//!
//! Building blocks log through `tracing`; call [`init_logging`] to install a
//! subscriber. [`AuditBeat::from_config`] does this from the `logging`
//! section unless a subscriber is already set.
//!
//! ## Components
//!
//! - **CredentialStore**: per-source connection settings
//! - **CursorStore**: durable, monotonic collection progress
//! - **AuditSource**: fetches raw records after a cursor (SAP over HTTP)
//! - **EventNormalizer**: raw records to `AuditEvent` with stable ids
//! - **SinkDispatcher**: fan-out with retries, confirms only on full success
//! - **PollScheduler**: one polling task per source, alerts, graceful shutdown

pub mod beat;
pub mod config;
pub mod credentials;
pub mod cursor;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod types;

// Re-export core types
pub use beat::AuditBeat;
pub use config::{BeatConfig, SinkConfig, SinkEntry, SourceConfig};
pub use credentials::{CredentialStore, Credentials, Secret, TlsSettings};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use dispatch::{DeliveryResult, SinkDispatcher, SinkOutcome};
pub use dlq::{FileQuarantine, MemoryQuarantine, QuarantineHandler, QuarantinedRecord};
pub use error::{BeatError, Result};
pub use logging::{init_logging, install_logging, LoggingConfig};
pub use normalize::{
    AmbiguousTimePolicy, EventNormalizer, FailurePolicy, FieldMapping, NonexistentTimePolicy,
    NormalizerOptions,
};
pub use pipeline::{AlertKind, CycleReport, PipelineState, PipelineStatus, SourcePipeline};
pub use retry::RetryPolicy;
pub use scheduler::{Alert, PollScheduler, SchedulerEvent};
pub use types::{AuditEvent, Batch, Cursor, CursorPosition, RawAuditRecord, RawBatch};

// Re-export sources and sinks for convenience
pub use sink::{AuditSink, FileSink, FileSinkConfig, MemorySink, TcpSink, TcpSinkConfig};
pub use source::{AuditSource, FetchWindow, MemorySource, SapAuditClient, SapSourceSettings};
