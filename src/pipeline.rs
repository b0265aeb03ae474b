//! Per-source collection pipeline
//!
//! One poll cycle runs the stages strictly in order:
//!
//! ```text
//! Idle -> Polling -> Normalizing -> Delivering -> Committing -> Idle
//! ```
//!
//! Any failure returns the pipeline to `Idle` without committing, so the
//! next cycle re-reads from the last committed cursor. An authentication
//! failure moves it to `Suspended` until [`SourcePipeline::resume`] is
//! called. A malformed response or unnormalizable batch is re-fetched
//! once before the error is escalated.

use crate::cursor::CursorStore;
use crate::dispatch::SinkDispatcher;
use crate::dlq::{QuarantineHandler, QuarantinedRecord};
use crate::error::{BeatError, Result};
use crate::normalize::{EventNormalizer, FailurePolicy};
use crate::source::AuditSource;
use crate::types::{AuditEvent, Batch, CursorPosition, RawAuditRecord, RawBatch};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Polling,
    Normalizing,
    Delivering,
    Committing,
    /// Waiting for operator action after an authentication failure
    Suspended,
    Stopped,
}

/// Category of a failure that needs operator attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Credentials rejected; source suspended
    AuthFailure,
    /// Upstream still failing after the retry budget
    SourceUnavailable,
    /// Malformed or unnormalizable data after the re-fetch
    DataError,
    /// A sink did not acknowledge after its retry budget
    SinkOutage,
    /// Cursor or quarantine persistence failed
    Storage,
    /// Wiring problem such as a missing credential entry
    Misconfigured,
}

impl AlertKind {
    /// Alert category for a failed cycle, `None` for transient failures
    pub fn classify(error: &BeatError) -> Option<Self> {
        match error {
            BeatError::Auth { .. } | BeatError::SourceSuspended(_) => Some(Self::AuthFailure),
            BeatError::RetriesExhausted { .. } => Some(Self::SourceUnavailable),
            BeatError::MalformedResponse { .. } | BeatError::Normalization { .. } => {
                Some(Self::DataError)
            }
            BeatError::PersistentSinkFailure { .. } | BeatError::Sink { .. } => {
                Some(Self::SinkOutage)
            }
            BeatError::Storage(_)
            | BeatError::CursorRegression { .. }
            | BeatError::Io(_)
            | BeatError::Serialization(_) => Some(Self::Storage),
            BeatError::TransientNetwork { .. } | BeatError::Timeout(_) => None,
            BeatError::Config(_) | BeatError::NotFound(_) => Some(Self::Misconfigured),
        }
    }
}

/// Observable pipeline status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub source_id: String,
    pub state: PipelineState,
    /// Last loaded or committed cursor position
    pub cursor: Option<CursorPosition>,
    /// Failed cycles since the last success
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    /// Records quarantined over the pipeline's lifetime
    pub quarantined: u64,
}

/// Summary of a successful cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub source_id: String,
    /// Raw records returned by the source
    pub fetched: usize,
    /// Events acknowledged by every sink
    pub delivered: usize,
    /// Records sent to quarantine
    pub quarantined: usize,
    /// New cursor position, `None` when the position did not move
    pub committed: Option<CursorPosition>,
    /// The batch had to be fetched a second time
    pub refetched: bool,
}

/// A failed cycle with the context needed for alerting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleFailure {
    pub kind: Option<AlertKind>,
    pub last_cursor: Option<CursorPosition>,
    pub failure_count: u32,
}

struct Prepared {
    raw: RawBatch,
    events: Vec<AuditEvent>,
    rejected: Vec<(RawAuditRecord, String)>,
    refetched: bool,
}

/// Drives fetch, normalize, deliver, and commit for one source
pub struct SourcePipeline {
    source_id: String,
    source: Arc<dyn AuditSource>,
    normalizer: EventNormalizer,
    dispatcher: Arc<SinkDispatcher>,
    cursors: Arc<dyn CursorStore>,
    quarantine: Option<Arc<dyn QuarantineHandler>>,
    status: RwLock<PipelineStatus>,
}

impl SourcePipeline {
    pub fn new(
        source_id: impl Into<String>,
        source: Arc<dyn AuditSource>,
        normalizer: EventNormalizer,
        dispatcher: Arc<SinkDispatcher>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let source_id = source_id.into();
        let status = PipelineStatus {
            source_id: source_id.clone(),
            state: PipelineState::Idle,
            cursor: None,
            consecutive_failures: 0,
            last_error: None,
            last_success: None,
            quarantined: 0,
        };
        Self {
            source_id,
            source,
            normalizer,
            dispatcher,
            cursors,
            quarantine: None,
            status: RwLock::new(status),
        }
    }

    /// Route unnormalizable records to `quarantine` (with the
    /// `quarantine` failure policy)
    pub fn with_quarantine(mut self, quarantine: Arc<dyn QuarantineHandler>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn status(&self) -> PipelineStatus {
        self.status.read().await.clone()
    }

    pub async fn state(&self) -> PipelineState {
        self.status.read().await.state
    }

    async fn set_state(&self, state: PipelineState) {
        self.status.write().await.state = state;
    }

    /// Leave `Suspended` after the operator fixed the credentials
    ///
    /// Returns `true` if the pipeline was suspended.
    pub async fn resume(&self) -> bool {
        let mut status = self.status.write().await;
        if status.state != PipelineState::Suspended {
            return false;
        }
        status.state = PipelineState::Idle;
        tracing::info!(source_id = %self.source_id, "Source resumed");
        true
    }

    /// Mark the pipeline as stopped; no further cycles run
    pub async fn stop(&self) {
        self.set_state(PipelineState::Stopped).await;
    }

    /// Run one poll cycle
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        match self.state().await {
            PipelineState::Suspended => {
                return Err(BeatError::SourceSuspended(self.source_id.clone()));
            }
            PipelineState::Stopped => {
                return Err(BeatError::Config(format!(
                    "Pipeline '{}' is stopped",
                    self.source_id
                )));
            }
            _ => {}
        }

        let result = self.cycle().await;

        let mut status = self.status.write().await;
        match &result {
            Ok(report) => {
                status.state = PipelineState::Idle;
                status.consecutive_failures = 0;
                status.last_error = None;
                status.last_success = Some(Utc::now());
                status.quarantined += report.quarantined as u64;
                if let Some(position) = &report.committed {
                    status.cursor = Some(position.clone());
                }
                tracing::info!(
                    source_id = %self.source_id,
                    fetched = report.fetched,
                    delivered = report.delivered,
                    quarantined = report.quarantined,
                    cursor = ?status.cursor.as_ref().map(|c| c.to_string()),
                    "Cycle complete"
                );
            }
            Err(e) => {
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
                status.state = if matches!(e, BeatError::Auth { .. }) {
                    PipelineState::Suspended
                } else {
                    PipelineState::Idle
                };

                let last_cursor = status.cursor.as_ref().map(|c| c.to_string());
                match AlertKind::classify(e) {
                    Some(kind) => tracing::error!(
                        source_id = %self.source_id,
                        kind = ?kind,
                        last_cursor = ?last_cursor,
                        failure_count = status.consecutive_failures,
                        error = %e,
                        "Cycle failed"
                    ),
                    None => tracing::warn!(
                        source_id = %self.source_id,
                        last_cursor = ?last_cursor,
                        failure_count = status.consecutive_failures,
                        error = %e,
                        "Cycle failed, will retry next tick"
                    ),
                }
            }
        }
        result
    }

    /// Failure context for the most recent cycle
    pub async fn failure_context(&self, error: &BeatError) -> CycleFailure {
        let status = self.status.read().await;
        CycleFailure {
            kind: AlertKind::classify(error),
            last_cursor: status.cursor.clone(),
            failure_count: status.consecutive_failures,
        }
    }

    async fn cycle(&self) -> Result<CycleReport> {
        self.set_state(PipelineState::Polling).await;
        let cursor = self.cursors.load(&self.source_id)?;
        self.status.write().await.cursor = Some(cursor.position.clone());

        let prepared = match self.prepare(&cursor.position, false).await {
            Err(e) if e.is_data_error() => {
                tracing::warn!(
                    source_id = %self.source_id,
                    error = %e,
                    "Rejected batch, fetching again"
                );
                self.set_state(PipelineState::Polling).await;
                self.prepare(&cursor.position, true).await?
            }
            other => other?,
        };

        let quarantined = prepared.rejected.len();
        let fetched = prepared.raw.len();
        let batch = Batch::new(
            self.source_id.clone(),
            prepared.events,
            prepared.raw.high_water,
        );

        self.set_state(PipelineState::Delivering).await;
        let delivery = self.dispatcher.deliver(&batch).await;
        if let Some(error) = delivery.into_error() {
            return Err(error);
        }

        // Rejected records are quarantined only once the batch is confirmed
        if let Some(quarantine) = &self.quarantine {
            for (record, reason) in prepared.rejected {
                quarantine
                    .handle(QuarantinedRecord::new(&self.source_id, record, reason))
                    .await?;
            }
        }

        self.set_state(PipelineState::Committing).await;
        let committed = if batch.position != cursor.position {
            let next = cursor.advanced_to(batch.position.clone());
            self.cursors.commit(&self.source_id, &next)?;
            tracing::debug!(
                source_id = %self.source_id,
                from = %cursor.position,
                to = %next.position,
                "Cursor advanced"
            );
            Some(next.position)
        } else {
            None
        };

        Ok(CycleReport {
            source_id: self.source_id.clone(),
            fetched,
            delivered: batch.len(),
            quarantined,
            committed,
            refetched: prepared.refetched,
        })
    }

    /// Fetch, validate, and normalize one batch
    async fn prepare(&self, since: &CursorPosition, refetched: bool) -> Result<Prepared> {
        let raw = self.source.fetch(&self.source_id, since).await?;
        self.check_order(since, &raw)?;

        self.set_state(PipelineState::Normalizing).await;
        let mut events = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();

        let normalized = self.normalizer.normalize_batch(&self.source_id, &raw.records);
        for (record, result) in raw.records.iter().zip(normalized) {
            match result {
                Ok(event) => events.push(event),
                Err(e) => {
                    let quarantine = self.normalizer.failure_policy() == FailurePolicy::Quarantine
                        && self.quarantine.is_some();
                    if !quarantine {
                        return Err(e);
                    }
                    rejected.push((record.clone(), e.to_string()));
                }
            }
        }

        Ok(Prepared {
            raw,
            events,
            rejected,
            refetched,
        })
    }

    /// Records must be strictly newer than `since` and strictly increasing
    fn check_order(&self, since: &CursorPosition, raw: &RawBatch) -> Result<()> {
        let malformed = |reason: String| BeatError::MalformedResponse {
            source_id: self.source_id.clone(),
            reason,
        };

        let mut previous = since.sequence;
        for record in &raw.records {
            if record.sequence <= previous {
                return Err(malformed(format!(
                    "record sequence {} does not follow {}",
                    record.sequence, previous
                )));
            }
            previous = record.sequence;
        }

        if !raw.high_water.advances_from(since) || raw.high_water.sequence < previous {
            return Err(malformed(format!(
                "high-water position {} is behind {}",
                raw.high_water, since
            )));
        }
        Ok(())
    }
}
