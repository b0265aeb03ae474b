//! Poll scheduler
//!
//! Runs one task per source. Each task ticks on its own interval and runs
//! a full pipeline cycle per tick; ticks that arrive while a cycle is in
//! progress are skipped. A manual trigger starts a cycle right away, or
//! right after the current one if a cycle is running (at most one
//! trigger is kept pending).
//!
//! Shutdown lets every task finish its current cycle within a grace
//! period. Tasks still running after that are aborted; an aborted cycle
//! never commits its cursor.

use crate::error::{BeatError, Result};
use crate::pipeline::{AlertKind, PipelineState, PipelineStatus, SourcePipeline};
use crate::types::CursorPosition;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Operator alert for a persistent failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub source_id: String,
    pub kind: AlertKind,
    /// Last cursor known to be committed
    pub last_cursor: Option<CursorPosition>,
    /// Consecutive failed cycles
    pub failure_count: u32,
    pub message: String,
}

/// Scheduler events for monitoring
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Scheduler started
    Started,
    /// Scheduler stopped
    Stopped,
    /// A cycle finished and its batch was delivered
    CycleCompleted {
        source_id: String,
        fetched: usize,
        delivered: usize,
        committed: Option<CursorPosition>,
    },
    /// A cycle failed; the cursor was not advanced
    CycleFailed { source_id: String, error: String },
    /// A failure needs operator attention
    Alert(Alert),
}

struct ScheduledSource {
    pipeline: Arc<SourcePipeline>,
    interval: Duration,
    trigger: Arc<Notify>,
}

/// Drives every source pipeline on its own interval
pub struct PollScheduler {
    sources: Vec<ScheduledSource>,
    /// Event broadcaster
    event_tx: broadcast::Sender<SchedulerEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    /// Scheduler running flag
    running: RwLock<bool>,
}

impl PollScheduler {
    /// Create a scheduler for `(pipeline, poll interval)` pairs
    pub fn new(sources: Vec<(Arc<SourcePipeline>, Duration)>) -> Result<Self> {
        let mut seen = HashSet::new();
        for (pipeline, interval) in &sources {
            if !seen.insert(pipeline.source_id().to_string()) {
                return Err(BeatError::Config(format!(
                    "Duplicate source '{}'",
                    pipeline.source_id()
                )));
            }
            if interval.is_zero() {
                return Err(BeatError::Config(format!(
                    "Source '{}': poll interval must be positive",
                    pipeline.source_id()
                )));
            }
        }

        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        let sources = sources
            .into_iter()
            .map(|(pipeline, interval)| ScheduledSource {
                pipeline,
                interval,
                trigger: Arc::new(Notify::new()),
            })
            .collect();

        Ok(Self {
            sources,
            event_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            running: RwLock::new(false),
        })
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn one polling task per source
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        if *self.shutdown_tx.borrow() {
            return Err(BeatError::Config(
                "Scheduler cannot be restarted after shutdown".to_string(),
            ));
        }
        *running = true;
        drop(running);

        let mut tasks = self.tasks.lock().await;
        for source in &self.sources {
            let handle = tokio::spawn(run_source(
                source.pipeline.clone(),
                source.interval,
                source.trigger.clone(),
                self.event_tx.clone(),
                self.shutdown_tx.subscribe(),
            ));
            tasks.push((source.pipeline.source_id().to_string(), handle));
        }

        let _ = self.event_tx.send(SchedulerEvent::Started);
        tracing::info!(sources = self.sources.len(), "Poll scheduler started");
        Ok(())
    }

    /// Request an immediate cycle for a source
    pub fn trigger(&self, source_id: &str) -> Result<()> {
        let source = self.find(source_id)?;
        source.trigger.notify_one();
        tracing::debug!(source_id, "Manual trigger");
        Ok(())
    }

    /// Resume a source suspended after an authentication failure
    pub async fn resume(&self, source_id: &str) -> Result<bool> {
        let source = self.find(source_id)?;
        Ok(source.pipeline.resume().await)
    }

    /// Status of every pipeline
    pub async fn statuses(&self) -> Vec<PipelineStatus> {
        let mut statuses = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            statuses.push(source.pipeline.status().await);
        }
        statuses
    }

    /// Check if scheduler is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Stop all tasks, waiting up to `grace` for running cycles to finish
    ///
    /// Returns `false` if any task had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.tasks.lock().await);

        let deadline = tokio::time::Instant::now() + grace;
        let mut clean = true;
        for (source_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                clean = false;
                tracing::warn!(
                    source_id = %source_id,
                    grace_ms = grace.as_millis() as u64,
                    "Cycle still running after grace period, aborted"
                );
            }
        }

        for source in &self.sources {
            source.pipeline.stop().await;
        }
        *self.running.write().await = false;

        let _ = self.event_tx.send(SchedulerEvent::Stopped);
        tracing::info!(clean, "Poll scheduler stopped");
        clean
    }

    fn find(&self, source_id: &str) -> Result<&ScheduledSource> {
        self.sources
            .iter()
            .find(|s| s.pipeline.source_id() == source_id)
            .ok_or_else(|| BeatError::NotFound(format!("Source '{}'", source_id)))
    }
}

async fn run_source(
    pipeline: Arc<SourcePipeline>,
    period: Duration,
    trigger: Arc<Notify>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let source_id = pipeline.source_id().to_string();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            _ = trigger.notified() => {
                tracing::debug!(source_id = %source_id, "Triggered cycle");
            }
        }
        if *shutdown.borrow() {
            break;
        }
        if pipeline.state().await == PipelineState::Suspended {
            tracing::debug!(source_id = %source_id, "Source suspended, skipping cycle");
            continue;
        }

        match pipeline.run_cycle().await {
            Ok(report) => {
                let _ = event_tx.send(SchedulerEvent::CycleCompleted {
                    source_id: source_id.clone(),
                    fetched: report.fetched,
                    delivered: report.delivered,
                    committed: report.committed,
                });
            }
            Err(e) => {
                let _ = event_tx.send(SchedulerEvent::CycleFailed {
                    source_id: source_id.clone(),
                    error: e.to_string(),
                });
                let failure = pipeline.failure_context(&e).await;
                if let Some(kind) = failure.kind {
                    let _ = event_tx.send(SchedulerEvent::Alert(Alert {
                        source_id: source_id.clone(),
                        kind,
                        last_cursor: failure.last_cursor,
                        failure_count: failure.failure_count,
                        message: e.to_string(),
                    }));
                }
            }
        }
    }

    tracing::debug!(source_id = %source_id, "Polling task finished");
}
