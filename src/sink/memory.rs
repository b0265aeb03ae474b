//! In-memory sink for testing
//!
//! Records every delivered batch. Failures can be scripted per call or
//! switched on until cleared.

use super::AuditSink;
use crate::error::{BeatError, Result};
use crate::types::{AuditEvent, Batch};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// In-memory sink
pub struct MemorySink {
    name: String,
    events: RwLock<Vec<AuditEvent>>,
    failures: Mutex<VecDeque<BeatError>>,
    unavailable: AtomicBool,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: RwLock::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            unavailable: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` deliveries with a transient error
    pub async fn fail_next(&self, count: usize) {
        let mut failures = self.failures.lock().await;
        for _ in 0..count {
            failures.push_back(BeatError::sink(&self.name, "injected failure", true));
        }
    }

    /// Fail the next delivery with a specific error
    pub async fn fail_with(&self, error: BeatError) {
        self.failures.lock().await.push_back(error);
    }

    /// Fail every delivery with a transient error until switched off
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every event received, duplicates included, in arrival order
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    /// Events with duplicate `event_id`s removed, first occurrence kept
    pub async fn unique_events(&self) -> Vec<AuditEvent> {
        let mut seen = HashSet::new();
        self.events
            .read()
            .await
            .iter()
            .filter(|e| seen.insert(e.event_id.clone()))
            .cloned()
            .collect()
    }

    /// Number of `deliver` calls, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BeatError::sink(&self.name, "sink unavailable", true));
        }
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }

        self.events.write().await.extend(batch.events.iter().cloned());
        Ok(())
    }
}
