//! In-memory audit source for tests and embedding
//!
//! Records are pushed with explicit sequence numbers per source. Failures
//! can be scripted and are returned by the next fetches in FIFO order.

use super::AuditSource;
use crate::error::{BeatError, Result};
use crate::types::{CursorPosition, RawAuditRecord, RawBatch};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// In-memory audit source
#[derive(Default)]
pub struct MemorySource {
    records: Mutex<HashMap<String, BTreeMap<u64, serde_json::Value>>>,
    failures: Mutex<VecDeque<BeatError>>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the record at `sequence` for a source
    pub async fn push(&self, source_id: &str, sequence: u64, payload: serde_json::Value) {
        self.records
            .lock()
            .await
            .entry(source_id.to_string())
            .or_default()
            .insert(sequence, payload);
    }

    /// Make the next fetch fail with `error`
    pub async fn fail_next(&self, error: BeatError) {
        self.failures.lock().await.push_back(error);
    }

    /// Number of fetch calls so far, failed ones included
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditSource for MemorySource {
    async fn fetch(&self, source_id: &str, since: &CursorPosition) -> Result<RawBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }

        let records = self.records.lock().await;
        let Some(stream) = records.get(source_id) else {
            return Ok(RawBatch::empty(since.clone()));
        };

        let records: Vec<RawAuditRecord> = stream
            .range(since.sequence + 1..)
            .map(|(sequence, payload)| RawAuditRecord::new(*sequence, payload.clone()))
            .collect();

        let high_water = CursorPosition {
            sequence: records.last().map(|r| r.sequence).unwrap_or(since.sequence),
            watermark: since.watermark,
        };

        Ok(RawBatch {
            records,
            high_water,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
