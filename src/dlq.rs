//! Quarantine: records that could not be normalized
//!
//! With the `quarantine` failure policy a record that fails normalization
//! is handed to a `QuarantineHandler` instead of failing its batch. The
//! record must be stored durably before the batch cursor is committed, so
//! it is never dropped silently.

use crate::error::{BeatError, Result};
use crate::types::RawAuditRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};

/// A raw record set aside with the reason it was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedRecord {
    pub source_id: String,

    /// The original raw record
    pub record: RawAuditRecord,

    /// Why normalization failed
    pub reason: String,

    pub quarantined_at: DateTime<Utc>,
}

impl QuarantinedRecord {
    pub fn new(
        source_id: impl Into<String>,
        record: RawAuditRecord,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            record,
            reason: reason.into(),
            quarantined_at: Utc::now(),
        }
    }
}

/// Trait for quarantine stores
#[async_trait]
pub trait QuarantineHandler: Send + Sync {
    /// Store a rejected record; `Ok` means it is durably kept
    async fn handle(&self, record: QuarantinedRecord) -> Result<()>;

    /// Number of quarantined records
    async fn count(&self) -> Result<usize>;

    /// Most recent quarantined records, newest first
    async fn list(&self, limit: usize) -> Result<Vec<QuarantinedRecord>>;
}

/// In-memory quarantine for development and testing
#[derive(Default)]
pub struct MemoryQuarantine {
    records: RwLock<Vec<QuarantinedRecord>>,
}

impl MemoryQuarantine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuarantineHandler for MemoryQuarantine {
    async fn handle(&self, record: QuarantinedRecord) -> Result<()> {
        tracing::warn!(
            source_id = %record.source_id,
            sequence = record.record.sequence,
            reason = %record.reason,
            "Record quarantined"
        );
        self.records.write().await.push(record);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<QuarantinedRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

/// JSONL-file quarantine
///
/// One record per line, appended and fsynced before `handle` returns.
pub struct FileQuarantine {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileQuarantine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, action: &str, e: std::io::Error) -> BeatError {
        BeatError::Storage(format!(
            "Failed to {} quarantine file {}: {}",
            action,
            self.path.display(),
            e
        ))
    }

    async fn load(&self) -> Result<Vec<QuarantinedRecord>> {
        let file = match fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.storage_error("open", e)),
        };
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| self.storage_error("read", e))?
        {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QuarantinedRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Skipping unreadable quarantine line"
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl QuarantineHandler for FileQuarantine {
    async fn handle(&self, record: QuarantinedRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.storage_error("create directory for", e))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.storage_error("open", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.storage_error("write", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.storage_error("sync", e))?;

        tracing::warn!(
            source_id = %record.source_id,
            sequence = record.record.sequence,
            reason = %record.reason,
            path = %self.path.display(),
            "Record quarantined"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<QuarantinedRecord>> {
        let _guard = self.lock.lock().await;
        let records = self.load().await?;
        Ok(records.into_iter().rev().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rejected(sequence: u64) -> QuarantinedRecord {
        QuarantinedRecord::new(
            "PRD-100",
            RawAuditRecord::new(sequence, json!({"garbage": sequence})),
            format!("missing timestamp ({})", sequence),
        )
    }

    #[tokio::test]
    async fn test_memory_quarantine_handle_and_list() {
        let q = MemoryQuarantine::new();
        assert_eq!(q.count().await.unwrap(), 0);

        for i in 0..5 {
            q.handle(rejected(i)).await.unwrap();
        }

        assert_eq!(q.count().await.unwrap(), 5);
        let list = q.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        // Most recent first
        assert_eq!(list[0].record.sequence, 4);
        assert_eq!(list[2].record.sequence, 2);
    }

    #[tokio::test]
    async fn test_file_quarantine_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dlq/quarantine.jsonl");

        let q = FileQuarantine::new(&path);
        assert_eq!(q.count().await.unwrap(), 0);
        q.handle(rejected(7)).await.unwrap();
        q.handle(rejected(8)).await.unwrap();

        let reopened = FileQuarantine::new(&path);
        assert_eq!(reopened.count().await.unwrap(), 2);
        let list = reopened.list(10).await.unwrap();
        assert_eq!(list[0].record.sequence, 8);
        assert_eq!(list[1].record.payload, json!({"garbage": 7}));
    }

    #[test]
    fn test_record_serialization_camel_case() {
        let json = serde_json::to_string(&rejected(1)).unwrap();
        assert!(json.contains("\"sourceId\":\"PRD-100\""));
        assert!(json.contains("\"quarantinedAt\""));
    }
}
