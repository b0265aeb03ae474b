//! Line-delimited JSON file sink with size-based rotation
//!
//! Appends each batch to the active file and fsyncs before acking. When
//! the file grows past `max_bytes` it is renamed to `<file>.1` (replacing
//! any previous backup) and a fresh file is started. A backup older than
//! `backup_max_age` is removed.
//!
//! Event ids already written are remembered in a bounded window, seeded
//! from the active file on first use, so a redelivered batch does not
//! produce duplicate lines.

use super::{encode_lines, AuditSink};
use crate::config::duration_serde;
use crate::error::{BeatError, Result};
use crate::types::{AuditEvent, Batch};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// File sink configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSinkConfig {
    /// Active output file
    pub path: PathBuf,

    /// Rotate once the active file reaches this size
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Remove the `.1` backup once it is older than this
    #[serde(default = "default_backup_max_age", with = "duration_serde")]
    pub backup_max_age: Duration,

    /// Number of recent event ids remembered for deduplication (0 disables)
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_backup_max_age() -> Duration {
    Duration::from_secs(3600)
}
fn default_dedup_window() -> usize {
    10_000
}

impl FileSinkConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: default_max_bytes(),
            backup_max_age: default_backup_max_age(),
            dedup_window: default_dedup_window(),
        }
    }

    /// Path of the rotated backup (`<file>.1`)
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }
}

/// Bounded FIFO set of recently written event ids
#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
    seeded: bool,
}

impl SeenIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

/// Append-only JSONL file sink
pub struct FileSink {
    name: String,
    config: FileSinkConfig,
    seen: Mutex<SeenIds>,
}

impl FileSink {
    pub fn new(name: impl Into<String>, config: FileSinkConfig) -> Self {
        let seen = SeenIds {
            capacity: config.dedup_window,
            ..Default::default()
        };
        Self {
            name: name.into(),
            config,
            seen: Mutex::new(seen),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn io_error(&self, action: &str, path: &Path, e: std::io::Error) -> BeatError {
        BeatError::sink(
            &self.name,
            format!("Failed to {} {}: {}", action, path.display(), e),
            true,
        )
    }

    /// Load event ids from the tail of the active file
    async fn seed(&self, seen: &mut SeenIds) {
        seen.seeded = true;
        if seen.capacity == 0 {
            return;
        }
        let file = match fs::File::open(&self.config.path).await {
            Ok(f) => f,
            Err(_) => return,
        };
        let mut lines = BufReader::new(file).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(event) = serde_json::from_str::<AuditEvent>(&line) {
                seen.insert(event.event_id);
            }
        }
        tracing::debug!(
            sink = %self.name,
            path = %self.config.path.display(),
            seeded = seen.order.len(),
            "Dedup window seeded"
        );
    }

    async fn maybe_rotate(&self) -> Result<()> {
        let backup = self.config.backup_path();

        if let Some(modified) = file_modified_time(&backup) {
            let age = chrono::Utc::now() - modified;
            if age.to_std().unwrap_or_default() > self.config.backup_max_age {
                fs::remove_file(&backup)
                    .await
                    .map_err(|e| self.io_error("remove backup", &backup, e))?;
                tracing::debug!(path = %backup.display(), "Expired backup removed");
            }
        }

        let size = match fs::metadata(&self.config.path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.config.max_bytes {
            return Ok(());
        }

        fs::rename(&self.config.path, &backup)
            .await
            .map_err(|e| self.io_error("rotate", &self.config.path, e))?;
        tracing::info!(
            sink = %self.name,
            path = %self.config.path.display(),
            size,
            "Output file rotated"
        );
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<()> {
        let mut seen = self.seen.lock().await;
        if !seen.seeded {
            self.seed(&mut seen).await;
        }

        let fresh: Vec<&AuditEvent> = batch
            .events
            .iter()
            .filter(|e| !seen.contains(&e.event_id))
            .collect();
        let skipped = batch.len() - fresh.len();
        if fresh.is_empty() {
            tracing::debug!(sink = %self.name, skipped, "Batch already written");
            return Ok(());
        }

        self.maybe_rotate().await?;

        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error("create directory", parent, e))?;
            }
        }

        let bytes = encode_lines(fresh.iter().copied())?;
        let path = &self.config.path;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| self.io_error("open", path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| self.io_error("write", path, e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_error("sync", path, e))?;

        let written = fresh.len();
        for event in fresh {
            seen.insert(event.event_id.clone());
        }

        tracing::debug!(
            sink = %self.name,
            source_id = %batch.source_id,
            written,
            skipped,
            "Batch written"
        );
        Ok(())
    }
}

fn file_modified_time(path: &Path) -> Option<chrono::DateTime<chrono::Utc>> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(chrono::DateTime::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CursorPosition;
    use chrono::{TimeZone, Utc};

    fn event(sequence: u64) -> AuditEvent {
        AuditEvent {
            event_id: AuditEvent::derive_id("PRD-100", &format!("seq:{}", sequence)),
            source_id: "PRD-100".to_string(),
            sequence,
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            actor: Some("DDIC".to_string()),
            action_code: "AU1".to_string(),
            object_reference: None,
            client: None,
            terminal: None,
            message: None,
            raw_payload: serde_json::json!({"seq": sequence}),
        }
    }

    fn batch(seqs: std::ops::RangeInclusive<u64>) -> Batch {
        let events: Vec<AuditEvent> = seqs.map(event).collect();
        let last = events.last().map(|e| e.sequence).unwrap_or(0);
        Batch::new("PRD-100", events, CursorPosition::at_sequence(last))
    }

    async fn read_sequences(path: &Path) -> Vec<u64> {
        let content = fs::read_to_string(path).await.unwrap_or_default();
        content
            .lines()
            .map(|l| serde_json::from_str::<AuditEvent>(l).unwrap().sequence)
            .collect()
    }

    #[tokio::test]
    async fn test_append_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out/audit.jsonl");
        let sink = FileSink::new("file", FileSinkConfig::new(&path));

        sink.deliver(&batch(1..=3)).await.unwrap();
        sink.deliver(&batch(4..=5)).await.unwrap();

        assert_eq!(read_sequences(&path).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_redelivery_is_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let sink = FileSink::new("file", FileSinkConfig::new(&path));

        sink.deliver(&batch(1..=3)).await.unwrap();
        sink.deliver(&batch(2..=4)).await.unwrap();

        assert_eq!(read_sequences(&path).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_dedup_window_seeded_from_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");

        FileSink::new("file", FileSinkConfig::new(&path))
            .deliver(&batch(1..=3))
            .await
            .unwrap();

        // A new instance (process restart) still recognises the written ids
        let restarted = FileSink::new("file", FileSinkConfig::new(&path));
        restarted.deliver(&batch(1..=3)).await.unwrap();

        assert_eq!(read_sequences(&path).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dedup_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let config = FileSinkConfig {
            dedup_window: 0,
            ..FileSinkConfig::new(&path)
        };
        let sink = FileSink::new("file", config);

        sink.deliver(&batch(1..=2)).await.unwrap();
        sink.deliver(&batch(1..=2)).await.unwrap();
        assert_eq!(read_sequences(&path).await, vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_rotation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let config = FileSinkConfig {
            max_bytes: 200,
            ..FileSinkConfig::new(&path)
        };
        let backup = config.backup_path();
        let sink = FileSink::new("file", config);

        sink.deliver(&batch(1..=3)).await.unwrap();
        assert!(!backup.exists());

        sink.deliver(&batch(4..=4)).await.unwrap();
        assert!(backup.exists());
        assert_eq!(read_sequences(&backup).await, vec![1, 2, 3]);
        assert_eq!(read_sequences(&path).await, vec![4]);
    }

    #[tokio::test]
    async fn test_expired_backup_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let config = FileSinkConfig {
            backup_max_age: Duration::ZERO,
            ..FileSinkConfig::new(&path)
        };
        let backup = config.backup_path();
        std::fs::write(&backup, "old\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        FileSink::new("file", config)
            .deliver(&batch(1..=1))
            .await
            .unwrap();
        assert!(!backup.exists());
    }

    #[test]
    fn test_backup_path() {
        let config = FileSinkConfig::new("/var/log/sap/audit.txt");
        assert_eq!(config.backup_path(), PathBuf::from("/var/log/sap/audit.txt.1"));
    }

    #[test]
    fn test_config_defaults() {
        let config: FileSinkConfig = serde_json::from_str(r#"{"path": "audit.jsonl"}"#).unwrap();
        assert_eq!(config.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.backup_max_age, Duration::from_secs(3600));
        assert_eq!(config.dedup_window, 10_000);

        let config: FileSinkConfig =
            serde_json::from_str(r#"{"path": "a", "backupMaxAge": "5m"}"#).unwrap();
        assert_eq!(config.backup_max_age, Duration::from_secs(300));
    }
}
