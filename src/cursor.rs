//! Cursor persistence
//!
//! Durable per-source collection progress. A cursor is committed only
//! after its batch has been delivered; commits never move a cursor
//! backwards. `FileCursorStore` writes through a temp file, fsync, and
//! rename so a crash leaves either the old or the new document on disk.

use crate::error::{BeatError, Result};
use crate::types::Cursor;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Trait for persisting cursors
pub trait CursorStore: Send + Sync {
    /// Load the cursor for a source, or the beginning sentinel if none exists
    fn load(&self, source_id: &str) -> Result<Cursor>;

    /// Persist a new cursor for a source
    ///
    /// Fails with `CursorRegression` if the position moves backwards.
    fn commit(&self, source_id: &str, cursor: &Cursor) -> Result<()>;
}

fn check_advance(source_id: &str, current: Option<&Cursor>, next: &Cursor) -> Result<()> {
    if next.source_id != source_id {
        return Err(BeatError::Storage(format!(
            "Cursor for '{}' committed under source '{}'",
            next.source_id, source_id
        )));
    }
    if let Some(current) = current {
        if !next.position.advances_from(&current.position) {
            return Err(BeatError::CursorRegression {
                source_id: source_id.to_string(),
                current: current.position.to_string(),
                attempted: next.position.to_string(),
            });
        }
    }
    Ok(())
}

/// JSON file-based cursor store
///
/// All cursors live in one JSON document keyed by source id.
pub struct FileCursorStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileCursorStore {
    /// Create a new file cursor store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, Cursor>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let json = fs::read_to_string(&self.path).map_err(|e| {
            BeatError::Storage(format!(
                "Failed to read cursor file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        serde_json::from_str(&json).map_err(|e| {
            BeatError::Storage(format!(
                "Failed to parse cursor file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write_all(&self, cursors: &HashMap<String, Cursor>) -> Result<()> {
        let json = serde_json::to_string_pretty(cursors)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    BeatError::Storage(format!(
                        "Failed to create cursor directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        write().map_err(|e| {
            BeatError::Storage(format!(
                "Failed to write cursor file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            BeatError::Storage(format!(
                "Failed to rename cursor file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self, source_id: &str) -> Result<Cursor> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| BeatError::Storage(format!("Cursor lock poisoned: {}", e)))?;

        let cursor = self
            .read_all()?
            .remove(source_id)
            .unwrap_or_else(|| Cursor::beginning(source_id));

        tracing::debug!(
            path = %self.path.display(),
            source_id,
            position = %cursor.position,
            "Cursor loaded"
        );
        Ok(cursor)
    }

    fn commit(&self, source_id: &str, cursor: &Cursor) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|e| BeatError::Storage(format!("Cursor lock poisoned: {}", e)))?;

        let mut cursors = self.read_all()?;
        check_advance(source_id, cursors.get(source_id), cursor)?;
        cursors.insert(source_id.to_string(), cursor.clone());
        self.write_all(&cursors)?;

        tracing::debug!(
            path = %self.path.display(),
            source_id,
            position = %cursor.position,
            "Cursor committed"
        );
        Ok(())
    }
}

/// In-memory cursor store for testing
///
/// Lost on drop.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl MemoryCursorStore {
    /// All committed cursors
    pub fn snapshot(&self) -> HashMap<String, Cursor> {
        self.cursors
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, source_id: &str) -> Result<Cursor> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|e| BeatError::Storage(format!("Cursor lock poisoned: {}", e)))?;
        Ok(cursors
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| Cursor::beginning(source_id)))
    }

    fn commit(&self, source_id: &str, cursor: &Cursor) -> Result<()> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|e| BeatError::Storage(format!("Cursor lock poisoned: {}", e)))?;
        check_advance(source_id, cursors.get(source_id), cursor)?;
        cursors.insert(source_id.to_string(), cursor.clone());
        Ok(())
    }
}
