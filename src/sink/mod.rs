//! Audit sink trait: downstream consumers of normalized events
//!
//! Every sink receives whole batches in source emission order and acks by
//! returning `Ok`. Delivery is at-least-once: after a crash between
//! delivery and cursor commit the same events (same `event_id`) arrive
//! again, so sinks should tolerate duplicates.

use crate::error::{BeatError, Result};
use crate::types::{AuditEvent, Batch};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

pub mod file;
pub mod memory;
pub mod tcp;

pub use file::{FileSink, FileSinkConfig};
pub use memory::MemorySink;
pub use tcp::{TcpSink, TcpSinkConfig};

/// Core trait for event sinks
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Sink name, unique within a dispatcher (e.g., "file", "siem-tcp")
    fn name(&self) -> &str;

    /// Deliver a batch, preserving event order
    ///
    /// Returning `Ok` acknowledges every event of the batch. Errors carry
    /// a transient flag that decides whether the dispatcher retries.
    async fn deliver(&self, batch: &Batch) -> Result<()>;
}

/// Encode events as newline-delimited JSON
pub fn encode_lines<'a>(events: impl IntoIterator<Item = &'a AuditEvent>) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(512);
    for event in events {
        serde_json::to_writer((&mut buf).writer(), event).map_err(BeatError::from)?;
        buf.put_u8(b'\n');
    }
    Ok(buf.freeze())
}
