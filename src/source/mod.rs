//! Audit source trait: the abstraction over upstream audit-log APIs
//!
//! A source returns the records strictly newer than a cursor position,
//! together with the position to commit once those records have been
//! delivered. Sources have no side effects beyond the remote call.

use crate::error::Result;
use crate::types::{CursorPosition, RawBatch};
use async_trait::async_trait;

pub mod memory;
pub mod sap;

pub use memory::MemorySource;
pub use sap::{FetchWindow, SapAuditClient, SapSourceSettings};

/// Core trait for audit-log sources
///
/// Implementations own retry/backoff for transient network failures.
/// Errors that reach the caller are either non-transient (`Auth`,
/// `MalformedResponse`) or an exhausted retry budget.
#[async_trait]
pub trait AuditSource: Send + Sync {
    /// Fetch records newer than `since`, in source emission order
    ///
    /// An empty batch is a valid result.
    async fn fetch(&self, source_id: &str, since: &CursorPosition) -> Result<RawBatch>;

    /// Source name for logs (e.g., "sap", "memory")
    fn name(&self) -> &str;
}
