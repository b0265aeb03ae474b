//! Sink dispatcher: concurrent fan-out with per-sink retries
//!
//! A batch is confirmed only when every sink acknowledged it. Sinks are
//! independent: one sink retrying or failing never blocks delivery to
//! the others, but any sink failure leaves the batch unconfirmed and the
//! cursor where it was.

use crate::error::{BeatError, Result};
use crate::retry::{RetryPolicy, RetryableError};
use crate::sink::AuditSink;
use crate::types::Batch;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

/// Delivery outcome for one sink
#[derive(Debug)]
pub struct SinkOutcome {
    pub sink: String,
    /// Delivery attempts made (0 for an empty batch)
    pub attempts: u32,
    /// `None` when the sink acknowledged the batch
    pub error: Option<BeatError>,
}

/// Per-sink outcomes of one batch delivery
#[derive(Debug, Default)]
pub struct DeliveryResult {
    pub outcomes: Vec<SinkOutcome>,
}

impl DeliveryResult {
    /// Every sink acknowledged the batch
    pub fn is_confirmed(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }

    /// Outcomes of sinks that did not acknowledge
    pub fn failures(&self) -> impl Iterator<Item = &SinkOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    /// The first sink failure, if any
    pub fn into_error(self) -> Option<BeatError> {
        self.outcomes.into_iter().find_map(|o| o.error)
    }
}

/// Fans batches out to all configured sinks
pub struct SinkDispatcher {
    sinks: Vec<Arc<dyn AuditSink>>,
    retry: RetryPolicy,
}

impl SinkDispatcher {
    /// Create a dispatcher; sink names must be unique and at least one
    /// sink is required
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>, retry: RetryPolicy) -> Result<Self> {
        if sinks.is_empty() {
            return Err(BeatError::Config("At least one sink is required".to_string()));
        }
        let mut names = HashSet::new();
        for sink in &sinks {
            if !names.insert(sink.name().to_string()) {
                return Err(BeatError::Config(format!(
                    "Duplicate sink name '{}'",
                    sink.name()
                )));
            }
        }
        retry.validate()?;
        Ok(Self { sinks, retry })
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver a batch to every sink concurrently
    pub async fn deliver(&self, batch: &Batch) -> DeliveryResult {
        if batch.is_empty() {
            let outcomes = self
                .sinks
                .iter()
                .map(|s| SinkOutcome {
                    sink: s.name().to_string(),
                    attempts: 0,
                    error: None,
                })
                .collect();
            return DeliveryResult { outcomes };
        }

        let futures = self.sinks.iter().map(|sink| self.deliver_to(sink, batch));
        let outcomes = join_all(futures).await;

        let result = DeliveryResult { outcomes };
        if result.is_confirmed() {
            tracing::debug!(
                source_id = %batch.source_id,
                events = batch.len(),
                sinks = self.sinks.len(),
                "Batch delivered"
            );
        }
        result
    }

    async fn deliver_to(&self, sink: &Arc<dyn AuditSink>, batch: &Batch) -> SinkOutcome {
        let name = sink.name().to_string();
        let mut attempts = 0u32;

        let operation = format!("deliver to {}", name);
        let result = self
            .retry
            .retry(&operation, |attempt| {
                attempts = attempt + 1;
                async move { sink.deliver(batch).await.map_err(RetryableError::from) }
            })
            .await;

        let error = result.err().map(|e| {
            let reason = match e {
                BeatError::RetriesExhausted { last, .. } => last,
                other => other.to_string(),
            };
            tracing::warn!(
                sink = %name,
                source_id = %batch.source_id,
                attempts,
                reason = %reason,
                "Sink did not acknowledge batch"
            );
            BeatError::PersistentSinkFailure {
                sink: name.clone(),
                attempts,
                reason,
            }
        });

        SinkOutcome {
            sink: name,
            attempts,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::types::{AuditEvent, CursorPosition};
    use chrono::Utc;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: 0.0,
        }
    }

    fn batch(n: u64) -> Batch {
        let events = (1..=n)
            .map(|sequence| AuditEvent {
                event_id: AuditEvent::derive_id("PRD-100", &format!("seq:{}", sequence)),
                source_id: "PRD-100".to_string(),
                sequence,
                occurred_at: Utc::now(),
                actor: None,
                action_code: "AU1".to_string(),
                object_reference: None,
                client: None,
                terminal: None,
                message: None,
                raw_payload: serde_json::json!({}),
            })
            .collect();
        Batch::new("PRD-100", events, CursorPosition::at_sequence(n))
    }

    #[test]
    fn test_requires_a_sink() {
        assert!(matches!(
            SinkDispatcher::new(Vec::new(), RetryPolicy::default()),
            Err(BeatError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let sinks: Vec<Arc<dyn AuditSink>> =
            vec![Arc::new(MemorySink::new("a")), Arc::new(MemorySink::new("a"))];
        assert!(SinkDispatcher::new(sinks, RetryPolicy::default()).is_err());
    }

    #[tokio::test]
    async fn test_all_sinks_ack() {
        let a = Arc::new(MemorySink::new("a"));
        let b = Arc::new(MemorySink::new("b"));
        let dispatcher =
            SinkDispatcher::new(vec![a.clone(), b.clone()], fast_retry(3)).unwrap();

        let result = dispatcher.deliver(&batch(3)).await;
        assert!(result.is_confirmed());
        assert_eq!(a.events().await.len(), 3);
        assert_eq!(b.events().await.len(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let a = Arc::new(MemorySink::new("a"));
        a.fail_next(2).await;
        let dispatcher = SinkDispatcher::new(vec![a.clone()], fast_retry(3)).unwrap();

        let result = dispatcher.deliver(&batch(2)).await;
        assert!(result.is_confirmed());
        assert_eq!(result.outcomes[0].attempts, 3);
        assert_eq!(a.events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_one_sink_down_leaves_batch_unconfirmed() {
        let a = Arc::new(MemorySink::new("a"));
        let b = Arc::new(MemorySink::new("b"));
        b.set_unavailable(true);
        let dispatcher =
            SinkDispatcher::new(vec![a.clone(), b.clone()], fast_retry(3)).unwrap();

        let result = dispatcher.deliver(&batch(2)).await;
        assert!(!result.is_confirmed());
        // The healthy sink still received the batch
        assert_eq!(a.events().await.len(), 2);
        assert_eq!(b.attempts(), 3);

        let failures: Vec<&SinkOutcome> = result.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].sink, "b");
        assert!(matches!(
            result.into_error(),
            Some(BeatError::PersistentSinkFailure { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_permanent_sink_error_not_retried() {
        let a = Arc::new(MemorySink::new("a"));
        a.fail_with(BeatError::sink("a", "rejected", false)).await;
        let dispatcher = SinkDispatcher::new(vec![a.clone()], fast_retry(5)).unwrap();

        let result = dispatcher.deliver(&batch(1)).await;
        assert!(!result.is_confirmed());
        assert_eq!(a.attempts(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_confirmed_without_delivery() {
        let a = Arc::new(MemorySink::new("a"));
        a.set_unavailable(true);
        let dispatcher = SinkDispatcher::new(vec![a.clone()], fast_retry(3)).unwrap();

        let result = dispatcher.deliver(&batch(0)).await;
        assert!(result.is_confirmed());
        assert_eq!(a.attempts(), 0);
    }
}
