//! Dead Letter Queue (DLQ) handling for failed messages

use crate::consumer::error::{ConsumerResult, ErrorKind};
use crate::consumer::metrics::MetricsRecorder;
use crate::consumer::processor::Delivery;
use crate::consumer::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Error context shipped to the DLQ alongside the failed message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureContext {
    /// Original topic
    pub topic: String,
    /// Original partition
    pub partition: i32,
    /// Original offset
    pub offset: i64,
    /// Business identifier of the message
    pub record_id: String,
    /// Failure classification
    pub error_kind: ErrorKind,
    /// Rendered error
    pub error_message: String,
    /// Retries performed before the message was given up on
    pub retry_count: u32,
    /// When the message was given up on
    pub failed_at: DateTime<Utc>,
}

impl FailureContext {
    /// Build the context for a delivery
    pub fn from_delivery<M>(
        delivery: &Delivery<M>,
        error_kind: ErrorKind,
        error_message: String,
        retry_count: u32,
    ) -> Self {
        Self {
            topic: delivery.partition.topic.clone(),
            partition: delivery.partition.partition,
            offset: delivery.offset,
            record_id: delivery.record_id.clone(),
            error_kind,
            error_message,
            retry_count,
            failed_at: Utc::now(),
        }
    }
}

/// Durable side channel for messages that cannot be processed.
///
/// `Ok(())` means the message is durably stored. Implementations may fail, be
/// slow or flaky; the consumer wraps every call in [`DeadLetterSink`].
#[async_trait]
pub trait DlqPublisher<M>: Send + Sync + 'static {
    /// Publish a failed message with its error context
    async fn publish(&self, message: &M, failure: &FailureContext) -> ConsumerResult<()>;
}

/// Hook invoked once DLQ publishing is exhausted and the fallback is enabled.
///
/// Returning `true` means the hook stored the message somewhere durable and the
/// offset may be committed.
#[async_trait]
pub trait DlqFallback<M>: Send + Sync + 'static {
    async fn on_dlq_exhausted(&self, message: &M, failure: &FailureContext) -> bool;
}

/// Default fallback: log and leave the message for broker redelivery
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndGiveUp;

#[async_trait]
impl<M: Send + Sync + 'static> DlqFallback<M> for LogAndGiveUp {
    async fn on_dlq_exhausted(&self, _message: &M, failure: &FailureContext) -> bool {
        warn!(
            topic = %failure.topic,
            partition = failure.partition,
            offset = failure.offset,
            record_id = %failure.record_id,
            "No DLQ fallback configured, message left for redelivery"
        );
        false
    }
}

/// Bounded-retry wrapper around a [`DlqPublisher`]
pub struct DeadLetterSink<M> {
    publisher: Arc<dyn DlqPublisher<M>>,
    fallback: Arc<dyn DlqFallback<M>>,
    policy: RetryPolicy,
    enable_fallback: bool,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<M: Send + Sync + 'static> DeadLetterSink<M> {
    /// `policy.max_retries` is the number of publish attempts
    pub fn new(
        publisher: Arc<dyn DlqPublisher<M>>,
        fallback: Arc<dyn DlqFallback<M>>,
        policy: RetryPolicy,
        enable_fallback: bool,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            publisher,
            fallback,
            policy,
            enable_fallback,
            metrics,
        }
    }

    /// Publish with retries; returns `true` once the message is durably stored
    /// (by the DLQ or by the fallback hook).
    pub async fn publish(&self, message: &M, failure: &FailureContext) -> bool {
        let attempts = self.policy.max_retries.max(1);

        for attempt in 1..=attempts {
            match self.publisher.publish(message, failure).await {
                Ok(()) => {
                    debug!(
                        topic = %failure.topic,
                        partition = failure.partition,
                        offset = failure.offset,
                        "Message published to DLQ on attempt {}",
                        attempt
                    );
                    self.metrics.record_dlq_published();
                    return true;
                }
                Err(e) => {
                    warn!(
                        topic = %failure.topic,
                        partition = failure.partition,
                        offset = failure.offset,
                        "DLQ publish attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
            }
        }

        self.metrics.record_dlq_failure();
        error!(
            topic = %failure.topic,
            partition = failure.partition,
            offset = failure.offset,
            record_id = %failure.record_id,
            "DLQ publish failed after {} attempts",
            attempts
        );

        if !self.enable_fallback {
            return false;
        }

        let handled = self.fallback.on_dlq_exhausted(message, failure).await;
        if handled {
            self.metrics.record_dlq_fallback();
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::error::ConsumerError;
    use crate::consumer::handle::TopicPartition;
    use crate::consumer::metrics::ConsumerMetrics;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DlqPublisher<String> for Flaky {
        async fn publish(&self, _message: &String, _failure: &FailureContext) -> ConsumerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ConsumerError::DlqError("broker unavailable".into()));
            }
            Ok(())
        }
    }

    struct Stash;

    #[async_trait]
    impl DlqFallback<String> for Stash {
        async fn on_dlq_exhausted(&self, _message: &String, _failure: &FailureContext) -> bool {
            true
        }
    }

    fn failure() -> FailureContext {
        let delivery = Delivery::new(None, (), TopicPartition::new("people", 2), 7, "rec-7".into());
        FailureContext::from_delivery(&delivery, ErrorKind::Permanent, "boom".into(), 0)
    }

    fn build_sink(
        failures: u32,
        fallback: Arc<dyn DlqFallback<String>>,
        enable_fallback: bool,
    ) -> (DeadLetterSink<String>, Arc<Flaky>, Arc<ConsumerMetrics>) {
        let publisher = Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        });
        let metrics = Arc::new(ConsumerMetrics::new());
        let sink = DeadLetterSink::new(
            publisher.clone(),
            fallback,
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100), 2.0),
            enable_fallback,
            metrics.clone(),
        );
        (sink, publisher, metrics)
    }

    #[test]
    fn test_failure_context_from_delivery() {
        let ctx = failure();
        assert_eq!(ctx.topic, "people");
        assert_eq!(ctx.partition, 2);
        assert_eq!(ctx.offset, 7);
        assert_eq!(ctx.record_id, "rec-7");
        assert_eq!(ctx.error_kind, ErrorKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let (sink, publisher, metrics) = build_sink(2, Arc::new(LogAndGiveUp), false);

        assert!(sink.publish(&"msg".to_string(), &failure()).await);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().dlq_published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_without_fallback() {
        let (sink, publisher, metrics) = build_sink(10, Arc::new(Stash), false);

        assert!(!sink.publish(&"msg".to_string(), &failure()).await);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().dlq_failures, 1);
        assert_eq!(metrics.snapshot().dlq_fallbacks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_hook() {
        let (sink, _, metrics) = build_sink(10, Arc::new(Stash), true);
        assert!(sink.publish(&"msg".to_string(), &failure()).await);
        assert_eq!(metrics.snapshot().dlq_fallbacks, 1);

        let (sink, _, _) = build_sink(10, Arc::new(LogAndGiveUp), true);
        assert!(!sink.publish(&"msg".to_string(), &failure()).await);
    }
}
