//! Retry logic and policies for message processing

use crate::consumer::dlq::{DeadLetterSink, FailureContext};
use crate::consumer::error::ProcessingError;
use crate::consumer::metrics::MetricsRecorder;
use crate::consumer::processor::{Delivery, FailureDisposition, MessageProcessor, ProcessingResult};
use crate::consumer::shutdown::ShutdownState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff policy.
///
/// `delay(attempt) = min(initial_backoff * backoff_multiplier^(attempt - 1), max_backoff)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (for DLQ publishing: number of attempts)
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Create a policy with fixed backoff
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self::new(max_retries, backoff, backoff, 1.0)
    }

    /// Backoff before retry number `attempt` (1-based). `attempt == 0` yields zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let nanos = self.initial_backoff.as_nanos() as f64 * factor;

        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }

        Duration::from_nanos(nanos as u64).min(self.max_backoff)
    }

    /// Whether retry number `attempt` (1-based) is still within budget
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Runs a processor against one delivery, classifies failures and applies the
/// retry budget.
///
/// Validation and permanent errors go to the DLQ immediately without
/// consuming retries. Transient and unclassified errors are retried with
/// exponential backoff; once the budget is spent the engine returns
/// [`FailureDisposition::RetriesExhausted`] and leaves the DLQ publish to the
/// caller. A shutdown observed at a retry boundary aborts the loop with
/// [`FailureDisposition::Interrupted`].
pub struct RetryExecutor {
    policy: RetryPolicy,
    shutdown: Arc<ShutdownState>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(
        policy: RetryPolicy,
        shutdown: Arc<ShutdownState>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            policy,
            shutdown,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Process `delivery` until success, a non-retryable failure, retry
    /// exhaustion or shutdown.
    pub async fn execute<P: MessageProcessor>(
        &self,
        processor: &P,
        delivery: &Delivery<P::Message>,
        dlq: &DeadLetterSink<P::Message>,
    ) -> ProcessingResult {
        let mut attempt: u32 = 0;
        let mut validated = false;

        loop {
            let error = match Self::attempt(processor, delivery, &mut validated).await {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(
                            partition = %delivery.partition,
                            offset = delivery.offset,
                            "Message processed after {} retries",
                            attempt
                        );
                    }
                    return ProcessingResult::Success;
                }
                Err(error) => error,
            };

            self.metrics.record_error(error.kind());

            if !error.is_retryable() {
                warn!(
                    partition = %delivery.partition,
                    offset = delivery.offset,
                    record_id = %delivery.record_id,
                    kind = %error.kind(),
                    "Non-retryable failure, routing to DLQ: {}",
                    error
                );
                let failure = FailureContext::from_delivery(
                    delivery,
                    error.kind(),
                    error.to_string(),
                    attempt,
                );
                let published = dlq.publish(&delivery.message, &failure).await;
                return ProcessingResult::Failed {
                    already_published_to_dlq: published,
                    retry_count: attempt,
                    last_error: Some(error),
                    disposition: FailureDisposition::DlqAttempted,
                };
            }

            attempt += 1;

            if !self.policy.should_retry(attempt) {
                warn!(
                    partition = %delivery.partition,
                    offset = delivery.offset,
                    record_id = %delivery.record_id,
                    "Retries exhausted after {} attempts: {}",
                    attempt,
                    error
                );
                return ProcessingResult::Failed {
                    already_published_to_dlq: false,
                    retry_count: attempt - 1,
                    last_error: Some(error),
                    disposition: FailureDisposition::RetriesExhausted,
                };
            }

            if self.shutdown.is_shutting_down() {
                return self.interrupted(delivery, attempt, error);
            }

            let backoff = self.policy.delay(attempt);
            warn!(
                partition = %delivery.partition,
                offset = delivery.offset,
                attempt,
                "Processing failed, retrying in {:?}: {}",
                backoff,
                error
            );
            self.metrics.record_retry();

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => {}
            }

            if self.shutdown.is_shutting_down() {
                return self.interrupted(delivery, attempt, error);
            }
        }
    }

    async fn attempt<P: MessageProcessor>(
        processor: &P,
        delivery: &Delivery<P::Message>,
        validated: &mut bool,
    ) -> Result<(), ProcessingError> {
        if !*validated {
            processor.validate(&delivery.message).await?;
            *validated = true;
        }
        processor.process(&delivery.message).await
    }

    fn interrupted<M>(
        &self,
        delivery: &Delivery<M>,
        attempt: u32,
        error: ProcessingError,
    ) -> ProcessingResult {
        debug!(
            partition = %delivery.partition,
            offset = delivery.offset,
            "Shutdown observed at retry {}, leaving message for redelivery",
            attempt
        );
        ProcessingResult::Failed {
            already_published_to_dlq: false,
            retry_count: attempt,
            last_error: Some(error),
            disposition: FailureDisposition::Interrupted,
        }
    }
}
