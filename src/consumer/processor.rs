//! Message processor trait and per-message processing types

use crate::consumer::error::ProcessingError;
use crate::consumer::handle::TopicPartition;
use async_trait::async_trait;
use std::time::Instant;

/// User-supplied message handling logic.
///
/// Errors are reported through [`ProcessingError`]; the variant decides
/// whether the retry engine retries the message or routes it to the DLQ.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// Message type delivered by the broker client
    type Message: Send + Sync + 'static;

    /// Optional validation hook, run once before the first processing attempt
    async fn validate(&self, _message: &Self::Message) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Process a single message
    async fn process(&self, message: &Self::Message) -> Result<(), ProcessingError>;

    /// Business identifier of the message, used in logs, commits and DLQ metadata.
    /// Defaults to `topic[partition]@offset`.
    fn record_id(&self, _message: &Self::Message) -> Option<String> {
        None
    }

    /// Get processor name for logs
    fn name(&self) -> &str {
        "MessageProcessor"
    }
}

/// A message together with its broker coordinates
#[derive(Debug)]
pub struct Delivery<M> {
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// The message itself
    pub message: M,
    /// Source partition
    pub partition: TopicPartition,
    /// Offset of the message within the partition
    pub offset: i64,
    /// Business identifier
    pub record_id: String,
    /// When the polling task handed the message over
    pub received_at: Instant,
}

impl<M> Delivery<M> {
    pub fn new(
        key: Option<Vec<u8>>,
        message: M,
        partition: TopicPartition,
        offset: i64,
        record_id: String,
    ) -> Self {
        Self {
            key,
            message,
            partition,
            offset,
            record_id,
            received_at: Instant::now(),
        }
    }
}

/// Why a message ended in [`ProcessingResult::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Non-retryable error; the engine already made the one DLQ publish attempt
    DlqAttempted,
    /// Retry budget spent; the caller makes the DLQ publish attempt
    RetriesExhausted,
    /// Shutdown interrupted the retry loop; the broker will redeliver
    Interrupted,
}

/// Terminal outcome of the retry engine, produced exactly once per message
#[derive(Debug)]
pub enum ProcessingResult {
    /// Processing succeeded; the offset gets committed
    Success,
    /// Processing failed
    Failed {
        /// The DLQ publish already succeeded; never publish again
        already_published_to_dlq: bool,
        /// Retries performed before giving up
        retry_count: u32,
        /// Last error raised by the processor
        last_error: Option<ProcessingError>,
        /// What happened to the message, and who owns the DLQ publish
        disposition: FailureDisposition,
    },
}

impl ProcessingResult {
    /// Whether processing succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Success)
    }
}
