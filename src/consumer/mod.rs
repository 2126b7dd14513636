//! Resilient message-queue consumer core
//!
//! Wraps partitioned consumption with:
//! - Classified retries with exponential backoff
//! - Dead letter queue publishing with bounded retry and a fallback hook
//! - Offset commits issued only from the polling task
//! - Strict per-partition ordering with cross-partition concurrency
//! - Graceful drain on shutdown
//!
//! # Example
//!
//! ```no_run
//! use resilient_consumer::consumer::{
//!     ConsumerConfig, ConsumerHandle, ConsumerResult, DlqPublisher, FailureContext,
//!     MessageProcessor, ProcessingError, ResilientConsumer, TopicPartition,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Uppercase;
//!
//! #[async_trait]
//! impl MessageProcessor for Uppercase {
//!     type Message = String;
//!
//!     async fn process(&self, message: &String) -> Result<(), ProcessingError> {
//!         if message.is_empty() {
//!             return Err(ProcessingError::validation("empty message"));
//!         }
//!         println!("{}", message.to_uppercase());
//!         Ok(())
//!     }
//! }
//!
//! struct StderrDlq;
//!
//! #[async_trait]
//! impl DlqPublisher<String> for StderrDlq {
//!     async fn publish(&self, message: &String, failure: &FailureContext) -> ConsumerResult<()> {
//!         eprintln!("dead letter {:?}: {}", message, failure.error_message);
//!         Ok(())
//!     }
//! }
//!
//! struct Client;
//!
//! impl ConsumerHandle for Client {
//!     fn pause(&self, _partitions: &[TopicPartition]) -> ConsumerResult<()> { Ok(()) }
//!     fn assignment(&self) -> ConsumerResult<Vec<TopicPartition>> { Ok(Vec::new()) }
//!     fn commit_sync(&self, _offsets: &[(TopicPartition, i64)], _timeout: Duration) -> ConsumerResult<()> { Ok(()) }
//! }
//!
//! # async fn example() -> ConsumerResult<()> {
//! let consumer = ResilientConsumer::<Uppercase, Client>::builder(
//!     ConsumerConfig::from_env()?,
//!     Arc::new(Uppercase),
//!     Arc::new(StderrDlq),
//! )
//! .build()?;
//!
//! let client = Arc::new(Client);
//! consumer
//!     .receive(None, "hello".to_string(), client, TopicPartition::new("people", 0), 0)
//!     .await;
//!
//! consumer.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod commit_tracker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod executor;
pub mod handle;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod metrics;
pub mod partition;
pub mod processor;
pub mod retry;
pub mod shutdown;

pub use commit_tracker::{CommitTracker, DrainStats, PendingCommit};
pub use config::{ConsumerConfig, ConsumerConfigBuilder};
pub use consumer::{ResilientConsumer, ResilientConsumerBuilder};
pub use dlq::{DeadLetterSink, DlqFallback, DlqPublisher, FailureContext, LogAndGiveUp};
pub use error::{ConsumerError, ConsumerResult, ErrorKind, ErrorSeverity, ProcessingError};
pub use executor::{ProcessingExecutor, TaskError, TaskHandle};
pub use handle::{ConsumerHandle, TopicPartition};
#[cfg(feature = "kafka")]
pub use kafka::{create_stream_consumer, run_stream, KafkaDlqPublisher, KafkaHandle};
pub use metrics::{ConsumerMetrics, MetricsRecorder, MetricsSnapshot, NoopMetrics, ProcessingStats};
pub use partition::{PartitionGuard, PartitionLocks, PartitionTurn};
pub use processor::{Delivery, FailureDisposition, MessageProcessor, ProcessingResult};
pub use retry::{RetryExecutor, RetryPolicy};
pub use shutdown::{InFlightTask, ShutdownCoordinator, ShutdownReport, ShutdownState};
