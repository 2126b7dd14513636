//! Resilient message-queue consumer core
//!
//! Wraps partitioned message-queue consumption with classified retries, a
//! dead letter queue with a fallback hook, offset commits issued from the
//! polling task only, strict per-partition ordering and graceful drain on
//! shutdown. The broker client, the DLQ sink and the message processor are
//! plugged in through traits; an rdkafka adapter ships behind the `kafka`
//! feature.
//!
//! See [`consumer`] for the building blocks and a complete example.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod consumer;
pub mod envelope;
pub mod telemetry;

pub use consumer::{
    ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerMetrics, ConsumerResult,
    DlqFallback, DlqPublisher, FailureContext, MessageProcessor, MetricsRecorder,
    ProcessingError, ResilientConsumer, ShutdownReport, TopicPartition,
};
pub use envelope::{EnvelopeHandler, EnvelopeProcessor, RecordEnvelope};
