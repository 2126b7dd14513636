//! Consumer error types

use crate::consumer::executor::TaskError;
use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Broker client errors (pause, assignment lookups)
    #[error("Client error: {0}")]
    ClientError(String),

    /// Offset commit errors
    #[error("Commit error: {0}")]
    CommitError(String),

    /// DLQ errors
    #[error("DLQ error: {0}")]
    DlqError(String),

    /// Processing task errors
    #[error("Task error: {0}")]
    TaskError(#[from] TaskError),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl ConsumerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            #[cfg(feature = "kafka")]
            ConsumerError::KafkaError(e) => {
                !matches!(e, rdkafka::error::KafkaError::MessageConsumption(_))
            }
            ConsumerError::ClientError(_) => true,
            ConsumerError::CommitError(_) => true,
            ConsumerError::DlqError(_) => true,
            ConsumerError::IoError(_) => true,
            ConsumerError::ConfigError(_) => false,
            ConsumerError::TaskError(_) => false,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConsumerError::ConfigError(_) => ErrorSeverity::Fatal,
            ConsumerError::CommitError(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Warnings that don't stop processing
    Warning,
    /// Errors that may be retried
    Error,
    /// Fatal errors that stop the consumer
    Fatal,
}

/// Errors a [`MessageProcessor`](crate::consumer::MessageProcessor) reports back to the
/// retry engine. The variant decides whether the message is retried.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The message itself is malformed. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A known unrecoverable business failure. Never retried.
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// A failure expected to clear up on its own (network, lock contention, ...).
    #[error("Processing error: {0}")]
    Transient(String),

    /// Anything the processor did not classify. Retried like a transient error.
    #[error("Unclassified error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    /// Shorthand for [`ProcessingError::Validation`]
    pub fn validation(message: impl Into<String>) -> Self {
        ProcessingError::Validation(message.into())
    }

    /// Shorthand for [`ProcessingError::Permanent`]
    pub fn permanent(message: impl Into<String>) -> Self {
        ProcessingError::Permanent(message.into())
    }

    /// Shorthand for [`ProcessingError::Transient`]
    pub fn transient(message: impl Into<String>) -> Self {
        ProcessingError::Transient(message.into())
    }

    /// Classification used for metrics and DLQ metadata
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessingError::Validation(_) => ErrorKind::Validation,
            ProcessingError::Permanent(_) => ErrorKind::Permanent,
            ProcessingError::Transient(_) => ErrorKind::Transient,
            ProcessingError::Other(_) => ErrorKind::Unclassified,
        }
    }

    /// Validation and permanent errors bypass the retry budget entirely
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessingError::Transient(_) | ProcessingError::Other(_)
        )
    }
}

/// Failure classification shared by metrics, logs and DLQ records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed message
    Validation,
    /// Unrecoverable business failure
    Permanent,
    /// Recoverable failure
    Transient,
    /// Unclassified processor error
    Unclassified,
    /// The processing task itself failed (panic)
    Unexpected,
}

impl ErrorKind {
    /// Stable label for metrics and headers
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Transient => "transient",
            ErrorKind::Unclassified => "unclassified",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
