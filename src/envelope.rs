//! JSON record envelopes produced by the upstream ingestion flow
//!
//! Each message carries one record:
//!
//! ```json
//! {"batch_id": "6f1c...", "record_id": "1", "ingested_at": "2024-05-01T10:00:00Z", "payload": {"name": "Luke Skywalker"}}
//! ```

use crate::consumer::{MessageProcessor, ProcessingError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::info;

/// One ingested record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    /// Ingestion run that produced the record
    #[serde(default)]
    pub batch_id: String,
    /// Business identifier of the record
    #[serde(default)]
    pub record_id: String,
    pub ingested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RecordEnvelope {
    /// Parse and check the identifiers
    pub fn parse(bytes: &[u8]) -> Result<Self, ProcessingError> {
        let envelope: RecordEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| ProcessingError::validation(format!("malformed envelope: {}", e)))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), ProcessingError> {
        if self.record_id.trim().is_empty() {
            return Err(ProcessingError::validation("recordId blank"));
        }
        if self.batch_id.trim().is_empty() {
            return Err(ProcessingError::validation("batchId blank"));
        }
        Ok(())
    }
}

/// Messages that expose a raw byte payload
pub trait RawPayload: Send + Sync + 'static {
    fn raw_payload(&self) -> Option<&[u8]>;
}

impl RawPayload for Vec<u8> {
    fn raw_payload(&self) -> Option<&[u8]> {
        Some(self)
    }
}

impl RawPayload for String {
    fn raw_payload(&self) -> Option<&[u8]> {
        Some(self.as_bytes())
    }
}

#[cfg(feature = "kafka")]
impl RawPayload for rdkafka::message::OwnedMessage {
    fn raw_payload(&self) -> Option<&[u8]> {
        rdkafka::Message::payload(self)
    }
}

/// Business logic applied to each valid envelope
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: RecordEnvelope) -> Result<(), ProcessingError>;
}

/// Handler that only logs the record
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl EnvelopeHandler for LoggingHandler {
    async fn handle(&self, envelope: RecordEnvelope) -> Result<(), ProcessingError> {
        info!(
            batch_id = %envelope.batch_id,
            record_id = %envelope.record_id,
            "Record received"
        );
        Ok(())
    }
}

/// [`MessageProcessor`] that decodes a [`RecordEnvelope`] and passes it on.
///
/// Malformed JSON, a missing payload and blank identifiers are validation
/// errors and go straight to the DLQ.
pub struct EnvelopeProcessor<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> EnvelopeProcessor<M, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[derive(Deserialize)]
struct RecordIdOnly {
    #[serde(default)]
    record_id: String,
}

#[async_trait]
impl<M, H> MessageProcessor for EnvelopeProcessor<M, H>
where
    M: RawPayload,
    H: EnvelopeHandler,
{
    type Message = M;

    async fn process(&self, message: &M) -> Result<(), ProcessingError> {
        let bytes = message
            .raw_payload()
            .ok_or_else(|| ProcessingError::validation("empty payload"))?;
        let envelope = RecordEnvelope::parse(bytes)?;
        self.handler.handle(envelope).await
    }

    fn record_id(&self, message: &M) -> Option<String> {
        let ids: RecordIdOnly = serde_json::from_slice(message.raw_payload()?).ok()?;
        let record_id = ids.record_id.trim();
        (!record_id.is_empty()).then(|| record_id.to_string())
    }

    fn name(&self) -> &str {
        "EnvelopeProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ErrorKind;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<RecordEnvelope>>);

    #[async_trait]
    impl EnvelopeHandler for Collect {
        async fn handle(&self, envelope: RecordEnvelope) -> Result<(), ProcessingError> {
            self.0.lock().push(envelope);
            Ok(())
        }
    }

    fn processor() -> EnvelopeProcessor<String, Collect> {
        EnvelopeProcessor::new(Collect::default())
    }

    #[tokio::test]
    async fn test_valid_envelope_reaches_handler() {
        let processor = processor();
        let message = r#"{"batch_id":"b-1","record_id":"1","ingested_at":"2024-05-01T10:00:00Z","payload":{"name":"Luke Skywalker"}}"#.to_string();

        processor.process(&message).await.unwrap();

        let seen = processor.handler().0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].record_id, "1");
        assert_eq!(seen[0].payload["name"], "Luke Skywalker");
        assert!(seen[0].ingested_at.is_some());
        assert_eq!(processor.record_id(&message), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_blank_identifiers_are_validation_errors() {
        let processor = processor();

        let err = processor
            .process(&r#"{"batch_id":"","record_id":"7"}"#.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: batchId blank");

        let err = processor
            .process(&r#"{"batch_id":"b-1","record_id":"  "}"#.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Validation error: recordId blank");
    }

    #[tokio::test]
    async fn test_malformed_json_is_not_retried() {
        let processor = processor();
        let err = processor.process(&"not json".to_string()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(processor.record_id(&"not json".to_string()), None);
    }
}
