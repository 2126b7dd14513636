//! Kafka/Redpanda adapter built on rdkafka

use crate::consumer::{
    consumer::ResilientConsumer,
    dlq::{DlqPublisher, FailureContext},
    error::{ConsumerError, ConsumerResult},
    handle::{ConsumerHandle, TopicPartition},
    processor::MessageProcessor,
    shutdown::ShutdownReport,
};

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// How often the polling loop flushes commits while no message arrives
const IDLE_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// [`ConsumerHandle`] over an rdkafka [`StreamConsumer`]
#[derive(Clone)]
pub struct KafkaHandle {
    consumer: Arc<StreamConsumer>,
}

impl KafkaHandle {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        Self { consumer }
    }

    fn partition_list(partitions: &[TopicPartition]) -> TopicPartitionList {
        let mut list = TopicPartitionList::with_capacity(partitions.len());
        for tp in partitions {
            list.add_partition(&tp.topic, tp.partition);
        }
        list
    }
}

impl ConsumerHandle for KafkaHandle {
    fn pause(&self, partitions: &[TopicPartition]) -> ConsumerResult<()> {
        self.consumer.pause(&Self::partition_list(partitions))?;
        Ok(())
    }

    fn assignment(&self) -> ConsumerResult<Vec<TopicPartition>> {
        let assignment = self.consumer.assignment()?;
        Ok(assignment
            .elements()
            .iter()
            .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
            .collect())
    }

    /// librdkafka applies its own request timeout to synchronous commits, so
    /// `_timeout` is advisory here.
    fn commit_sync(
        &self,
        offsets: &[(TopicPartition, i64)],
        _timeout: Duration,
    ) -> ConsumerResult<()> {
        let mut list = TopicPartitionList::with_capacity(offsets.len());
        for (tp, offset) in offsets {
            list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))?;
        }
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}

/// Publishes failed messages to a DLQ topic, preserving key and payload and
/// describing the failure in `dlq.*` headers.
#[derive(Clone)]
pub struct KafkaDlqPublisher {
    producer: Arc<FutureProducer>,
    topic: String,
    timeout: Duration,
}

impl KafkaDlqPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer: Arc::new(producer),
            topic: topic.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Create a producer for `brokers` and wrap it
    pub fn connect(brokers: &str, topic: impl Into<String>) -> ConsumerResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| ConsumerError::ClientError(format!("Failed to create DLQ producer: {}", e)))?;
        Ok(Self::new(producer, topic))
    }

    /// Set the send timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn headers(original: &OwnedMessage, failure: &FailureContext) -> OwnedHeaders {
        let fields = [
            ("dlq.original.topic", failure.topic.clone()),
            ("dlq.original.partition", failure.partition.to_string()),
            ("dlq.original.offset", failure.offset.to_string()),
            ("dlq.record.id", failure.record_id.clone()),
            ("dlq.error.kind", failure.error_kind.to_string()),
            ("dlq.error.message", failure.error_message.clone()),
            ("dlq.error.retries", failure.retry_count.to_string()),
            ("dlq.failed.at", failure.failed_at.to_rfc3339()),
        ];

        let mut headers = OwnedHeaders::new_with_capacity(fields.len());
        for (key, value) in &fields {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }

        if let Some(original_headers) = original.headers() {
            for header in original_headers.iter() {
                if !header.key.starts_with("dlq.") {
                    let key = format!("dlq.original.header.{}", header.key);
                    headers = headers.insert(Header {
                        key: &key,
                        value: header.value,
                    });
                }
            }
        }

        headers
    }
}

#[async_trait]
impl DlqPublisher<OwnedMessage> for KafkaDlqPublisher {
    async fn publish(&self, message: &OwnedMessage, failure: &FailureContext) -> ConsumerResult<()> {
        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.topic).headers(Self::headers(message, failure));
        if let Some(key) = message.key() {
            record = record.key(key);
        }
        if let Some(payload) = message.payload() {
            record = record.payload(payload);
        }

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    "Message sent to DLQ topic: {}, partition: {}, offset: {}",
                    self.topic, partition, offset
                );
                Ok(())
            }
            Err((e, _)) => Err(ConsumerError::DlqError(format!("DLQ send failed: {}", e))),
        }
    }
}

/// Create a manually-committing consumer subscribed to `topics`
pub fn create_stream_consumer(
    brokers: &str,
    group_id: &str,
    topics: &[String],
) -> ConsumerResult<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| ConsumerError::ClientError(format!("Failed to create consumer: {}", e)))?;

    let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topics)
        .map_err(|e| ConsumerError::ClientError(format!("Failed to subscribe: {}", e)))?;
    info!("Subscribed to topics: {:?}", topics);

    Ok(consumer)
}

/// Poll `stream_consumer` and feed every message to `consumer` until
/// `shutdown` resolves or the stream ends, then shut the consumer down.
pub async fn run_stream<P, S>(
    consumer: Arc<ResilientConsumer<P, KafkaHandle>>,
    stream_consumer: Arc<StreamConsumer>,
    shutdown: S,
) -> ShutdownReport
where
    P: MessageProcessor<Message = OwnedMessage>,
    S: Future<Output = ()>,
{
    let handle = Arc::new(KafkaHandle::new(stream_consumer.clone()));
    let mut stream = stream_consumer.stream();
    let mut idle = tokio::time::interval(IDLE_DRAIN_INTERVAL);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = idle.tick() => {
                consumer.drain_commits().await;
            }
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    let message = message.detach();
                    let key = message.key().map(<[u8]>::to_vec);
                    let partition = TopicPartition::new(message.topic(), message.partition());
                    let offset = message.offset();
                    consumer
                        .receive(key, message, handle.clone(), partition, offset)
                        .await;
                }
                Some(Err(e)) => error!("Kafka error: {}", e),
                None => {
                    info!("Message stream ended");
                    break;
                }
            }
        }
    }

    drop(stream);
    consumer.shutdown().await
}
