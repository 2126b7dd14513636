//! Broker client primitives the consumer core calls back into

use crate::consumer::error::ConsumerResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A single partition of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number within the topic
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic/partition pair
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Handle to the broker client that delivered a message.
///
/// The underlying clients are generally not safe for concurrent commits, so the
/// consumer only ever calls [`commit_sync`](ConsumerHandle::commit_sync) from the
/// polling task (or once from the shutdown coordinator after polling stopped).
pub trait ConsumerHandle: Send + Sync + 'static {
    /// Stop fetching from the given partitions
    fn pause(&self, partitions: &[TopicPartition]) -> ConsumerResult<()>;

    /// Partitions currently assigned to this client
    fn assignment(&self) -> ConsumerResult<Vec<TopicPartition>>;

    /// Synchronously commit the given offsets. Offsets are "next offset to read".
    fn commit_sync(
        &self,
        offsets: &[(TopicPartition, i64)],
        timeout: Duration,
    ) -> ConsumerResult<()>;
}
