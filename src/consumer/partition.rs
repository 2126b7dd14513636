//! Per-partition serialization of message processing

use crate::consumer::handle::TopicPartition;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Lock table giving each partition a strict FIFO of processing turns.
///
/// Turns are handed out in the order [`acquire`](Self::acquire) is called,
/// which is the polling order, so messages of one partition are processed one
/// at a time and in offset order. Different partitions never wait on each
/// other. Entries are created lazily and never removed; the table is bounded
/// by the number of partitions ever assigned.
#[derive(Debug, Clone, Default)]
pub struct PartitionLocks {
    tails: Arc<DashMap<TopicPartition, Option<oneshot::Receiver<()>>>>,
}

impl PartitionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next turn on `partition`. Must be called in delivery order.
    pub fn acquire(&self, partition: &TopicPartition) -> PartitionTurn {
        let (release, next) = oneshot::channel();
        let previous = match self.tails.get_mut(partition) {
            Some(mut tail) => tail.replace(next),
            None => self
                .tails
                .entry(partition.clone())
                .or_insert(None)
                .replace(next),
        };

        PartitionTurn { previous, release }
    }

    /// Number of partitions seen so far
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}

/// A reserved, not yet started, turn on a partition
#[derive(Debug)]
pub struct PartitionTurn {
    previous: Option<oneshot::Receiver<()>>,
    release: oneshot::Sender<()>,
}

impl PartitionTurn {
    /// Wait until every earlier turn on the partition has finished
    pub async fn wait(self) -> PartitionGuard {
        if let Some(previous) = self.previous {
            // An error means the previous holder was dropped, which also ends its turn
            let _ = previous.await;
        }
        PartitionGuard {
            _release: self.release,
        }
    }
}

/// Exclusive access to a partition; dropping it starts the next turn
#[derive(Debug)]
pub struct PartitionGuard {
    _release: oneshot::Sender<()>,
}
