//! Offset commit tracking
//!
//! Processing tasks finish on arbitrary worker threads, but broker clients only
//! tolerate commits from the polling task. Completions therefore enqueue a
//! [`PendingCommit`] and the polling task drains the queue at the start of every
//! receive, plus once more during shutdown.

use crate::consumer::error::ErrorSeverity;
use crate::consumer::handle::{ConsumerHandle, TopicPartition};
use crate::consumer::metrics::MetricsRecorder;
use crate::consumer::processor::Delivery;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// An offset ready to be committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    pub partition_key: TopicPartition,
    /// Offset of the processed message plus one
    pub offset_to_commit: i64,
    pub record_id: String,
    /// `false` when the message was parked in the DLQ instead of processed
    pub is_processing_success: bool,
}

impl PendingCommit {
    /// Commit acknowledging exactly `delivery`
    pub fn for_delivery<M>(delivery: &Delivery<M>, is_processing_success: bool) -> Self {
        Self {
            partition_key: delivery.partition.clone(),
            offset_to_commit: delivery.offset + 1,
            record_id: delivery.record_id.clone(),
            is_processing_success,
        }
    }
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub committed: usize,
    pub abandoned: usize,
}

/// Many-producer, single-drainer queue of pending offset commits
pub struct CommitTracker {
    tx: Sender<PendingCommit>,
    rx: Receiver<PendingCommit>,
    /// Keeps the polling task and the shutdown flush from draining concurrently
    drain_lock: tokio::sync::Mutex<()>,
    commit_timeout: Duration,
    retry_delay: Duration,
    metrics: Arc<dyn MetricsRecorder>,
}

impl CommitTracker {
    pub fn new(
        commit_timeout: Duration,
        retry_delay: Duration,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            drain_lock: tokio::sync::Mutex::new(()),
            commit_timeout,
            retry_delay,
            metrics,
        }
    }

    /// Queue a commit for the next drain
    pub fn enqueue(&self, commit: PendingCommit) {
        debug!(
            partition = %commit.partition_key,
            offset = commit.offset_to_commit,
            record_id = %commit.record_id,
            success = commit.is_processing_success,
            "Commit queued"
        );
        // The tracker owns the receiver, so the channel is never disconnected here
        let _ = self.tx.send(commit);
    }

    /// A producer side of the queue for code that outlives a borrow of the tracker
    pub fn sender(&self) -> Sender<PendingCommit> {
        self.tx.clone()
    }

    /// Commits waiting for the next drain
    pub fn pending_count(&self) -> usize {
        self.rx.len()
    }

    /// Commit everything queued so far, in dequeue order.
    ///
    /// A retryable commit failure is retried once after the retry delay; after
    /// that, or on a non-retryable failure, the commit is abandoned and logged
    /// at the error's severity. The broker redelivers the message later.
    pub async fn drain<C>(&self, handle: &C) -> DrainStats
    where
        C: ConsumerHandle + ?Sized,
    {
        let _drain = self.drain_lock.lock().await;
        let mut stats = DrainStats::default();

        loop {
            let commit = match self.rx.try_recv() {
                Ok(commit) => commit,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };

            if self.commit_with_retry(handle, &commit).await {
                stats.committed += 1;
            } else {
                stats.abandoned += 1;
            }
        }

        if stats.committed + stats.abandoned > 0 {
            debug!(
                "Drained commit queue: {} committed, {} abandoned",
                stats.committed, stats.abandoned
            );
        }
        stats
    }

    async fn commit_with_retry<C>(&self, handle: &C, commit: &PendingCommit) -> bool
    where
        C: ConsumerHandle + ?Sized,
    {
        let offsets = [(commit.partition_key.clone(), commit.offset_to_commit)];

        for attempt in 1..=2 {
            let start = Instant::now();
            match handle.commit_sync(&offsets, self.commit_timeout) {
                Ok(()) => {
                    self.metrics.record_commit(start.elapsed());
                    return true;
                }
                Err(e) if attempt == 1 && e.is_retryable() => {
                    debug!(
                        partition = %commit.partition_key,
                        offset = commit.offset_to_commit,
                        "Commit failed, retrying in {:?}: {}",
                        self.retry_delay,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    match e.severity() {
                        ErrorSeverity::Warning => warn!(
                            partition = %commit.partition_key,
                            offset = commit.offset_to_commit,
                            record_id = %commit.record_id,
                            "Abandoning offset commit, message may be redelivered: {}",
                            e
                        ),
                        ErrorSeverity::Error | ErrorSeverity::Fatal => error!(
                            partition = %commit.partition_key,
                            offset = commit.offset_to_commit,
                            record_id = %commit.record_id,
                            "Abandoning offset commit, message may be redelivered: {}",
                            e
                        ),
                    }
                    break;
                }
            }
        }

        self.metrics.record_commit_failure();
        false
    }
}
