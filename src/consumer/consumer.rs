//! The resilient consumer: wires retry, DLQ, commits and shutdown together

use crate::consumer::{
    commit_tracker::{CommitTracker, DrainStats, PendingCommit},
    config::ConsumerConfig,
    dlq::{DeadLetterSink, DlqFallback, DlqPublisher, FailureContext, LogAndGiveUp},
    error::{ConsumerError, ConsumerResult, ErrorKind},
    executor::{panic_message, ProcessingExecutor, TaskError},
    handle::{ConsumerHandle, TopicPartition},
    metrics::{MetricsRecorder, NoopMetrics},
    partition::{PartitionGuard, PartitionLocks},
    processor::{Delivery, FailureDisposition, MessageProcessor, ProcessingResult},
    retry::RetryExecutor,
    shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownState},
};

use futures::FutureExt;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// What a processing task hands to its completion callback: the partition turn
/// it still holds, and either the commit to enqueue or a panic message.
type Settled = (PartitionGuard, Result<Option<PendingCommit>, String>);

/// Partition-ordered consumer core.
///
/// The broker client's polling task calls [`receive`](Self::receive) for every
/// message. Processing runs on the [`ProcessingExecutor`]; offsets are only ever
/// committed from the polling task (at the start of each `receive`) or from
/// [`shutdown`](Self::shutdown).
pub struct ResilientConsumer<P: MessageProcessor, C: ConsumerHandle> {
    config: Arc<ConsumerConfig>,
    processor: Arc<P>,
    retry: Arc<RetryExecutor>,
    dlq: Arc<DeadLetterSink<P::Message>>,
    executor: ProcessingExecutor,
    partitions: PartitionLocks,
    commits: Arc<CommitTracker>,
    shutdown: Arc<ShutdownState>,
    coordinator: ShutdownCoordinator,
    /// Client that delivered the most recent message, used by shutdown
    last_handle: Mutex<Option<Arc<C>>>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<P: MessageProcessor, C: ConsumerHandle> ResilientConsumer<P, C> {
    /// Start building a consumer
    pub fn builder(
        config: ConsumerConfig,
        processor: Arc<P>,
        publisher: Arc<dyn DlqPublisher<P::Message>>,
    ) -> ResilientConsumerBuilder<P, C> {
        ResilientConsumerBuilder {
            config,
            processor,
            publisher,
            fallback: Arc::new(LogAndGiveUp),
            metrics: Arc::new(NoopMetrics),
            _handle: PhantomData,
        }
    }

    /// Handle one message delivered by the polling task.
    ///
    /// Returns as soon as processing has been submitted; it never waits for the
    /// message to be processed and never fails.
    pub async fn receive(
        &self,
        key: Option<Vec<u8>>,
        message: P::Message,
        handle: Arc<C>,
        partition: TopicPartition,
        offset: i64,
    ) {
        *self.last_handle.lock() = Some(handle.clone());
        self.metrics.record_consumed();

        self.commits.drain(handle.as_ref()).await;

        if self.shutdown.is_shutting_down() {
            if let Err(e) = handle.pause(std::slice::from_ref(&partition)) {
                warn!(partition = %partition, "Failed to pause partition during shutdown: {}", e);
            }
            self.metrics.record_skipped_on_shutdown();
            debug!(
                partition = %partition,
                offset,
                "Shutting down, message left for redelivery"
            );
            return;
        }

        let record_id = self
            .processor
            .record_id(&message)
            .unwrap_or_else(|| format!("{}@{}", partition, offset));
        let delivery = Arc::new(Delivery::new(key, message, partition, offset, record_id));

        // Turns are reserved here, on the polling task, so they follow delivery order
        let turn = self.partitions.acquire(&delivery.partition);
        let task_id = self.shutdown.track(&delivery.partition, offset);

        let task = {
            let processor = self.processor.clone();
            let retry = self.retry.clone();
            let dlq = self.dlq.clone();
            let shutdown = self.shutdown.clone();
            let metrics = self.metrics.clone();
            let delivery = delivery.clone();

            self.executor
                .submit_after(turn.wait(), move |guard| async move {
                    if shutdown.is_shutting_down() {
                        metrics.record_skipped_on_shutdown();
                        debug!(
                            partition = %delivery.partition,
                            offset = delivery.offset,
                            "Shutdown began before message started, leaving for redelivery"
                        );
                        return (guard, Ok(None));
                    }

                    let span = info_span!(
                        "process_message",
                        partition = %delivery.partition,
                        offset = delivery.offset,
                        record_id = %delivery.record_id,
                    );
                    let settled = AssertUnwindSafe(
                        settle(
                            processor.as_ref(),
                            &retry,
                            &dlq,
                            metrics.as_ref(),
                            &delivery,
                        )
                        .instrument(span),
                    )
                    .catch_unwind()
                    .await
                    .map_err(panic_message);

                    (guard, settled)
                })
        };

        let commits = self.commits.clone();
        let dlq = self.dlq.clone();
        let shutdown = self.shutdown.clone();
        let metrics = self.metrics.clone();

        self.executor
            .on_complete(task, move |outcome: Result<Settled, TaskError>| async move {
                match outcome {
                    Ok((_guard, Ok(Some(commit)))) => commits.enqueue(commit),
                    Ok((_guard, Ok(None))) => {}
                    Ok((_guard, Err(panic))) => {
                        if let Some(commit) =
                            route_unexpected(&dlq, metrics.as_ref(), &delivery, panic).await
                        {
                            commits.enqueue(commit);
                        }
                    }
                    Err(TaskError::Panicked(panic)) => {
                        if let Some(commit) =
                            route_unexpected(&dlq, metrics.as_ref(), &delivery, panic).await
                        {
                            commits.enqueue(commit);
                        }
                    }
                    Err(TaskError::Cancelled) => {
                        warn!(
                            partition = %delivery.partition,
                            offset = delivery.offset,
                            "Processing task cancelled, message left for redelivery"
                        );
                    }
                }
                shutdown.complete(task_id);
            });
    }

    /// Commit whatever completed since the last receive, using the last-seen
    /// client. Meant for the polling task when the broker is idle.
    pub async fn drain_commits(&self) -> DrainStats {
        let handle = self.last_handle.lock().clone();
        match handle {
            Some(handle) => self.commits.drain(handle.as_ref()).await,
            None => DrainStats::default(),
        }
    }

    /// Graceful shutdown: pause, drain in-flight work up to the shutdown
    /// timeout, flush commits, then cancel anything still running.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn shutdown(&self) -> ShutdownReport {
        let handle = self.last_handle.lock().clone();
        let report = self
            .coordinator
            .shutdown(handle.as_deref(), &self.commits)
            .await;

        if !report.already_requested {
            self.executor.shutdown_now();
            info!(
                timed_out = report.timed_out,
                inflight_remaining = report.inflight_remaining,
                commits_flushed = report.commits_flushed,
                "Consumer shut down"
            );
        }
        report
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Messages submitted but not yet completed
    pub fn inflight_count(&self) -> usize {
        self.shutdown.inflight_count()
    }

    /// Commits waiting for the next drain
    pub fn pending_commits(&self) -> usize {
        self.commits.pending_count()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }
}

/// Run the retry engine and turn its terminal outcome into an optional commit.
///
/// A commit is produced only when processing succeeded or the message reached
/// durable storage (DLQ or fallback hook).
async fn settle<P: MessageProcessor>(
    processor: &P,
    retry: &RetryExecutor,
    dlq: &DeadLetterSink<P::Message>,
    metrics: &dyn MetricsRecorder,
    delivery: &Delivery<P::Message>,
) -> Option<PendingCommit> {
    let (retry_count, last_error, disposition, already_published) =
        match retry.execute(processor, delivery, dlq).await {
            ProcessingResult::Success => {
                metrics.record_processed(delivery.received_at.elapsed());
                return Some(PendingCommit::for_delivery(delivery, true));
            }
            ProcessingResult::Failed {
                already_published_to_dlq,
                retry_count,
                last_error,
                disposition,
            } => (retry_count, last_error, disposition, already_published_to_dlq),
        };

    match disposition {
        FailureDisposition::Interrupted => None,
        FailureDisposition::DlqAttempted => {
            metrics.record_failed();
            if already_published {
                Some(PendingCommit::for_delivery(delivery, false))
            } else {
                warn!(
                    partition = %delivery.partition,
                    offset = delivery.offset,
                    record_id = %delivery.record_id,
                    "DLQ unavailable, message left uncommitted"
                );
                None
            }
        }
        FailureDisposition::RetriesExhausted => {
            metrics.record_failed();
            let (kind, message) = match last_error {
                Some(e) => (e.kind(), e.to_string()),
                None => (ErrorKind::Unclassified, "retries exhausted".to_string()),
            };
            let failure = FailureContext::from_delivery(delivery, kind, message, retry_count);
            if dlq.publish(&delivery.message, &failure).await {
                Some(PendingCommit::for_delivery(delivery, false))
            } else {
                warn!(
                    partition = %delivery.partition,
                    offset = delivery.offset,
                    record_id = %delivery.record_id,
                    "DLQ unavailable after retries exhausted, message left uncommitted"
                );
                None
            }
        }
    }
}

/// Unexpected-failure path for a processing task that panicked
async fn route_unexpected<M: Send + Sync + 'static>(
    dlq: &DeadLetterSink<M>,
    metrics: &dyn MetricsRecorder,
    delivery: &Delivery<M>,
    panic: String,
) -> Option<PendingCommit> {
    error!(
        partition = %delivery.partition,
        offset = delivery.offset,
        record_id = %delivery.record_id,
        "Processing task failed unexpectedly: {}",
        panic
    );
    metrics.record_error(ErrorKind::Unexpected);
    metrics.record_failed();

    let failure = FailureContext::from_delivery(delivery, ErrorKind::Unexpected, panic, 0);
    dlq.publish(&delivery.message, &failure)
        .await
        .then(|| PendingCommit::for_delivery(delivery, false))
}

/// Builder for [`ResilientConsumer`]
pub struct ResilientConsumerBuilder<P: MessageProcessor, C> {
    config: ConsumerConfig,
    processor: Arc<P>,
    publisher: Arc<dyn DlqPublisher<P::Message>>,
    fallback: Arc<dyn DlqFallback<P::Message>>,
    metrics: Arc<dyn MetricsRecorder>,
    _handle: PhantomData<fn() -> C>,
}

impl<P: MessageProcessor, C: ConsumerHandle> ResilientConsumerBuilder<P, C> {
    /// Hook called once DLQ publishing is exhausted (requires `enable_dlq_fallback`)
    pub fn fallback(mut self, fallback: Arc<dyn DlqFallback<P::Message>>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Metrics sink
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the configuration and assemble the consumer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> ConsumerResult<ResilientConsumer<P, C>> {
        self.config.validate().map_err(ConsumerError::ConfigError)?;

        let config = Arc::new(self.config);
        let executor = ProcessingExecutor::new(config.max_concurrent_tasks)?;
        let shutdown = Arc::new(ShutdownState::new());

        let retry = Arc::new(RetryExecutor::new(
            config.retry_policy(),
            shutdown.clone(),
            self.metrics.clone(),
        ));
        let dlq = Arc::new(DeadLetterSink::new(
            self.publisher,
            self.fallback,
            config.dlq_retry_policy(),
            config.enable_dlq_fallback,
            self.metrics.clone(),
        ));
        let commits = Arc::new(CommitTracker::new(
            config.commit_timeout(),
            config.commit_retry_delay(),
            self.metrics.clone(),
        ));
        let coordinator = ShutdownCoordinator::new(shutdown.clone(), config.shutdown_timeout());

        info!(
            processor = self.processor.name(),
            max_retries = config.max_retries,
            dlq_max_retries = config.dlq_max_retries,
            max_concurrent_tasks = config.max_concurrent_tasks,
            "Resilient consumer created"
        );

        Ok(ResilientConsumer {
            config,
            processor: self.processor,
            retry,
            dlq,
            executor,
            partitions: PartitionLocks::new(),
            commits,
            shutdown,
            coordinator,
            last_handle: Mutex::new(None),
            metrics: self.metrics,
        })
    }
}
