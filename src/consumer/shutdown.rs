//! Graceful shutdown management for the consumer

use crate::consumer::commit_tracker::CommitTracker;
use crate::consumer::handle::{ConsumerHandle, TopicPartition};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A processing task that has been submitted but not completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTask {
    pub partition: TopicPartition,
    pub offset: i64,
    pub started: Instant,
}

/// Shared shutdown flag plus the set of in-flight processing tasks
#[derive(Debug)]
pub struct ShutdownState {
    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
    /// Wakes retry sleeps as soon as the flag flips
    notify: watch::Sender<bool>,
    /// Shutdown initiated timestamp
    shutdown_start: Mutex<Option<Instant>>,
    inflight: DashMap<u64, InFlightTask>,
    /// Signalled whenever the in-flight set becomes empty
    drained: Notify,
    next_task_id: AtomicU64,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            shutting_down: AtomicBool::new(false),
            notify,
            shutdown_start: Mutex::new(None),
            inflight: DashMap::new(),
            drained: Notify::new(),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Flip the shutdown flag. Returns `true` only for the call that flipped it.
    pub fn begin_shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.shutdown_start.lock() = Some(Instant::now());
        self.notify.send_replace(true);
        info!("Shutdown initiated");
        true
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has begun
    pub async fn cancelled(&self) {
        let mut rx = self.notify.subscribe();
        // The sender lives as long as `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|flag| *flag).await;
    }

    /// Get the duration since shutdown started
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.lock().map(|start| start.elapsed())
    }

    /// Register an in-flight task and return its id
    pub fn track(&self, partition: &TopicPartition, offset: i64) -> u64 {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.inflight.insert(
            id,
            InFlightTask {
                partition: partition.clone(),
                offset,
                started: Instant::now(),
            },
        );
        debug!("In-flight messages: {}", self.inflight.len());
        id
    }

    /// Remove a finished task
    pub fn complete(&self, id: u64) {
        if self.inflight.remove(&id).is_some() {
            debug!("In-flight messages: {}", self.inflight.len());
            if self.inflight.is_empty() {
                self.drained.notify_waiters();
            }
        }
    }

    /// Get the count of in-flight messages
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Copy of the in-flight set, oldest first
    pub fn inflight_snapshot(&self) -> Vec<InFlightTask> {
        let mut tasks: Vec<InFlightTask> = self
            .inflight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.started);
        tasks
    }

    /// Wait until no task is in flight. Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_inflight(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                // Register before checking so a completion in between is not missed
                notified.as_mut().enable();
                if self.inflight.is_empty() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`ShutdownCoordinator::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Shutdown had already been requested; nothing was done
    pub already_requested: bool,
    /// Partitions paused on the last-seen client
    pub partitions_paused: usize,
    /// Tasks still running when the drain gave up
    pub inflight_remaining: usize,
    /// The in-flight wait hit the timeout
    pub timed_out: bool,
    /// Commits flushed by the final drain
    pub commits_flushed: usize,
    pub elapsed: Duration,
}

/// Graceful shutdown coordinator.
///
/// Runs the shutdown sequence: flip the flag, pause the current assignment,
/// wait for in-flight tasks up to the timeout, then flush the commit queue one
/// last time. No phase returns an error; failures are logged and the sequence
/// moves on.
pub struct ShutdownCoordinator {
    /// Shutdown state
    state: Arc<ShutdownState>,
    /// Timeout for graceful shutdown
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(state: Arc<ShutdownState>, timeout: Duration) -> Self {
        Self { state, timeout }
    }

    pub fn state(&self) -> &Arc<ShutdownState> {
        &self.state
    }

    /// Execute graceful shutdown. Calls after the first are no-ops.
    pub async fn shutdown<C>(&self, handle: Option<&C>, commits: &CommitTracker) -> ShutdownReport
    where
        C: ConsumerHandle + ?Sized,
    {
        if !self.state.begin_shutdown() {
            debug!("Shutdown already requested");
            return ShutdownReport {
                already_requested: true,
                ..ShutdownReport::default()
            };
        }

        let start = Instant::now();
        let mut report = ShutdownReport::default();

        match handle {
            Some(handle) => match handle.assignment() {
                Ok(assignment) if assignment.is_empty() => {}
                Ok(assignment) => match handle.pause(&assignment) {
                    Ok(()) => {
                        report.partitions_paused = assignment.len();
                        info!("Paused {} partitions", assignment.len());
                    }
                    Err(e) => warn!("Failed to pause partitions during shutdown: {}", e),
                },
                Err(e) => warn!("Failed to read assignment during shutdown: {}", e),
            },
            None => debug!("No consumer handle recorded, skipping pause"),
        }

        if !self.state.wait_for_inflight(self.timeout).await {
            report.timed_out = true;
            report.inflight_remaining = self.state.inflight_count();
            for task in self.state.inflight_snapshot() {
                warn!(
                    partition = %task.partition,
                    offset = task.offset,
                    "Task still in flight at shutdown deadline, leaving for redelivery"
                );
            }
            warn!(
                "Shutdown timeout with {} messages still in flight",
                report.inflight_remaining
            );
        }

        match handle {
            Some(handle) => {
                report.commits_flushed = commits.drain(handle).await.committed;
            }
            None if commits.pending_count() > 0 => {
                warn!(
                    "{} commits pending but no consumer handle to flush them",
                    commits.pending_count()
                );
            }
            None => {}
        }

        report.elapsed = start.elapsed();
        info!("Shutdown completed in {:?}", report.elapsed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::commit_tracker::PendingCommit;
    use crate::consumer::error::{ConsumerError, ConsumerResult};
    use crate::consumer::metrics::NoopMetrics;

    #[derive(Default)]
    struct FakeHandle {
        paused: Mutex<Vec<TopicPartition>>,
        committed: Mutex<Vec<(TopicPartition, i64)>>,
        fail_pause: bool,
    }

    impl ConsumerHandle for FakeHandle {
        fn pause(&self, partitions: &[TopicPartition]) -> ConsumerResult<()> {
            if self.fail_pause {
                return Err(ConsumerError::ClientError("not assigned".into()));
            }
            self.paused.lock().extend_from_slice(partitions);
            Ok(())
        }

        fn assignment(&self) -> ConsumerResult<Vec<TopicPartition>> {
            Ok(vec![TopicPartition::new("people", 0), TopicPartition::new("people", 1)])
        }

        fn commit_sync(&self, offsets: &[(TopicPartition, i64)], _timeout: Duration) -> ConsumerResult<()> {
            self.committed.lock().extend_from_slice(offsets);
            Ok(())
        }
    }

    fn tracker() -> CommitTracker {
        CommitTracker::new(
            Duration::from_secs(5),
            Duration::from_millis(100),
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn test_shutdown_state() {
        let state = ShutdownState::new();

        assert!(!state.is_shutting_down());
        assert!(state.begin_shutdown());
        assert!(state.is_shutting_down());
        assert!(!state.begin_shutdown());
        assert!(state.shutdown_duration().is_some());
    }

    #[tokio::test]
    async fn test_inflight_tracking() {
        let state = ShutdownState::new();
        let tp = TopicPartition::new("people", 3);

        let first = state.track(&tp, 10);
        let second = state.track(&tp, 11);
        assert_ne!(first, second);
        assert_eq!(state.inflight_count(), 2);
        assert_eq!(state.inflight_snapshot()[0].offset, 10);

        state.complete(first);
        state.complete(first);
        assert_eq!(state.inflight_count(), 1);

        state.complete(second);
        assert!(state.wait_for_inflight(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_last_completion() {
        let state = Arc::new(ShutdownState::new());
        let tp = TopicPartition::new("people", 0);
        let first = state.track(&tp, 1);
        let second = state.track(&tp, 2);

        let finisher = {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(3)).await;
                state.complete(first);
                tokio::time::sleep(Duration::from_millis(4)).await;
                state.complete(second);
            })
        };

        let start = Instant::now();
        assert!(state.wait_for_inflight(Duration::from_secs(10)).await);
        finisher.await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_accepts_unbounded_timeout() {
        let state = Arc::new(ShutdownState::new());
        assert!(state.wait_for_inflight(Duration::MAX).await);

        let id = state.track(&TopicPartition::new("people", 0), 9);
        let finisher = {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                state.complete(id);
            })
        };

        let coordinator = ShutdownCoordinator::new(state, Duration::MAX);
        let report = coordinator.shutdown::<FakeHandle>(None, &tracker()).await;
        finisher.await.unwrap();

        assert!(!report.timed_out);
        assert_eq!(report.inflight_remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wakes_waiters() {
        let state = Arc::new(ShutdownState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        state.begin_shutdown();
        waiter.await.unwrap();

        // Already-set flag resolves immediately
        state.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_coordinator() {
        let state = Arc::new(ShutdownState::new());
        let coordinator = ShutdownCoordinator::new(state.clone(), Duration::from_secs(1));
        let commits = tracker();
        let handle = FakeHandle::default();

        let id = state.track(&TopicPartition::new("people", 0), 4);
        let finisher = {
            let state = state.clone();
            let sender = commits.sender();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                sender
                    .send(PendingCommit {
                        partition_key: TopicPartition::new("people", 0),
                        offset_to_commit: 5,
                        record_id: "rec-4".into(),
                        is_processing_success: true,
                    })
                    .unwrap();
                state.complete(id);
            })
        };

        let report = coordinator.shutdown(Some(&handle), &commits).await;
        finisher.await.unwrap();

        assert!(!report.timed_out);
        assert_eq!(report.partitions_paused, 2);
        assert_eq!(report.commits_flushed, 1);
        assert_eq!(handle.paused.lock().len(), 2);
        assert_eq!(
            handle.committed.lock().as_slice(),
            &[(TopicPartition::new("people", 0), 5)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_is_not_fatal() {
        let state = Arc::new(ShutdownState::new());
        let coordinator = ShutdownCoordinator::new(state.clone(), Duration::from_secs(5));
        let commits = tracker();
        let handle = FakeHandle {
            fail_pause: true,
            ..FakeHandle::default()
        };

        state.track(&TopicPartition::new("people", 0), 1);
        state.track(&TopicPartition::new("people", 1), 1);

        let start = Instant::now();
        let report = coordinator.shutdown(Some(&handle), &commits).await;

        assert!(report.timed_out);
        assert_eq!(report.inflight_remaining, 2);
        assert_eq!(report.partitions_paused, 0);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(5100));
    }

    #[tokio::test]
    async fn test_second_shutdown_is_noop() {
        let state = Arc::new(ShutdownState::new());
        let coordinator = ShutdownCoordinator::new(state, Duration::from_secs(1));
        let commits = tracker();

        let first = coordinator.shutdown::<FakeHandle>(None, &commits).await;
        let second = coordinator.shutdown::<FakeHandle>(None, &commits).await;

        assert!(!first.already_requested);
        assert!(second.already_requested);
    }
}
