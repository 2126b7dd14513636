//! In-memory doubles shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use resilient_consumer::consumer::{
    ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerMetrics, ConsumerResult, DlqFallback,
    DlqPublisher, FailureContext, MessageProcessor, ProcessingError, ResilientConsumer,
    TopicPartition,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "people";

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(TOPIC, partition)
}

/// Broker client double recording pauses and commits
#[derive(Default)]
pub struct RecordingHandle {
    pub assigned: Mutex<Vec<TopicPartition>>,
    pub paused: Mutex<Vec<TopicPartition>>,
    pub committed: Mutex<Vec<(TopicPartition, i64)>>,
    pub commit_failures_left: AtomicU32,
}

impl RecordingHandle {
    pub fn with_assignment(partitions: &[i32]) -> Arc<Self> {
        let handle = Self::default();
        *handle.assigned.lock() = partitions.iter().map(|p| tp(*p)).collect();
        Arc::new(handle)
    }

    pub fn committed(&self) -> Vec<(TopicPartition, i64)> {
        self.committed.lock().clone()
    }
}

impl ConsumerHandle for RecordingHandle {
    fn pause(&self, partitions: &[TopicPartition]) -> ConsumerResult<()> {
        self.paused.lock().extend_from_slice(partitions);
        Ok(())
    }

    fn assignment(&self) -> ConsumerResult<Vec<TopicPartition>> {
        Ok(self.assigned.lock().clone())
    }

    fn commit_sync(&self, offsets: &[(TopicPartition, i64)], _timeout: Duration) -> ConsumerResult<()> {
        let left = self.commit_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.commit_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ConsumerError::CommitError("rebalance in progress".into()));
        }
        self.committed.lock().extend_from_slice(offsets);
        Ok(())
    }
}

/// DLQ double; fails every publish while `failing` is set
#[derive(Default)]
pub struct RecordingDlq {
    pub attempts: AtomicU32,
    pub failing: bool,
    pub published: Mutex<Vec<(String, FailureContext)>>,
}

impl RecordingDlq {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DlqPublisher<String> for RecordingDlq {
    async fn publish(&self, message: &String, failure: &FailureContext) -> ConsumerResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(ConsumerError::DlqError("dlq topic unavailable".into()));
        }
        self.published.lock().push((message.clone(), failure.clone()));
        Ok(())
    }
}

/// Fallback that claims to have stored the message
#[derive(Default)]
pub struct StashFallback {
    pub calls: AtomicU32,
}

#[async_trait]
impl DlqFallback<String> for StashFallback {
    async fn on_dlq_exhausted(&self, _message: &String, _failure: &FailureContext) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Processor driven by the message text:
///
/// - `ok`: succeeds
/// - `invalid` / `permanent`: non-retryable failure
/// - `transient`: always fails transiently
/// - `flaky:N`: fails transiently N times, then succeeds
/// - `slow:MS`: sleeps MS milliseconds, then succeeds
/// - `hang`: sleeps for an hour
/// - `panic`: panics
///
/// An optional `#tag` suffix makes otherwise identical messages distinct.
#[derive(Default)]
pub struct ScriptedProcessor {
    pub calls: Mutex<HashMap<String, u32>>,
    pub events: Mutex<Vec<String>>,
}

impl ScriptedProcessor {
    pub fn calls(&self, message: &str) -> u32 {
        self.calls.lock().get(message).copied().unwrap_or(0)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl MessageProcessor for ScriptedProcessor {
    type Message = String;

    async fn process(&self, message: &String) -> Result<(), ProcessingError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(message.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.events.lock().push(format!("start {}", message));

        let script = message.split('#').next().unwrap_or_default();
        let (verb, arg) = script.split_once(':').unwrap_or((script, "0"));
        let arg: u64 = arg.parse().unwrap_or(0);

        let outcome = match verb {
            "ok" => Ok(()),
            "invalid" => Err(ProcessingError::validation("recordId blank")),
            "permanent" => Err(ProcessingError::permanent("unknown homeworld")),
            "transient" => Err(ProcessingError::transient("connection reset")),
            "flaky" if u64::from(call) <= arg => {
                Err(ProcessingError::transient("connection reset"))
            }
            "flaky" => Ok(()),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(arg)).await;
                Ok(())
            }
            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            "panic" => panic!("processor bug"),
            other => Err(ProcessingError::Other(anyhow::anyhow!("unknown script {}", other))),
        };

        self.events.lock().push(format!("end {}", message));
        outcome
    }
}

pub type TestConsumer = ResilientConsumer<ScriptedProcessor, RecordingHandle>;

/// Defaults with short delays: retries at 100ms, 200ms, 400ms; DLQ retries at 10ms steps
pub fn fast_config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .max_retries(3)
        .initial_retry_delay(Duration::from_millis(100))
        .max_retry_delay(Duration::from_secs(1))
        .retry_backoff_multiplier(2.0)
        .dlq_max_retries(3)
        .shutdown_timeout(Duration::from_secs(5))
        .commit_retry_delay(Duration::from_millis(10))
        .build()
}

pub struct Harness {
    pub consumer: TestConsumer,
    pub processor: Arc<ScriptedProcessor>,
    pub dlq: Arc<RecordingDlq>,
    pub metrics: Arc<ConsumerMetrics>,
}

impl Harness {
    pub fn new(config: ConsumerConfig) -> Self {
        Self::with_dlq(config, Arc::new(RecordingDlq::default()))
    }

    pub fn with_dlq(config: ConsumerConfig, dlq: Arc<RecordingDlq>) -> Self {
        Self::build(config, dlq, None)
    }

    pub fn build(
        config: ConsumerConfig,
        dlq: Arc<RecordingDlq>,
        fallback: Option<Arc<dyn DlqFallback<String>>>,
    ) -> Self {
        let processor = Arc::new(ScriptedProcessor::default());
        let metrics = Arc::new(ConsumerMetrics::new());
        let mut builder = TestConsumer::builder(config, processor.clone(), dlq.clone())
            .metrics(metrics.clone());
        if let Some(fallback) = fallback {
            builder = builder.fallback(fallback);
        }
        Self {
            consumer: builder.build().expect("valid test config"),
            processor,
            dlq,
            metrics,
        }
    }

    pub async fn send(&self, handle: &Arc<RecordingHandle>, partition: i32, offset: i64, message: &str) {
        self.consumer
            .receive(None, message.to_string(), handle.clone(), tp(partition), offset)
            .await;
    }

    /// Wait until every submitted message has completed
    pub async fn settle(&self) {
        for _ in 0..100_000 {
            if self.consumer.inflight_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("{} tasks still in flight", self.consumer.inflight_count());
    }
}
