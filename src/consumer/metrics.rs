//! Consumer metrics collection

use crate::consumer::error::ErrorKind;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of duration samples kept per histogram
const MAX_SAMPLES: usize = 1000;

/// Counters the consumer core reports to an external metrics collector
pub trait MetricsRecorder: Send + Sync + 'static {
    /// A message was handed to the consumer
    fn record_consumed(&self);
    /// A message was processed successfully
    fn record_processed(&self, duration: Duration);
    /// A message reached a terminal failure
    fn record_failed(&self);
    /// A retry was scheduled
    fn record_retry(&self);
    /// The processor raised an error of the given kind
    fn record_error(&self, kind: ErrorKind);
    fn record_dlq_published(&self);
    /// DLQ publishing was exhausted
    fn record_dlq_failure(&self);
    fn record_dlq_fallback(&self);
    /// An offset commit succeeded
    fn record_commit(&self, duration: Duration);
    /// An offset commit was abandoned
    fn record_commit_failure(&self);
    /// A message arrived after shutdown began and was not processed
    fn record_skipped_on_shutdown(&self);
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_consumed(&self) {}
    fn record_processed(&self, _duration: Duration) {}
    fn record_failed(&self) {}
    fn record_retry(&self) {}
    fn record_error(&self, _kind: ErrorKind) {}
    fn record_dlq_published(&self) {}
    fn record_dlq_failure(&self) {}
    fn record_dlq_fallback(&self) {}
    fn record_commit(&self, _duration: Duration) {}
    fn record_commit_failure(&self) {}
    fn record_skipped_on_shutdown(&self) {}
}

/// In-process metrics collector
#[derive(Debug)]
pub struct ConsumerMetrics {
    messages_consumed: AtomicU64,
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    retries: AtomicU64,
    dlq_published: AtomicU64,
    dlq_failures: AtomicU64,
    dlq_fallbacks: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    skipped_on_shutdown: AtomicU64,
    /// Error counts by kind
    error_counts: RwLock<BTreeMap<ErrorKind, u64>>,
    processing_durations: RwLock<VecDeque<Duration>>,
    commit_durations: RwLock<VecDeque<Duration>>,
    start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub consumed: u64,
    pub processed: u64,
    pub failed: u64,
    pub retries: u64,
    pub dlq_published: u64,
    pub dlq_failures: u64,
    pub dlq_fallbacks: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub skipped_on_shutdown: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

/// Latency percentiles over the retained samples
#[derive(Debug, Clone, Default)]
pub struct ProcessingStats {
    pub count: usize,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub mean: Duration,
    samples: Vec<Duration>,
}

impl ProcessingStats {
    /// Samples at or below `bound`
    pub fn count_le(&self, bound: Duration) -> usize {
        self.samples.iter().filter(|d| **d <= bound).count()
    }

    /// Sum of all samples
    pub fn sum(&self) -> Duration {
        self.samples.iter().sum()
    }
}

impl ConsumerMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            messages_consumed: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dlq_published: AtomicU64::new(0),
            dlq_failures: AtomicU64::new(0),
            dlq_fallbacks: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            skipped_on_shutdown: AtomicU64::new(0),
            error_counts: RwLock::new(BTreeMap::new()),
            processing_durations: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            commit_durations: RwLock::new(VecDeque::with_capacity(MAX_SAMPLES)),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            consumed: self.messages_consumed.load(Ordering::Relaxed),
            processed: self.messages_processed.load(Ordering::Relaxed),
            failed: self.messages_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dlq_published: self.dlq_published.load(Ordering::Relaxed),
            dlq_failures: self.dlq_failures.load(Ordering::Relaxed),
            dlq_fallbacks: self.dlq_fallbacks.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            skipped_on_shutdown: self.skipped_on_shutdown.load(Ordering::Relaxed),
            errors_by_kind: self.error_counts.read().clone(),
        }
    }

    /// Get processing statistics
    pub fn processing_stats(&self) -> ProcessingStats {
        Self::calculate_stats(&self.processing_durations)
    }

    /// Get commit statistics
    pub fn commit_stats(&self) -> Option<ProcessingStats> {
        let stats = Self::calculate_stats(&self.commit_durations);
        if stats.count > 0 {
            Some(stats)
        } else {
            None
        }
    }

    fn calculate_stats(durations: &RwLock<VecDeque<Duration>>) -> ProcessingStats {
        let mut sorted: Vec<Duration> = durations.read().iter().copied().collect();
        if sorted.is_empty() {
            return ProcessingStats::default();
        }
        sorted.sort();

        let p50_idx = sorted.len() / 2;
        let p95_idx = ((sorted.len() - 1) as f64 * 0.95) as usize;
        let p99_idx = ((sorted.len() - 1) as f64 * 0.99) as usize;
        let total: Duration = sorted.iter().sum();

        ProcessingStats {
            count: sorted.len(),
            p50: sorted[p50_idx],
            p95: sorted[p95_idx],
            p99: sorted[p99_idx],
            mean: total / sorted.len() as u32,
            samples: sorted,
        }
    }

    fn push_sample(durations: &RwLock<VecDeque<Duration>>, duration: Duration) {
        let mut durations = durations.write();
        if durations.len() == MAX_SAMPLES {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    /// Get messages per second
    pub fn messages_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.messages_consumed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get success rate
    pub fn success_rate(&self) -> f64 {
        let total = self.messages_consumed.load(Ordering::Relaxed);
        let processed = self.messages_processed.load(Ordering::Relaxed);

        if total > 0 {
            processed as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str(&format!(
            "# HELP consumer_messages_total Messages seen by the consumer\n\
             # TYPE consumer_messages_total counter\n\
             consumer_messages_total{{status=\"consumed\"}} {}\n\
             consumer_messages_total{{status=\"processed\"}} {}\n\
             consumer_messages_total{{status=\"failed\"}} {}\n\
             consumer_messages_total{{status=\"skipped_on_shutdown\"}} {}\n",
            snapshot.consumed, snapshot.processed, snapshot.failed, snapshot.skipped_on_shutdown,
        ));

        output.push_str(&format!(
            "# HELP consumer_retries_total Processing retries scheduled\n\
             # TYPE consumer_retries_total counter\n\
             consumer_retries_total {}\n",
            snapshot.retries,
        ));

        output.push_str(&format!(
            "# HELP consumer_dlq_total Dead letter queue outcomes\n\
             # TYPE consumer_dlq_total counter\n\
             consumer_dlq_total{{outcome=\"published\"}} {}\n\
             consumer_dlq_total{{outcome=\"failed\"}} {}\n\
             consumer_dlq_total{{outcome=\"fallback\"}} {}\n",
            snapshot.dlq_published, snapshot.dlq_failures, snapshot.dlq_fallbacks,
        ));

        output.push_str(&format!(
            "# HELP consumer_commits_total Offset commit outcomes\n\
             # TYPE consumer_commits_total counter\n\
             consumer_commits_total{{outcome=\"committed\"}} {}\n\
             consumer_commits_total{{outcome=\"abandoned\"}} {}\n",
            snapshot.commits, snapshot.commit_failures,
        ));

        output.push_str("# HELP consumer_errors_by_kind Processor errors by kind\n");
        output.push_str("# TYPE consumer_errors_by_kind counter\n");
        for (kind, count) in snapshot.errors_by_kind.iter() {
            output.push_str(&format!(
                "consumer_errors_by_kind{{kind=\"{}\"}} {}\n",
                kind, count
            ));
        }

        let stats = self.processing_stats();
        output.push_str(&format!(
            "# HELP consumer_processing_duration_seconds Message processing duration\n\
             # TYPE consumer_processing_duration_seconds histogram\n\
             consumer_processing_duration_seconds_bucket{{le=\"0.01\"}} {}\n\
             consumer_processing_duration_seconds_bucket{{le=\"0.1\"}} {}\n\
             consumer_processing_duration_seconds_bucket{{le=\"1.0\"}} {}\n\
             consumer_processing_duration_seconds_bucket{{le=\"10.0\"}} {}\n\
             consumer_processing_duration_seconds_bucket{{le=\"+Inf\"}} {}\n\
             consumer_processing_duration_seconds_sum {}\n\
             consumer_processing_duration_seconds_count {}\n",
            stats.count_le(Duration::from_millis(10)),
            stats.count_le(Duration::from_millis(100)),
            stats.count_le(Duration::from_secs(1)),
            stats.count_le(Duration::from_secs(10)),
            stats.count,
            stats.sum().as_secs_f64(),
            stats.count,
        ));

        if let Some(commit_stats) = self.commit_stats() {
            output.push_str(&format!(
                "# HELP consumer_commit_duration_seconds Offset commit duration\n\
                 # TYPE consumer_commit_duration_seconds histogram\n\
                 consumer_commit_duration_seconds_bucket{{le=\"0.01\"}} {}\n\
                 consumer_commit_duration_seconds_bucket{{le=\"0.1\"}} {}\n\
                 consumer_commit_duration_seconds_bucket{{le=\"1.0\"}} {}\n\
                 consumer_commit_duration_seconds_bucket{{le=\"+Inf\"}} {}\n\
                 consumer_commit_duration_seconds_sum {}\n\
                 consumer_commit_duration_seconds_count {}\n",
                commit_stats.count_le(Duration::from_millis(10)),
                commit_stats.count_le(Duration::from_millis(100)),
                commit_stats.count_le(Duration::from_secs(1)),
                commit_stats.count,
                commit_stats.sum().as_secs_f64(),
                commit_stats.count,
            ));
        }

        output
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder for ConsumerMetrics {
    fn record_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processed(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        Self::push_sample(&self.processing_durations, duration);
    }

    fn record_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, kind: ErrorKind) {
        *self.error_counts.write().entry(kind).or_insert(0) += 1;
    }

    fn record_dlq_published(&self) {
        self.dlq_published.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dlq_failure(&self) {
        self.dlq_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dlq_fallback(&self) {
        self.dlq_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_commit(&self, duration: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Self::push_sample(&self.commit_durations, duration);
    }

    fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_skipped_on_shutdown(&self) {
        self.skipped_on_shutdown.fetch_add(1, Ordering::Relaxed);
    }
}
