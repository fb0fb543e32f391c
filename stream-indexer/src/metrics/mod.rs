//! Pipeline counters and the periodic progress log.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Counters shared by every pipeline task.
#[derive(Debug, Default)]
pub struct IndexerMetrics {
    records_read: AtomicU64,
    decoded: AtomicU64,
    decode_failures: AtomicU64,
    batches_submitted: AtomicU64,
    accepted: AtomicU64,
    retried: AtomicU64,
    retry_exhausted: AtomicU64,
    terminal_failures: AtomicU64,
    superseded: AtomicU64,
    transport_errors: AtomicU64,
    dead_lettered: AtomicU64,
    checkpoint_lag: AtomicU64,
}

/// Point-in-time copy of [`IndexerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_read: u64,
    pub decoded: u64,
    pub decode_failures: u64,
    pub batches_submitted: u64,
    pub accepted: u64,
    pub retried: u64,
    pub retry_exhausted: u64,
    pub terminal_failures: u64,
    pub superseded: u64,
    pub transport_errors: u64,
    pub dead_lettered: u64,
    /// Offsets read but not yet checkpointed, summed over partitions.
    pub checkpoint_lag: u64,
}

impl IndexerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_read(&self) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_submitted(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self, count: u64) {
        self.accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_exhausted(&self) {
        self.retry_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal_failure(&self) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_checkpoint_lag(&self, lag: u64) {
        self.checkpoint_lag.store(lag, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            retry_exhausted: self.retry_exhausted.load(Ordering::Relaxed),
            terminal_failures: self.terminal_failures.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            checkpoint_lag: self.checkpoint_lag.load(Ordering::Relaxed),
        }
    }
}

/// Per-second rate of change of a counter between two snapshots.
fn rate(current: u64, previous: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        (current.saturating_sub(previous) as f64) / elapsed_secs
    } else {
        0.0
    }
}

/// Log totals and throughput every `every` until `shutdown` is cancelled.
#[instrument(skip(metrics, shutdown))]
pub async fn run_progress_reporter(
    metrics: Arc<IndexerMetrics>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut progress_timer = interval(every);
    progress_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    progress_timer.tick().await;

    let mut previous = metrics.snapshot();
    let mut previous_time = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = progress_timer.tick() => {
                let current = metrics.snapshot();
                let now = Instant::now();
                let elapsed_secs = now.duration_since(previous_time).as_secs_f64();

                info!(
                    records_read = current.records_read,
                    accepted = current.accepted,
                    retried = current.retried,
                    terminal_failures = current.terminal_failures,
                    decode_failures = current.decode_failures,
                    checkpoint_lag = current.checkpoint_lag,
                    records_per_sec = format!("{:.2}", rate(current.records_read, previous.records_read, elapsed_secs)),
                    accepted_per_sec = format!("{:.2}", rate(current.accepted, previous.accepted, elapsed_secs)),
                    "Processing progress"
                );

                previous = current;
                previous_time = now;
            }
        }
    }

    let totals = metrics.snapshot();
    info!(
        records_read = totals.records_read,
        accepted = totals.accepted,
        terminal_failures = totals.terminal_failures,
        dead_lettered = totals.dead_lettered,
        "Progress reporter stopped"
    );
}
