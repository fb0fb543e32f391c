//! Bounded retry with exponential backoff.
//!
//! Submission workers hand retryable items to a [`RetryScheduler`]. The
//! coordinator task holds them until their backoff has elapsed and then feeds
//! them back into the accumulator.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use stream_indexer_shared::Mutation;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::accumulator::{BatchEntry, PendingMutation};
use crate::config::{ConfigProvider, IndexerConfig};
use crate::metrics::IndexerMetrics;

/// Ceiling applied when the configured backoff cannot be represented.
const MAX_REPRESENTABLE_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Number of retries after the first submission.
    pub max_attempts: u32,
}

/// What to do with an item that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Submit again after `delay`. `attempt` counts failed submissions so far.
    Retry { attempt: u32, delay: Duration },
    /// Give up.
    Exhausted,
}

impl RetryPolicy {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            base: config.retry_interval,
            multiplier: config.retry_multiplier,
            max_interval: config.retry_max_interval,
            max_attempts: config.max_retry_attempts,
        }
    }

    /// Delay before the retry that follows failure number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let secs = self.base.as_secs_f64() * factor;

        let delay = if secs.is_finite() && secs >= 0.0 && secs < MAX_REPRESENTABLE_DELAY.as_secs_f64()
        {
            Duration::from_secs_f64(secs)
        } else {
            MAX_REPRESENTABLE_DELAY
        };
        delay.min(self.max_interval)
    }

    /// Decide the fate of an item that has failed `failed_before` times
    /// before the failure being handled.
    pub fn next(&self, failed_before: u32) -> RetryDecision {
        let attempt = failed_before.saturating_add(1);
        if attempt > self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                attempt,
                delay: self.backoff(attempt),
            }
        }
    }
}

/// A mutation waiting for its next submission.
#[derive(Debug, Clone)]
pub struct RetryItem {
    pub mutation: Mutation,
    /// Failed submissions so far. Never above the configured ceiling.
    pub attempt: u32,
    /// Earliest time the item may be submitted again.
    pub eligible_at: Instant,
    pub last_reason: String,
}

/// Heap entry ordered so that the earliest eligible item is on top.
#[derive(Debug)]
struct Scheduled {
    eligible_at: Instant,
    sequence: u64,
    item: RetryItem,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at && self.sequence == other.sequence
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .eligible_at
            .cmp(&self.eligible_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Retry items ordered by eligibility. Ties keep insertion order.
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: BinaryHeap<Scheduled>,
    sequence: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: RetryItem) {
        self.sequence += 1;
        self.heap.push(Scheduled {
            eligible_at: item.eligible_at,
            sequence: self.sequence,
            item,
        });
    }

    /// Remove every item eligible at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<RetryItem> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|s| s.eligible_at <= now) {
            if let Some(scheduled) = self.heap.pop() {
                due.push(scheduled.item);
            }
        }
        due
    }

    /// When the earliest item becomes eligible.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.eligible_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// An entry that reached the retry ceiling.
#[derive(Debug)]
pub struct Exhausted {
    pub entry: BatchEntry,
    pub last_reason: String,
}

/// Handle used by submission workers to request a retry.
#[derive(Clone)]
pub struct RetryScheduler {
    tx: mpsc::UnboundedSender<RetryItem>,
    config: Arc<dyn ConfigProvider>,
    metrics: Arc<IndexerMetrics>,
}

impl RetryScheduler {
    pub fn new(
        tx: mpsc::UnboundedSender<RetryItem>,
        config: Arc<dyn ConfigProvider>,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            tx,
            config,
            metrics,
        }
    }

    /// Queue a failed entry for another submission, or hand it back if it
    /// has used up its retries.
    pub fn schedule(&self, entry: BatchEntry, reason: String) -> Result<(), Exhausted> {
        let policy = RetryPolicy::from_config(&self.config.current());
        match policy.next(entry.attempts) {
            RetryDecision::Retry { attempt, delay } => {
                debug!(
                    document_id = %entry.mutation.document_id,
                    partition = entry.mutation.position.partition,
                    offset = entry.mutation.position.offset,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Scheduling retry"
                );
                self.metrics.record_retried();
                let item = RetryItem {
                    mutation: entry.mutation,
                    attempt,
                    eligible_at: Instant::now() + delay,
                    last_reason: reason,
                };
                // Closed only during shutdown; the item is then left unresolved.
                if let Err(mpsc::error::SendError(item)) = self.tx.send(item) {
                    debug!(
                        document_id = %item.mutation.document_id,
                        "Retry coordinator stopped, dropping retry"
                    );
                }
                Ok(())
            }
            RetryDecision::Exhausted => Err(Exhausted {
                entry,
                last_reason: reason,
            }),
        }
    }
}

/// Hold retry items until they are due, then re-inject them.
#[instrument(skip_all)]
pub async fn run_retry_coordinator(
    mut requests: mpsc::UnboundedReceiver<RetryItem>,
    accumulator: mpsc::UnboundedSender<PendingMutation>,
    shutdown: CancellationToken,
) {
    let mut queue = RetryQueue::new();
    let mut requests_open = true;

    loop {
        let next_due = queue.next_due();
        if !requests_open && next_due.is_none() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = requests.recv(), if requests_open => match request {
                Some(item) => queue.push(item),
                None => requests_open = false,
            },
            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                for item in queue.pop_due(Instant::now()) {
                    if accumulator.send(PendingMutation::Retried(item)).is_err() {
                        info!("Accumulator stopped, retry coordinator exiting");
                        return;
                    }
                }
            }
        }
    }

    info!(pending = queue.len(), "Retry coordinator stopped");
}
