//! Batch accumulation.
//!
//! Mutations are buffered until the batch is full by count or by size, or
//! until the oldest buffered mutation has waited `flush_interval`. Limits
//! are read from the live configuration on every call.

use std::sync::Arc;
use std::time::Duration;
use stream_indexer_shared::Mutation;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::checkpoint::{Resolver, TerminalFailure};
use crate::config::ConfigProvider;
use crate::retry::RetryItem;

/// Input of the accumulator.
#[derive(Debug, Clone)]
pub enum PendingMutation {
    /// Freshly decoded from the stream.
    Fresh(Mutation),
    /// Coming back from the retry coordinator.
    Retried(RetryItem),
}

/// A mutation inside a batch, with the number of times it already failed.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub mutation: Mutation,
    pub attempts: u32,
}

impl BatchEntry {
    pub fn fresh(mutation: Mutation) -> Self {
        Self {
            mutation,
            attempts: 0,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.mutation.size_in_bytes()
    }
}

impl From<PendingMutation> for BatchEntry {
    fn from(pending: PendingMutation) -> Self {
        match pending {
            PendingMutation::Fresh(mutation) => Self::fresh(mutation),
            PendingMutation::Retried(item) => Self {
                mutation: item.mutation,
                attempts: item.attempt,
            },
        }
    }
}

/// A sealed group of mutations submitted as one bulk request.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: u64,
    pub entries: Vec<BatchEntry>,
    /// Estimated request size.
    pub size_bytes: usize,
    /// When the first entry was buffered.
    pub created_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The buffer behind the accumulator task.
pub struct BatchAccumulator {
    config: Arc<dyn ConfigProvider>,
    entries: Vec<BatchEntry>,
    size_bytes: usize,
    started_at: Option<Instant>,
    next_id: u64,
    /// Buffered entries that no longer fit a batch after a limit was lowered.
    rejected: Vec<BatchEntry>,
}

impl BatchAccumulator {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            config,
            entries: Vec::new(),
            size_bytes: 0,
            started_at: None,
            next_id: 0,
            rejected: Vec::new(),
        }
    }

    /// Add an entry, returning any batches that had to be sealed.
    ///
    /// An entry that could never fit in a batch is handed back untouched and
    /// the buffer is left as it was.
    pub fn push(&mut self, entry: BatchEntry, now: Instant) -> Result<Vec<Batch>, BatchEntry> {
        let config = self.config.current();
        let size = entry.size_in_bytes();
        if size > config.max_bulk_bytes {
            return Err(entry);
        }

        let mut sealed = Vec::new();
        let full = self.entries.len() >= config.max_bulk_actions
            || self.size_bytes + size > config.max_bulk_bytes;
        if full {
            sealed.extend(self.take());
        }

        self.started_at.get_or_insert(now);
        self.size_bytes += size;
        self.entries.push(entry);

        if self.entries.len() >= config.max_bulk_actions || self.size_bytes >= config.max_bulk_bytes
        {
            sealed.extend(self.take());
        }
        Ok(sealed)
    }

    /// Seal the buffer if its oldest entry has waited long enough.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => Vec::new(),
        }
    }

    /// When the time trigger fires, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        let flush_interval = self.config.current().flush_interval;
        self.started_at.map(|started| started + flush_interval)
    }

    /// Seal whatever is buffered, split so that every batch fits the
    /// current limits.
    ///
    /// Entries larger than the current byte limit are set aside, see
    /// [`BatchAccumulator::take_rejected`].
    pub fn take(&mut self) -> Vec<Batch> {
        let Some(created_at) = self.started_at.take() else {
            return Vec::new();
        };
        let config = self.config.current();
        self.size_bytes = 0;

        let mut sealed = Vec::new();
        let mut chunk: Vec<BatchEntry> = Vec::new();
        let mut chunk_bytes = 0;
        for entry in std::mem::take(&mut self.entries) {
            let size = entry.size_in_bytes();
            if size > config.max_bulk_bytes {
                self.rejected.push(entry);
                continue;
            }
            if !chunk.is_empty()
                && (chunk.len() >= config.max_bulk_actions
                    || chunk_bytes + size > config.max_bulk_bytes)
            {
                sealed.push(self.seal(std::mem::take(&mut chunk), chunk_bytes, created_at));
                chunk_bytes = 0;
            }
            chunk_bytes += size;
            chunk.push(entry);
        }
        if !chunk.is_empty() {
            sealed.push(self.seal(chunk, chunk_bytes, created_at));
        }
        sealed
    }

    fn seal(&mut self, entries: Vec<BatchEntry>, size_bytes: usize, created_at: Instant) -> Batch {
        self.next_id += 1;
        let batch = Batch {
            id: self.next_id,
            entries,
            size_bytes,
            created_at,
        };
        debug!(
            batch_id = batch.id,
            size = batch.len(),
            bytes = batch.size_bytes,
            "Sealed batch"
        );
        batch
    }

    /// Entries dropped from the buffer because they exceed the byte limit.
    pub fn take_rejected(&mut self) -> Vec<BatchEntry> {
        std::mem::take(&mut self.rejected)
    }

    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// Pass a sealed batch to the submission workers. Returns `false` if the
/// pipeline is shutting down.
async fn dispatch(batches: &mpsc::Sender<Batch>, batch: Batch, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = batches.send(batch) => sent.is_ok(),
    }
}

/// Far enough in the future to never fire.
const IDLE_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

/// Run the accumulator until shutdown.
///
/// Once the fresh input closes, every arrival is flushed immediately so that
/// the pipeline drains without waiting for the timer.
#[instrument(skip_all)]
pub async fn run_accumulator(
    mut accumulator: BatchAccumulator,
    mut fresh: mpsc::Receiver<PendingMutation>,
    mut retried: mpsc::UnboundedReceiver<PendingMutation>,
    batches: mpsc::Sender<Batch>,
    resolver: Arc<Resolver>,
    shutdown: CancellationToken,
) {
    let mut fresh_open = true;
    let mut retried_open = true;

    loop {
        let deadline = accumulator.deadline();
        let mut sealed: Vec<Batch> = Vec::new();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            pending = retried.recv(), if retried_open => match pending {
                Some(pending) => {
                    sealed = accept(&mut accumulator, pending.into(), &resolver).await;
                }
                None => retried_open = false,
            },
            pending = fresh.recv(), if fresh_open => match pending {
                Some(pending) => {
                    sealed = accept(&mut accumulator, pending.into(), &resolver).await;
                }
                None => {
                    info!("Input closed, draining accumulator");
                    fresh_open = false;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE_TIMER)), if deadline.is_some() => {
                sealed.extend(accumulator.flush_due(Instant::now()));
            }
        }

        if !fresh_open {
            sealed.extend(accumulator.take());
        }

        for entry in accumulator.take_rejected() {
            reject_oversized(&accumulator, entry, &resolver).await;
        }

        for batch in sealed {
            if !dispatch(&batches, batch, &shutdown).await {
                info!("Shutdown while dispatching, accumulator exiting");
                return;
            }
        }

        if !fresh_open && !retried_open && !accumulator.has_pending() {
            break;
        }
    }

    info!(pending = accumulator.pending(), "Accumulator stopped");
}

async fn accept(accumulator: &mut BatchAccumulator, entry: BatchEntry, resolver: &Resolver) -> Vec<Batch> {
    match accumulator.push(entry, Instant::now()) {
        Ok(sealed) => sealed,
        Err(entry) => {
            reject_oversized(accumulator, entry, resolver).await;
            Vec::new()
        }
    }
}

async fn reject_oversized(accumulator: &BatchAccumulator, entry: BatchEntry, resolver: &Resolver) {
    let max_bulk_bytes = accumulator.config.current().max_bulk_bytes;
    let failure = TerminalFailure::oversized(entry.size_in_bytes(), max_bulk_bytes);
    resolver
        .terminal(&entry.mutation, entry.attempts, failure)
        .await;
}
