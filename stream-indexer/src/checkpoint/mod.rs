//! Checkpoint tracking.
//!
//! Mutations complete out of order: batches run concurrently and retried
//! items come back much later than their neighbours. A partition's checkpoint
//! only moves up to the highest offset below which nothing is outstanding.

mod resolver;

pub use resolver::{Resolver, TerminalFailure};

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use stream_indexer_shared::StreamPosition;
use tracing::{debug, warn};

use crate::consumer::StreamReader;
use crate::metrics::IndexerMetrics;

/// Outstanding offsets and checkpoint of a single partition.
#[derive(Debug, Clone)]
pub struct PartitionCheckpoint {
    outstanding: BTreeSet<i64>,
    /// Offset just before the first one tracked.
    baseline: i64,
    highest_tracked: i64,
    committed: i64,
}

impl PartitionCheckpoint {
    /// Start tracking a partition whose first read offset is `first_offset`.
    pub fn new(first_offset: i64) -> Self {
        let baseline = first_offset - 1;
        Self {
            outstanding: BTreeSet::new(),
            baseline,
            highest_tracked: baseline,
            committed: baseline,
        }
    }

    /// Register a read offset as outstanding.
    pub fn track(&mut self, offset: i64) {
        self.outstanding.insert(offset);
        self.highest_tracked = self.highest_tracked.max(offset);
    }

    /// Mark an offset resolved. Returns the new checkpoint if it advanced.
    ///
    /// Offsets that are not outstanding are ignored.
    pub fn resolve(&mut self, offset: i64) -> Option<i64> {
        if !self.outstanding.remove(&offset) {
            return None;
        }

        let candidate = match self.outstanding.first() {
            Some(lowest) => lowest - 1,
            None => self.highest_tracked,
        };

        if candidate > self.committed {
            self.committed = candidate;
            Some(candidate)
        } else {
            None
        }
    }

    /// Highest offset at or below which every tracked offset is resolved.
    pub fn checkpoint(&self) -> Option<i64> {
        (self.committed > self.baseline).then_some(self.committed)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Offsets read beyond the checkpoint.
    pub fn lag(&self) -> u64 {
        self.highest_tracked.saturating_sub(self.committed).max(0) as u64
    }
}

/// Tracks every partition and acknowledges advanced checkpoints.
///
/// Safe to call from any number of tasks. The reader is acknowledged outside
/// the lock.
pub struct CheckpointCommitter {
    partitions: Mutex<HashMap<i32, PartitionCheckpoint>>,
    reader: Arc<dyn StreamReader>,
    metrics: Arc<IndexerMetrics>,
}

impl CheckpointCommitter {
    pub fn new(reader: Arc<dyn StreamReader>, metrics: Arc<IndexerMetrics>) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            reader,
            metrics,
        }
    }

    /// Register a position as read. Must be called in read order.
    pub fn track(&self, position: StreamPosition) {
        let lag = {
            let mut partitions = self.partitions.lock();
            partitions
                .entry(position.partition)
                .or_insert_with(|| PartitionCheckpoint::new(position.offset))
                .track(position.offset);
            Self::total_lag(&partitions)
        };
        self.metrics.set_checkpoint_lag(lag);
    }

    /// Mark a position as durably resolved, acknowledging the reader if the
    /// partition's checkpoint advanced.
    ///
    /// Returns the acknowledged position, if any. A failed acknowledgment is
    /// logged and counted; the next advance covers it.
    pub async fn resolve(&self, position: StreamPosition) -> Option<StreamPosition> {
        let (advanced, lag) = {
            let mut partitions = self.partitions.lock();
            let advanced = partitions
                .get_mut(&position.partition)
                .and_then(|p| p.resolve(position.offset));
            (advanced, Self::total_lag(&partitions))
        };
        self.metrics.set_checkpoint_lag(lag);

        let checkpoint = StreamPosition::new(position.partition, advanced?);
        self.acknowledge(checkpoint).await;
        Some(checkpoint)
    }

    /// Current checkpoint of a partition.
    pub fn checkpoint(&self, partition: i32) -> Option<i64> {
        self.partitions
            .lock()
            .get(&partition)
            .and_then(PartitionCheckpoint::checkpoint)
    }

    /// Number of tracked positions that are not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.partitions
            .lock()
            .values()
            .map(PartitionCheckpoint::outstanding)
            .sum()
    }

    pub fn lag(&self) -> u64 {
        Self::total_lag(&self.partitions.lock())
    }

    /// Acknowledge the current checkpoint of every partition again, then
    /// have the reader make the acknowledgments durable.
    pub async fn flush(&self) {
        let checkpoints: Vec<StreamPosition> = self
            .partitions
            .lock()
            .iter()
            .filter_map(|(partition, p)| {
                p.checkpoint()
                    .map(|offset| StreamPosition::new(*partition, offset))
            })
            .collect();

        for checkpoint in checkpoints {
            self.acknowledge(checkpoint).await;
        }

        if let Err(e) = self.reader.flush().await {
            self.metrics.record_transport_error();
            warn!(error = %e, "Failed to flush final checkpoints");
        }
    }

    async fn acknowledge(&self, checkpoint: StreamPosition) {
        match self.reader.acknowledge(checkpoint).await {
            Ok(()) => debug!(
                partition = checkpoint.partition,
                offset = checkpoint.offset,
                "Checkpoint advanced"
            ),
            Err(e) => {
                self.metrics.record_transport_error();
                warn!(
                    partition = checkpoint.partition,
                    offset = checkpoint.offset,
                    error = %e,
                    "Failed to acknowledge checkpoint"
                );
            }
        }
    }

    fn total_lag(partitions: &HashMap<i32, PartitionCheckpoint>) -> u64 {
        partitions.values().map(PartitionCheckpoint::lag).sum()
    }
}
