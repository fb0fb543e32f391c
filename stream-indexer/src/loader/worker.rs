//! Bulk submission workers.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::accumulator::Batch;
use crate::checkpoint::{Resolver, TerminalFailure};
use crate::loader::{BulkSubmitter, ItemOutcome};
use crate::metrics::IndexerMetrics;
use crate::retry::RetryScheduler;

/// Pulls sealed batches from the shared queue and routes every outcome.
///
/// Shutdown is only observed between batches; a bulk call in flight always
/// completes.
pub struct SubmitWorker {
    pub id: usize,
    pub submitter: Arc<BulkSubmitter>,
    pub resolver: Arc<Resolver>,
    pub retries: RetryScheduler,
    pub metrics: Arc<IndexerMetrics>,
}

impl SubmitWorker {
    #[instrument(skip_all, fields(worker = self.id))]
    pub async fn run(self, queue: Arc<Mutex<mpsc::Receiver<Batch>>>, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                batch = async { queue.lock().await.recv().await } => batch,
            };

            let Some(batch) = next else {
                break;
            };
            self.process(batch).await;
        }

        info!(worker = self.id, "Submit worker stopped");
    }

    /// Submit one batch and settle each of its entries.
    pub async fn process(&self, batch: Batch) {
        self.metrics.record_batch_submitted();
        let result = self.submitter.submit(&batch).await;

        if let Some(err) = &result.request_error {
            self.metrics.record_transport_error();
            warn!(
                batch_id = batch.id,
                size = batch.len(),
                error = %err,
                "Bulk request failed, retrying all items"
            );
        }

        for (entry, outcome) in batch.entries.into_iter().zip(result.outcomes) {
            let attempts = entry.attempts + 1;
            match outcome {
                ItemOutcome::Accepted => self.resolver.accepted(&entry.mutation).await,
                ItemOutcome::Retryable { reason } => {
                    if let Err(exhausted) = self.retries.schedule(entry, reason) {
                        self.resolver
                            .terminal(
                                &exhausted.entry.mutation,
                                exhausted.entry.attempts + 1,
                                TerminalFailure::exhausted(exhausted.last_reason),
                            )
                            .await;
                    }
                }
                ItemOutcome::Terminal { reason, superseded } => {
                    let failure = if superseded {
                        TerminalFailure::superseded(reason)
                    } else {
                        TerminalFailure::rejected(reason)
                    };
                    self.resolver
                        .terminal(&entry.mutation, attempts, failure)
                        .await;
                }
            }
        }
    }
}
