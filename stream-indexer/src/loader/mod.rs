//! Loader module for the stream indexer.
//!
//! Submits sealed batches as bulk requests and classifies what happened to
//! every item.

mod dead_letter;
mod worker;

pub use dead_letter::{
    dead_letter_envelope, dead_letter_topic_name, DeadLetterSink, KafkaDeadLetterProducer,
    NoopDeadLetterSink,
};
pub use worker::SubmitWorker;

use std::sync::Arc;
use stream_indexer_repository::{
    is_retryable_error_type, is_retryable_status, BulkItemResponse, BulkOperation,
    SearchIndexError, SearchIndexProvider,
};
use stream_indexer_shared::MutationKind;
use tracing::{debug, instrument, warn};

use crate::accumulator::Batch;

/// Status the index returns when an external version is not newer than the
/// stored one.
const VERSION_CONFLICT_STATUS: u16 = 409;

/// What happened to one item of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The index applied the mutation.
    Accepted,
    /// The mutation may succeed if submitted again.
    Retryable { reason: String },
    /// The mutation will never succeed as is.
    Terminal {
        reason: String,
        /// A newer version of the document is already indexed.
        superseded: bool,
    },
}

/// Outcomes of a submitted batch, in batch order.
#[derive(Debug)]
pub struct BulkResult {
    pub outcomes: Vec<ItemOutcome>,
    /// Set when the bulk call as a whole failed.
    pub request_error: Option<SearchIndexError>,
}

impl BulkResult {
    pub fn accepted_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Accepted))
            .count()
    }

    pub fn retryable_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Retryable { .. }))
            .count()
    }
}

/// Classify one item of a bulk response.
pub fn classify_item(kind: MutationKind, item: &BulkItemResponse) -> ItemOutcome {
    if item.is_success() {
        return ItemOutcome::Accepted;
    }

    // Deleting a document that is already gone has the intended effect.
    if kind == MutationKind::Delete && item.status == 404 {
        return ItemOutcome::Accepted;
    }

    let retryable_type = item
        .error
        .as_ref()
        .is_some_and(|e| is_retryable_error_type(&e.error_type));
    if is_retryable_status(item.status) || retryable_type {
        return ItemOutcome::Retryable {
            reason: item.failure_reason(),
        };
    }

    ItemOutcome::Terminal {
        reason: item.failure_reason(),
        superseded: item.status == VERSION_CONFLICT_STATUS,
    }
}

/// Sends batches to the search index.
pub struct BulkSubmitter {
    provider: Arc<dyn SearchIndexProvider>,
}

impl BulkSubmitter {
    pub fn new(provider: Arc<dyn SearchIndexProvider>) -> Self {
        Self { provider }
    }

    /// Submit a batch as a single bulk request.
    ///
    /// Never fails: a failed request makes every sent item retryable.
    #[instrument(skip(self, batch), fields(batch_id = batch.id, size = batch.entries.len()))]
    pub async fn submit(&self, batch: &Batch) -> BulkResult {
        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; batch.entries.len()];
        let mut operations = Vec::with_capacity(batch.entries.len());
        let mut sent = Vec::with_capacity(batch.entries.len());

        for (index, entry) in batch.entries.iter().enumerate() {
            match BulkOperation::from_mutation(&entry.mutation) {
                Ok(op) => {
                    operations.push(op);
                    sent.push(index);
                }
                Err(e) => {
                    outcomes[index] = Some(ItemOutcome::Terminal {
                        reason: format!("invalid payload: {}", e),
                        superseded: false,
                    });
                }
            }
        }

        let mut request_error = None;
        if !operations.is_empty() {
            match self.provider.bulk(&operations).await {
                Ok(items) => {
                    if items.len() < operations.len() {
                        warn!(
                            expected = operations.len(),
                            received = items.len(),
                            "Bulk response is missing items"
                        );
                    }
                    for (position, index) in sent.iter().enumerate() {
                        let kind = batch.entries[*index].mutation.kind;
                        outcomes[*index] = Some(match items.get(position) {
                            Some(item) => classify_item(kind, item),
                            None => ItemOutcome::Retryable {
                                reason: "missing from bulk response".to_string(),
                            },
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Bulk request failed");
                    for index in &sent {
                        outcomes[*index] = Some(ItemOutcome::Retryable {
                            reason: e.to_string(),
                        });
                    }
                    request_error = Some(e);
                }
            }
        }

        let result = BulkResult {
            outcomes: outcomes
                .into_iter()
                .map(|o| {
                    o.unwrap_or_else(|| ItemOutcome::Retryable {
                        reason: "not submitted".to_string(),
                    })
                })
                .collect(),
            request_error,
        };

        debug!(
            accepted = result.accepted_count(),
            retryable = result.retryable_count(),
            "Bulk submission completed"
        );
        result
    }
}
