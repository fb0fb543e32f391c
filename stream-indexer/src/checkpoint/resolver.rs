//! Final outcomes of mutations.
//!
//! Every read position ends up here exactly once, whichever way it finished.

use std::sync::Arc;
use stream_indexer_shared::{Mutation, StreamPosition};
use tracing::{debug, error, warn};

use crate::checkpoint::CheckpointCommitter;
use crate::errors::DecodeError;
use crate::loader::DeadLetterSink;
use crate::metrics::IndexerMetrics;

/// Why a mutation was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalFailure {
    pub reason: String,
    /// The index already holds a newer version of the document.
    pub superseded: bool,
    /// The retry ceiling was reached.
    pub exhausted: bool,
}

impl TerminalFailure {
    /// Rejected by the index for a reason retrying cannot fix.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            superseded: false,
            exhausted: false,
        }
    }

    /// Lost a version conflict against a newer document.
    pub fn superseded(reason: impl Into<String>) -> Self {
        Self {
            superseded: true,
            ..Self::rejected(reason)
        }
    }

    /// Still failing after the last allowed retry.
    pub fn exhausted(last_reason: impl Into<String>) -> Self {
        Self {
            exhausted: true,
            ..Self::rejected(last_reason)
        }
    }

    /// Larger than a whole bulk request may be.
    pub fn oversized(size: usize, max_bulk_bytes: usize) -> Self {
        Self::rejected(format!(
            "oversized: {} bytes exceeds max_bulk_bytes {}",
            size, max_bulk_bytes
        ))
    }
}

/// Records outcomes in metrics, logs and the dead-letter sink, then releases
/// the position to the checkpoint committer.
pub struct Resolver {
    committer: Arc<CheckpointCommitter>,
    metrics: Arc<IndexerMetrics>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl Resolver {
    pub fn new(
        committer: Arc<CheckpointCommitter>,
        metrics: Arc<IndexerMetrics>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            committer,
            metrics,
            dead_letters,
        }
    }

    /// The index accepted the mutation.
    pub async fn accepted(&self, mutation: &Mutation) {
        self.metrics.record_accepted(1);
        self.committer.resolve(mutation.position).await;
    }

    /// The mutation will never be indexed.
    ///
    /// `attempts` is the number of submissions made, zero if it was never sent.
    pub async fn terminal(&self, mutation: &Mutation, attempts: u32, failure: TerminalFailure) {
        self.metrics.record_terminal_failure();

        if failure.superseded {
            self.metrics.record_superseded();
            debug!(
                document_id = %mutation.document_id,
                partition = mutation.position.partition,
                offset = mutation.position.offset,
                version = ?mutation.version,
                "Mutation superseded by a newer document version"
            );
        } else {
            if failure.exhausted {
                self.metrics.record_retry_exhausted();
            }
            error!(
                document_id = %mutation.document_id,
                operation = mutation.kind.as_str(),
                partition = mutation.position.partition,
                offset = mutation.position.offset,
                attempts = attempts,
                exhausted = failure.exhausted,
                reason = %failure.reason,
                "Mutation failed permanently"
            );

            match self.dead_letters.publish(mutation, &failure.reason, attempts).await {
                Ok(true) => self.metrics.record_dead_lettered(),
                Ok(false) => {}
                Err(e) => warn!(
                    document_id = %mutation.document_id,
                    error = %e,
                    "Failed to publish dead letter"
                ),
            }
        }

        self.committer.resolve(mutation.position).await;
    }

    /// The record at `position` could not be decoded.
    pub async fn decode_failure(&self, position: StreamPosition, err: &DecodeError) {
        self.metrics.record_decode_failure();
        warn!(
            partition = position.partition,
            offset = position.offset,
            error = %err,
            "Skipping record that could not be decoded"
        );
        self.committer.resolve(position).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::tests::committer;
    use crate::errors::IngestError;
    use crate::loader::NoopDeadLetterSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        published: Mutex<Vec<(String, String, u32)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterSink for CollectingSink {
        async fn publish(
            &self,
            mutation: &Mutation,
            reason: &str,
            attempts: u32,
        ) -> Result<bool, IngestError> {
            if self.fail {
                return Err(IngestError::dead_letter("broker down"));
            }
            self.published
                .lock()
                .push((mutation.document_id.clone(), reason.to_string(), attempts));
            Ok(true)
        }
    }

    fn mutation(offset: i64) -> Mutation {
        Mutation::delete("wf-1", None, StreamPosition::new(0, offset))
    }

    #[tokio::test]
    async fn test_terminal_failure_is_dead_lettered_and_resolved() {
        let (committer, reader) = committer();
        let metrics = IndexerMetrics::new();
        let sink = Arc::new(CollectingSink::default());
        let resolver = Resolver::new(committer.clone(), metrics.clone(), sink.clone());

        committer.track(StreamPosition::new(0, 1));
        resolver
            .terminal(&mutation(1), 6, TerminalFailure::exhausted("503"))
            .await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.terminal_failures, 1);
        assert_eq!(snapshot.retry_exhausted, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(
            *sink.published.lock(),
            vec![("wf-1".to_string(), "503".to_string(), 6)]
        );
        assert_eq!(*reader.acks.lock(), vec![StreamPosition::new(0, 1)]);
    }

    #[tokio::test]
    async fn test_superseded_is_not_dead_lettered() {
        let (committer, _) = committer();
        let metrics = IndexerMetrics::new();
        let sink = Arc::new(CollectingSink::default());
        let resolver = Resolver::new(committer.clone(), metrics.clone(), sink.clone());

        committer.track(StreamPosition::new(0, 1));
        resolver
            .terminal(&mutation(1), 1, TerminalFailure::superseded("version conflict"))
            .await;

        assert!(sink.published.lock().is_empty());
        assert_eq!(metrics.snapshot().superseded, 1);
        assert_eq!(committer.checkpoint(0), Some(1));
    }

    #[tokio::test]
    async fn test_dead_letter_failure_still_resolves() {
        let (committer, _) = committer();
        let sink = Arc::new(CollectingSink {
            fail: true,
            ..Default::default()
        });
        let resolver = Resolver::new(committer.clone(), IndexerMetrics::new(), sink);

        committer.track(StreamPosition::new(0, 4));
        resolver
            .terminal(&mutation(4), 1, TerminalFailure::rejected("mapper_parsing_exception"))
            .await;
        assert_eq!(committer.checkpoint(0), Some(4));
    }

    #[tokio::test]
    async fn test_decode_failure_resolves_position() {
        let (committer, _) = committer();
        let metrics = IndexerMetrics::new();
        let resolver = Resolver::new(
            committer.clone(),
            metrics.clone(),
            Arc::new(NoopDeadLetterSink),
        );

        committer.track(StreamPosition::new(2, 0));
        resolver
            .decode_failure(StreamPosition::new(2, 0), &DecodeError::EmptyPayload)
            .await;

        assert_eq!(metrics.snapshot().decode_failures, 1);
        assert_eq!(committer.checkpoint(2), Some(0));
        assert_eq!(committer.outstanding(), 0);
    }

    #[test]
    fn test_oversized_reason() {
        let failure = TerminalFailure::oversized(300, 100);
        assert!(failure.reason.starts_with("oversized"));
        assert!(!failure.exhausted);
    }
}
