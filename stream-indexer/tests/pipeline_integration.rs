//! Integration tests for the indexing pipeline.
//!
//! These tests drive the real `Indexer` with an in-memory stream and a
//! scripted search index, using paused time so that flushes, backoff and
//! shutdown grace periods run instantly.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_indexer::config::{DynamicConfig, IndexerConfig};
use stream_indexer::consumer::{MessageTransport, Record, StreamReader};
use stream_indexer::errors::IngestError;
use stream_indexer::loader::DeadLetterSink;
use stream_indexer::{Indexer, IndexerError, ProcessorState};
use stream_indexer_repository::{
    BulkItemResponse, BulkOperation, SearchIndexError, SearchIndexProvider,
};
use stream_indexer_shared::{Mutation, StreamPosition};

// In-memory stream: hands out queued records, then waits forever.
#[derive(Default)]
struct MemoryReader {
    records: Mutex<VecDeque<Record>>,
    acks: Mutex<Vec<StreamPosition>>,
    /// Acknowledgments made durable by the last flush.
    flushed: Mutex<Option<Vec<StreamPosition>>>,
}

impl MemoryReader {
    fn with_records(records: Vec<Record>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records.into()),
            ..Self::default()
        })
    }

    /// Highest acknowledged offset per partition.
    fn committed(&self) -> HashMap<i32, i64> {
        let mut committed = HashMap::new();
        for ack in self.acks.lock().iter() {
            let entry = committed.entry(ack.partition).or_insert(ack.offset);
            *entry = (*entry).max(ack.offset);
        }
        committed
    }
}

#[async_trait]
impl StreamReader for MemoryReader {
    async fn next(&self) -> Result<Record, IngestError> {
        let record = self.records.lock().pop_front();
        match record {
            Some(record) => Ok(record),
            None => std::future::pending().await,
        }
    }

    async fn acknowledge(&self, position: StreamPosition) -> Result<(), IngestError> {
        self.acks.lock().push(position);
        Ok(())
    }

    async fn flush(&self) -> Result<(), IngestError> {
        *self.flushed.lock() = Some(self.acks.lock().clone());
        Ok(())
    }
}

struct MemoryTransport {
    reader: Arc<MemoryReader>,
    fail_subscribe: bool,
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn subscribe(
        &self,
        _topic: &str,
        _group: &str,
    ) -> Result<Arc<dyn StreamReader>, IngestError> {
        if self.fail_subscribe {
            return Err(IngestError::transport("Mock subscribe error"));
        }
        Ok(self.reader.clone())
    }
}

type BulkBehavior =
    dyn Fn(usize, &[BulkOperation]) -> Result<Vec<BulkItemResponse>, SearchIndexError> + Send + Sync;

// Search index whose responses are computed from the call number and request.
struct MockSearchIndex {
    behavior: Box<BulkBehavior>,
    calls: AtomicUsize,
    submitted: Mutex<Vec<BulkOperation>>,
}

impl MockSearchIndex {
    fn new(
        behavior: impl Fn(usize, &[BulkOperation]) -> Result<Vec<BulkItemResponse>, SearchIndexError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::new(|_, ops| Ok(all_ok(ops)))
    }
}

#[async_trait]
impl SearchIndexProvider for MockSearchIndex {
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError> {
        Ok(())
    }

    async fn bulk(
        &self,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResponse>, SearchIndexError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().extend_from_slice(operations);
        (self.behavior)(call, operations)
    }
}

#[derive(Default)]
struct CollectingDeadLetters {
    published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DeadLetterSink for CollectingDeadLetters {
    async fn publish(
        &self,
        mutation: &Mutation,
        reason: &str,
        _attempts: u32,
    ) -> Result<bool, IngestError> {
        self.published
            .lock()
            .push((mutation.document_id.clone(), reason.to_string()));
        Ok(true)
    }
}

fn all_ok(ops: &[BulkOperation]) -> Vec<BulkItemResponse> {
    ops.iter()
        .map(|op| BulkItemResponse::ok(op.document_id.clone(), 200))
        .collect()
}

fn index_record(partition: i32, offset: i64) -> Record {
    let payload = json!({
        "operation": "index",
        "document_id": format!("doc-{}-{}", partition, offset),
        "fields": {"partition": partition, "offset": offset}
    });
    Record::new(
        StreamPosition::new(partition, offset),
        payload.to_string().into_bytes(),
    )
}

fn test_config() -> DynamicConfig {
    DynamicConfig::new(IndexerConfig {
        concurrency: 2,
        worker_count: 2,
        max_bulk_actions: 10,
        flush_interval: Duration::from_millis(100),
        retry_interval: Duration::from_millis(50),
        retry_max_interval: Duration::from_secs(1),
        max_retry_attempts: 3,
        shutdown_grace: Duration::from_secs(5),
        ..IndexerConfig::default()
    })
}

fn build_indexer(
    config: &DynamicConfig,
    reader: Arc<MemoryReader>,
    index: Arc<MockSearchIndex>,
) -> Indexer {
    Indexer::new(
        "visibility",
        Arc::new(config.clone()),
        Arc::new(MemoryTransport {
            reader,
            fail_subscribe: false,
        }),
        index,
    )
}

/// Wait (in paused time) until `condition` holds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_every_record_resolved_exactly_once() {
    let mut records = Vec::new();
    for partition in 0..3 {
        for offset in 0..20 {
            records.push(index_record(partition, offset));
        }
    }
    // Two undecodable records in the middle of partition 1.
    records.push(Record::new(StreamPosition::new(1, 20), b"not json".to_vec()));
    records.push(Record::new(StreamPosition::new(1, 21), Vec::new()));
    records.push(index_record(1, 22));
    let total = records.len() as u64;

    let reader = MemoryReader::with_records(records);
    let index = MockSearchIndex::accepting();
    let config = test_config();
    let indexer = build_indexer(&config, reader.clone(), index.clone());

    indexer.start().await.unwrap();
    wait_until(|| {
        let health = indexer.health();
        health.metrics.records_read == total && health.outstanding == 0
    })
    .await;

    let metrics = indexer.metrics();
    assert_eq!(metrics.decoded + metrics.decode_failures, total);
    assert_eq!(metrics.decode_failures, 2);
    assert_eq!(metrics.accepted, metrics.decoded);
    assert_eq!(index.submitted.lock().len() as u64, metrics.decoded);

    let committed = reader.committed();
    assert_eq!(committed.get(&0), Some(&19));
    assert_eq!(committed.get(&1), Some(&22));
    assert_eq!(committed.get(&2), Some(&19));
    assert_eq!(indexer.health().checkpoint_lag, 0);

    assert!(reader.flushed.lock().is_none());
    indexer.stop().await.unwrap();
    assert_eq!(indexer.state(), ProcessorState::Stopped);

    let flushed = reader.flushed.lock().clone().expect("stop flushes checkpoints");
    for (partition, offset) in [(0, 19), (1, 22), (2, 19)] {
        assert!(flushed.contains(&StreamPosition::new(partition, offset)));
    }
}

#[tokio::test(start_paused = true)]
async fn test_batches_respect_limits() {
    let records: Vec<Record> = (0..25).map(|offset| index_record(0, offset)).collect();
    let reader = MemoryReader::with_records(records);
    let batch_sizes = Arc::new(Mutex::new(Vec::new()));
    let sizes = batch_sizes.clone();
    let index = MockSearchIndex::new(move |_, ops| {
        sizes.lock().push(ops.len());
        Ok(all_ok(ops))
    });
    let config = test_config();
    config.update(|c| c.max_bulk_actions = 4);
    let indexer = build_indexer(&config, reader.clone(), index);

    indexer.start().await.unwrap();
    wait_until(|| indexer.metrics().accepted == 25).await;

    let sizes = batch_sizes.lock().clone();
    assert!(sizes.iter().all(|&size| size <= 4), "batch sizes: {:?}", sizes);
    assert_eq!(sizes.iter().sum::<usize>(), 25);

    indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let records: Vec<Record> = (0..5).map(|offset| index_record(0, offset)).collect();
    let reader = MemoryReader::with_records(records);
    let index = MockSearchIndex::new(|call, ops| {
        if call == 0 {
            Err(SearchIndexError::unavailable(503, "cluster is recovering"))
        } else {
            Ok(all_ok(ops))
        }
    });
    let config = test_config();
    let indexer = build_indexer(&config, reader.clone(), index.clone());

    indexer.start().await.unwrap();
    wait_until(|| indexer.metrics().accepted == 5).await;

    let metrics = indexer.metrics();
    assert_eq!(metrics.retried, 5);
    assert_eq!(metrics.transport_errors, 1);
    assert_eq!(metrics.terminal_failures, 0);
    assert_eq!(reader.committed().get(&0), Some(&4));

    indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_index_gives_up_after_ceiling() {
    let records: Vec<Record> = (0..3).map(|offset| index_record(0, offset)).collect();
    let reader = MemoryReader::with_records(records);
    let index = MockSearchIndex::new(|_, _| Err(SearchIndexError::connection("connection refused")));
    let dead_letters = Arc::new(CollectingDeadLetters::default());
    let config = test_config();
    config.update(|c| c.max_retry_attempts = 2);
    let indexer =
        build_indexer(&config, reader.clone(), index.clone()).with_dead_letter_sink(dead_letters.clone());

    indexer.start().await.unwrap();
    wait_until(|| indexer.metrics().terminal_failures == 3).await;

    let metrics = indexer.metrics();
    assert_eq!(metrics.retry_exhausted, 3);
    assert_eq!(metrics.accepted, 0);
    assert_eq!(metrics.dead_lettered, 3);
    // One initial submission plus two retries per document.
    assert_eq!(index.submitted.lock().len(), 9);
    assert_eq!(dead_letters.published.lock().len(), 3);

    wait_until(|| reader.committed().get(&0) == Some(&2)).await;
    indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_item_failures_are_classified() {
    let records: Vec<Record> = (0..3).map(|offset| index_record(0, offset)).collect();
    let reader = MemoryReader::with_records(records);
    let index = MockSearchIndex::new(|_, ops| {
        Ok(ops
            .iter()
            .map(|op| match op.document_id.as_str() {
                "doc-0-1" => BulkItemResponse::failed(
                    op.document_id.clone(),
                    400,
                    "mapper_parsing_exception",
                    "failed to parse field",
                ),
                "doc-0-2" => BulkItemResponse::failed(
                    op.document_id.clone(),
                    409,
                    "version_conflict_engine_exception",
                    "version conflict",
                ),
                _ => BulkItemResponse::ok(op.document_id.clone(), 201),
            })
            .collect())
    });
    let dead_letters = Arc::new(CollectingDeadLetters::default());
    let config = test_config();
    let indexer =
        build_indexer(&config, reader.clone(), index).with_dead_letter_sink(dead_letters.clone());

    indexer.start().await.unwrap();
    wait_until(|| indexer.health().outstanding == 0 && indexer.metrics().records_read == 3).await;

    let metrics = indexer.metrics();
    assert_eq!(metrics.accepted, 1);
    assert_eq!(metrics.terminal_failures, 2);
    assert_eq!(metrics.superseded, 1);
    assert_eq!(metrics.retried, 0);

    let published = dead_letters.published.lock().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "doc-0-1");
    assert!(published[0].1.contains("mapper_parsing_exception"));
    assert_eq!(reader.committed().get(&0), Some(&2));

    indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_work_after_grace_period() {
    let records: Vec<Record> = (0..4).map(|offset| index_record(0, offset)).collect();
    let reader = MemoryReader::with_records(records);
    let index = MockSearchIndex::new(|_, _| Err(SearchIndexError::unavailable(503, "down")));
    let config = test_config();
    config.update(|c| {
        c.max_retry_attempts = 100;
        c.retry_interval = Duration::from_secs(60);
        c.retry_max_interval = Duration::from_secs(60);
        c.shutdown_grace = Duration::from_millis(500);
    });
    let indexer = build_indexer(&config, reader.clone(), index);

    indexer.start().await.unwrap();
    wait_until(|| indexer.metrics().retried == 4).await;

    match indexer.stop().await {
        Err(IndexerError::ShutdownTimeout { abandoned }) => assert_eq!(abandoned, 4),
        other => panic!("expected shutdown timeout, got {:?}", other),
    }
    assert_eq!(indexer.state(), ProcessorState::Stopped);
    assert!(reader.committed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_fails_start() {
    let config = test_config();
    let indexer = Indexer::new(
        "visibility",
        Arc::new(config),
        Arc::new(MemoryTransport {
            reader: MemoryReader::with_records(Vec::new()),
            fail_subscribe: true,
        }),
        MockSearchIndex::accepting(),
    );

    assert!(matches!(
        indexer.start().await,
        Err(IndexerError::SubscribeError(_))
    ));
    assert_eq!(indexer.state(), ProcessorState::Created);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let reader = MemoryReader::with_records(vec![index_record(0, 0)]);
    let config = test_config();
    let indexer = build_indexer(&config, reader.clone(), MockSearchIndex::accepting());

    indexer.start().await.unwrap();
    wait_until(|| indexer.metrics().accepted == 1).await;
    indexer.stop().await.unwrap();

    reader.records.lock().push_back(index_record(0, 1));
    indexer.start().await.unwrap();
    assert_eq!(indexer.state(), ProcessorState::Running);
    wait_until(|| indexer.metrics().accepted == 2).await;
    indexer.stop().await.unwrap();

    assert_eq!(reader.committed().get(&0), Some(&1));
}
