//! The tasks of a running pipeline and their shutdown sequence.

use futures::future::join_all;
use std::sync::Arc;
use stream_indexer_repository::SearchIndexProvider;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::accumulator::{run_accumulator, BatchAccumulator, PendingMutation};
use crate::checkpoint::{CheckpointCommitter, Resolver};
use crate::config::ConfigProvider;
use crate::consumer::{Record, StreamReader};
use crate::loader::{BulkSubmitter, DeadLetterSink, SubmitWorker};
use crate::metrics::{run_progress_reporter, IndexerMetrics};
use crate::processor::Decode;
use crate::retry::{run_retry_coordinator, RetryScheduler};

/// Pause before reading again after a transport error.
const READ_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// How often the drain checks for outstanding positions.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long each task gets to exit after shutdown before it is aborted.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `start` needs to launch a pipeline.
pub(crate) struct PipelineParts {
    pub reader: Arc<dyn StreamReader>,
    pub config: Arc<dyn ConfigProvider>,
    pub provider: Arc<dyn SearchIndexProvider>,
    pub decoder: Arc<dyn Decode>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub metrics: Arc<IndexerMetrics>,
}

/// Handles of a launched pipeline.
pub(crate) struct RunningPipeline {
    intake: CancellationToken,
    shutdown: CancellationToken,
    reader_handle: JoinHandle<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    committer: Arc<CheckpointCommitter>,
}

impl RunningPipeline {
    /// Spawn every pipeline task.
    pub(crate) fn launch(parts: PipelineParts) -> Self {
        let settings = parts.config.current();
        let intake = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let metrics = parts.metrics;

        let committer = Arc::new(CheckpointCommitter::new(
            parts.reader.clone(),
            metrics.clone(),
        ));
        let resolver = Arc::new(Resolver::new(
            committer.clone(),
            metrics.clone(),
            parts.dead_letters,
        ));

        let (fresh_tx, fresh_rx) = mpsc::channel(settings.channel_capacity);
        let (retry_request_tx, retry_request_rx) = mpsc::unbounded_channel();
        let (retry_out_tx, retry_out_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::channel(settings.batch_queue_capacity);

        let mut handles = Vec::new();

        let mut shards = Vec::with_capacity(settings.concurrency);
        for shard in 0..settings.concurrency {
            let (record_tx, record_rx) = mpsc::channel(settings.channel_capacity);
            shards.push(record_tx);
            handles.push((
                "decoder",
                tokio::spawn(run_decoder(
                    shard,
                    record_rx,
                    parts.decoder.clone(),
                    fresh_tx.clone(),
                    resolver.clone(),
                    metrics.clone(),
                )),
            ));
        }
        drop(fresh_tx);

        let reader_handle = tokio::spawn(run_reader(
            parts.reader,
            shards,
            committer.clone(),
            metrics.clone(),
            intake.clone(),
        ));

        handles.push((
            "accumulator",
            tokio::spawn(run_accumulator(
                BatchAccumulator::new(parts.config.clone()),
                fresh_rx,
                retry_out_rx,
                batch_tx,
                resolver.clone(),
                shutdown.clone(),
            )),
        ));

        handles.push((
            "retry-coordinator",
            tokio::spawn(run_retry_coordinator(
                retry_request_rx,
                retry_out_tx,
                shutdown.clone(),
            )),
        ));

        let submitter = Arc::new(BulkSubmitter::new(parts.provider));
        let queue = Arc::new(Mutex::new(batch_rx));
        for id in 0..settings.worker_count {
            let worker = SubmitWorker {
                id,
                submitter: submitter.clone(),
                resolver: resolver.clone(),
                retries: RetryScheduler::new(
                    retry_request_tx.clone(),
                    parts.config.clone(),
                    metrics.clone(),
                ),
                metrics: metrics.clone(),
            };
            handles.push((
                "submit-worker",
                tokio::spawn(worker.run(queue.clone(), shutdown.clone())),
            ));
        }
        drop(retry_request_tx);

        handles.push((
            "progress-reporter",
            tokio::spawn(run_progress_reporter(
                metrics,
                settings.progress_interval,
                shutdown.clone(),
            )),
        ));

        info!(
            concurrency = settings.concurrency,
            worker_count = settings.worker_count,
            max_bulk_actions = settings.max_bulk_actions,
            max_bulk_bytes = settings.max_bulk_bytes,
            flush_interval_ms = settings.flush_interval.as_millis() as u64,
            "Pipeline started"
        );

        Self {
            intake,
            shutdown,
            reader_handle,
            handles,
            committer,
        }
    }

    pub(crate) fn committer(&self) -> Arc<CheckpointCommitter> {
        self.committer.clone()
    }

    /// Stop reading, drain for up to `grace`, then stop every task.
    ///
    /// Returns the number of positions left unresolved.
    pub(crate) async fn shutdown(mut self, grace: Duration) -> usize {
        let started = Instant::now();
        self.intake.cancel();

        let committer = self.committer.clone();
        let reader_handle = &mut self.reader_handle;
        let drained = timeout(grace, async {
            let _ = reader_handle.await;
            while committer.outstanding() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Pipeline drained"
            );
        } else {
            warn!(
                outstanding = self.committer.outstanding(),
                grace_ms = grace.as_millis() as u64,
                "Drain did not finish within the grace period"
            );
        }

        self.shutdown.cancel();
        if !self.reader_handle.is_finished() {
            self.reader_handle.abort();
        }
        join_all(self.handles.into_iter().map(|(name, mut handle)| async move {
            if timeout(TASK_JOIN_TIMEOUT, &mut handle).await.is_err() {
                warn!(task = name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }))
        .await;

        self.committer.flush().await;
        self.committer.outstanding()
    }
}

/// Read records and hand them to the decoder owning their partition.
#[instrument(skip_all)]
async fn run_reader(
    reader: Arc<dyn StreamReader>,
    shards: Vec<mpsc::Sender<Record>>,
    committer: Arc<CheckpointCommitter>,
    metrics: Arc<IndexerMetrics>,
    intake: CancellationToken,
) {
    let shard_count = shards.len() as i32;

    loop {
        let next = tokio::select! {
            biased;
            _ = intake.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Ok(record) => {
                metrics.record_read();
                committer.track(record.position);
                let shard = record.position.partition.rem_euclid(shard_count) as usize;
                // Not cancellable: a tracked record must reach its decoder.
                if shards[shard].send(record).await.is_err() {
                    warn!("Decoder stopped, reader exiting");
                    break;
                }
            }
            Err(e) => {
                metrics.record_transport_error();
                warn!(error = %e, "Failed to read from stream, retrying");
                tokio::select! {
                    _ = intake.cancelled() => break,
                    _ = sleep(READ_RETRY_PAUSE) => {}
                }
            }
        }
    }

    info!("Reader stopped");
}

/// Decode the records of one shard, preserving their order.
#[instrument(skip(records, decoder, fresh, resolver, metrics))]
async fn run_decoder(
    shard: usize,
    mut records: mpsc::Receiver<Record>,
    decoder: Arc<dyn Decode>,
    fresh: mpsc::Sender<PendingMutation>,
    resolver: Arc<Resolver>,
    metrics: Arc<IndexerMetrics>,
) {
    while let Some(record) = records.recv().await {
        match decoder.decode(&record) {
            Ok(mutation) => {
                metrics.record_decoded();
                if fresh.send(PendingMutation::Fresh(mutation)).await.is_err() {
                    break;
                }
            }
            Err(e) => resolver.decode_failure(record.position, &e).await,
        }
    }
}
