//! Orchestrator module for the stream indexer.
//!
//! [`Indexer`] owns the pipeline lifecycle: it subscribes, launches the
//! pipeline tasks, drains them on stop and reports health.

mod pipeline;

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use stream_indexer_repository::SearchIndexProvider;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointCommitter;
use crate::config::ConfigProvider;
use crate::consumer::{consumer_group_name, MessageTransport};
use crate::loader::{DeadLetterSink, NoopDeadLetterSink};
use crate::metrics::{IndexerMetrics, MetricsSnapshot};
use crate::processor::{Decode, JsonMessageDecoder};
use crate::IndexerError;

use pipeline::{PipelineParts, RunningPipeline};

/// Lifecycle state of an [`Indexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessorState::Created => "created",
            ProcessorState::Starting => "starting",
            ProcessorState::Running => "running",
            ProcessorState::Stopping => "stopping",
            ProcessorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by [`Indexer::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: ProcessorState,
    pub metrics: MetricsSnapshot,
    pub checkpoint_lag: u64,
    /// Positions read but not yet resolved.
    pub outstanding: usize,
}

struct Inner {
    state: ProcessorState,
    pipeline: Option<RunningPipeline>,
    /// Committer of the current or most recent pipeline.
    committer: Option<Arc<CheckpointCommitter>>,
}

/// The bulk indexing processor for one topic.
///
/// # Example
///
/// ```ignore
/// let indexer = Indexer::new("visibility", config, transport, provider);
/// indexer.start().await?;
/// // ...
/// indexer.stop().await?;
/// ```
pub struct Indexer {
    topic: String,
    config: Arc<dyn ConfigProvider>,
    transport: Arc<dyn MessageTransport>,
    provider: Arc<dyn SearchIndexProvider>,
    decoder: Arc<dyn Decode>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<IndexerMetrics>,
    inner: Mutex<Inner>,
}

impl Indexer {
    /// Create an indexer that decodes JSON index messages and discards
    /// dead letters.
    pub fn new(
        topic: impl Into<String>,
        config: Arc<dyn ConfigProvider>,
        transport: Arc<dyn MessageTransport>,
        provider: Arc<dyn SearchIndexProvider>,
    ) -> Self {
        Self {
            topic: topic.into(),
            config,
            transport,
            provider,
            decoder: Arc::new(JsonMessageDecoder::new()),
            dead_letters: Arc::new(NoopDeadLetterSink),
            metrics: IndexerMetrics::new(),
            inner: Mutex::new(Inner {
                state: ProcessorState::Created,
                pipeline: None,
                committer: None,
            }),
        }
    }

    /// Use a different record decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn Decode>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Publish terminal failures to `sink`.
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ProcessorState {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> HealthStatus {
        let inner = self.inner.lock();
        let (checkpoint_lag, outstanding) = inner
            .committer
            .as_ref()
            .map(|c| (c.lag(), c.outstanding()))
            .unwrap_or((0, 0));

        HealthStatus {
            state: inner.state,
            metrics: self.metrics.snapshot(),
            checkpoint_lag,
            outstanding,
        }
    }

    /// Subscribe and launch the pipeline.
    ///
    /// Does nothing if the indexer is disabled. Only a failed subscription
    /// makes this fail at runtime; everything after it is handled inside
    /// the pipeline.
    pub async fn start(&self) -> Result<(), IndexerError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ProcessorState::Starting | ProcessorState::Running | ProcessorState::Stopping => {
                    return Err(IndexerError::AlreadyRunning(inner.state));
                }
                ProcessorState::Created | ProcessorState::Stopped => {}
            }

            let config = self.config.current();
            if !config.enabled {
                info!(topic = %self.topic, "Indexer is disabled, not starting");
                return Ok(());
            }
            config.validate()?;
            inner.state = ProcessorState::Starting;
        }

        let group = consumer_group_name(&self.topic);
        info!(topic = %self.topic, group = %group, "Starting indexer");

        let reader = match self.transport.subscribe(&self.topic, &group).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(topic = %self.topic, error = %e, "Failed to subscribe");
                self.inner.lock().state = ProcessorState::Created;
                return Err(IndexerError::SubscribeError(e));
            }
        };

        let pipeline = RunningPipeline::launch(PipelineParts {
            reader,
            config: self.config.clone(),
            provider: self.provider.clone(),
            decoder: self.decoder.clone(),
            dead_letters: self.dead_letters.clone(),
            metrics: self.metrics.clone(),
        });

        let mut inner = self.inner.lock();
        inner.committer = Some(pipeline.committer());
        inner.pipeline = Some(pipeline);
        inner.state = ProcessorState::Running;
        info!(topic = %self.topic, "Indexer running");
        Ok(())
    }

    /// Stop reading, wait for in-flight work within the shutdown grace
    /// period, and stop the pipeline.
    ///
    /// Returns [`IndexerError::ShutdownTimeout`] if some mutations were
    /// still unresolved when the grace period ran out. Their positions are
    /// not acknowledged, so they are read again on the next start.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        let pipeline = {
            let mut inner = self.inner.lock();
            if inner.state != ProcessorState::Running {
                warn!(state = %inner.state, "Indexer is not running, nothing to stop");
                return Ok(());
            }
            inner.state = ProcessorState::Stopping;
            inner.pipeline.take()
        };

        let Some(pipeline) = pipeline else {
            self.inner.lock().state = ProcessorState::Stopped;
            return Ok(());
        };

        let grace = self.config.current().shutdown_grace;
        info!(topic = %self.topic, grace_ms = grace.as_millis() as u64, "Stopping indexer");
        let abandoned = pipeline.shutdown(grace).await;

        self.inner.lock().state = ProcessorState::Stopped;
        let totals = self.metrics.snapshot();
        info!(
            records_read = totals.records_read,
            accepted = totals.accepted,
            terminal_failures = totals.terminal_failures,
            decode_failures = totals.decode_failures,
            "Indexer stopped"
        );

        if abandoned > 0 {
            error!(
                abandoned = abandoned,
                "Stopped with unresolved mutations, they will be read again"
            );
            return Err(IndexerError::ShutdownTimeout { abandoned });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicConfig;
    use crate::consumer::{Record, StreamReader};
    use crate::errors::IngestError;
    use crate::loader::tests::ScriptedProvider;
    use async_trait::async_trait;
    use stream_indexer_shared::StreamPosition;

    struct IdleReader;

    #[async_trait]
    impl StreamReader for IdleReader {
        async fn next(&self) -> Result<Record, IngestError> {
            std::future::pending().await
        }

        async fn acknowledge(&self, _: StreamPosition) -> Result<(), IngestError> {
            Ok(())
        }
    }

    struct StubTransport {
        fail: bool,
    }

    #[async_trait]
    impl MessageTransport for StubTransport {
        async fn subscribe(
            &self,
            topic: &str,
            group: &str,
        ) -> Result<Arc<dyn StreamReader>, IngestError> {
            assert_eq!(group, format!("{}-consumer", topic));
            if self.fail {
                return Err(IngestError::transport("no brokers"));
            }
            Ok(Arc::new(IdleReader))
        }
    }

    fn indexer(config: DynamicConfig, fail: bool) -> Indexer {
        Indexer::new(
            "visibility",
            Arc::new(config),
            Arc::new(StubTransport { fail }),
            Arc::new(ScriptedProvider::default()),
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessorState::Running.to_string(), "running");
        assert_eq!(
            IndexerError::AlreadyRunning(ProcessorState::Running).to_string(),
            "Indexer is already running"
        );
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let indexer = indexer(DynamicConfig::default(), false);
        assert_eq!(indexer.state(), ProcessorState::Created);

        indexer.start().await.unwrap();
        assert_eq!(indexer.state(), ProcessorState::Running);
        assert!(matches!(
            indexer.start().await,
            Err(IndexerError::AlreadyRunning(ProcessorState::Running))
        ));

        indexer.stop().await.unwrap();
        assert_eq!(indexer.state(), ProcessorState::Stopped);
        assert_eq!(indexer.health().outstanding, 0);
    }

    #[tokio::test]
    async fn test_disabled_indexer_stays_created() {
        let config = DynamicConfig::default();
        config.update(|c| c.enabled = false);
        let indexer = indexer(config, false);

        indexer.start().await.unwrap();
        assert_eq!(indexer.state(), ProcessorState::Created);
        indexer.stop().await.unwrap();
        assert_eq!(indexer.state(), ProcessorState::Created);
    }

    #[tokio::test]
    async fn test_subscribe_failure_returns_to_created() {
        let indexer = indexer(DynamicConfig::default(), true);
        assert!(matches!(
            indexer.start().await,
            Err(IndexerError::SubscribeError(_))
        ));
        assert_eq!(indexer.state(), ProcessorState::Created);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = DynamicConfig::default();
        config.update(|c| c.concurrency = 0);
        let indexer = indexer(config, false);
        assert!(matches!(
            indexer.start().await,
            Err(IndexerError::ConfigError(_))
        ));
        assert_eq!(indexer.state(), ProcessorState::Created);
    }
}
