//! Dependency initialization and wiring for the stream indexer.

use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{DynamicConfig, IndexerConfig};
use crate::consumer::{KafkaConsumerConfig, KafkaTransport};
use crate::loader::{dead_letter_topic_name, DeadLetterSink, KafkaDeadLetterProducer};
use crate::orchestrator::Indexer;
use crate::IndexerError;
use stream_indexer_repository::opensearch::{IndexConfig, DEFAULT_REQUEST_TIMEOUT};
use stream_indexer_repository::{OpenSearchProvider, SearchIndexProvider};

/// Default OpenSearch URL.
const DEFAULT_OPENSEARCH_URL: &str = "http://localhost:9200";

/// Default topic to index.
const DEFAULT_TOPIC: &str = "visibility";

/// Default index alias.
const DEFAULT_INDEX_ALIAS: &str = "visibility";

/// Default connection retry interval in seconds.
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15;

/// Connection mode for OpenSearch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Fail immediately if connection fails.
    FailFast,
    /// Retry the connection until it succeeds.
    Retry,
}

impl ConnectionMode {
    /// Parse a connection mode.
    ///
    /// Valid values: "fail-fast" or "retry" (case-insensitive).
    /// Anything else falls back to "retry".
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "fail-fast" | "failfast" | "fail_fast" => Self::FailFast,
            "retry" => Self::Retry,
            _ => {
                warn!(value = %value, "Invalid OPENSEARCH_CONNECTION_MODE, defaulting to 'retry'");
                Self::Retry
            }
        }
    }

    fn from_env() -> Self {
        env::var("OPENSEARCH_CONNECTION_MODE")
            .map(|v| Self::parse(&v))
            .unwrap_or(Self::Retry)
    }
}

/// Container for all initialized dependencies.
pub struct Dependencies {
    /// The configured indexer, ready to start.
    pub indexer: Indexer,
    /// Live settings shared with `indexer`.
    ///
    /// The indexer only reads them. Whoever holds this handle owns updates:
    /// the binary reloads them on SIGHUP, embedding callers call
    /// [`DynamicConfig::reload`] themselves.
    pub config: DynamicConfig,
}

impl Dependencies {
    /// Initialize all dependencies from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `INDEXER_TOPIC`: Topic to index (default: "visibility")
    /// - `KAFKA_BROKER`, `KAFKA_USERNAME`, `KAFKA_PASSWORD`, `KAFKA_SSL_CA_PEM`: Kafka connection
    /// - `OPENSEARCH_URL`: OpenSearch server URL (default: http://localhost:9200)
    /// - `OPENSEARCH_REQUEST_TIMEOUT_MS`: Per-request timeout (default: 30000)
    /// - `INDEX_ALIAS`: Index alias name (default: "visibility")
    /// - `INDEX_VERSION`: Index version number (default: 0)
    /// - `OPENSEARCH_CONNECTION_MODE`: "fail-fast" or "retry" (default: retry)
    /// - `OPENSEARCH_RETRY_INTERVAL_SECS`: Connection retry interval (default: 15)
    /// - `INDEXER_DEAD_LETTER_TOPIC`: Dead-letter topic (enables dead letters)
    /// - `INDEXER_DEAD_LETTER_ENABLED`: Use "<topic>-dlq" as the dead-letter topic
    /// - `INDEXER_*`: Pipeline settings, see [`IndexerConfig::from_env`]
    ///
    /// # Returns
    ///
    /// * `Ok(Dependencies)` - Initialized dependencies
    /// * `Err(IndexerError)` - If initialization fails (only in fail-fast mode
    ///   for OpenSearch connectivity)
    pub async fn new() -> Result<Self, IndexerError> {
        let topic = env::var("INDEXER_TOPIC").unwrap_or_else(|_| DEFAULT_TOPIC.to_string());
        let opensearch_url =
            env::var("OPENSEARCH_URL").unwrap_or_else(|_| DEFAULT_OPENSEARCH_URL.to_string());
        let connection_mode = ConnectionMode::from_env();
        let retry_interval = env::var("OPENSEARCH_RETRY_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS);
        let kafka_config = KafkaConsumerConfig::from_env();

        let settings = IndexerConfig::from_env();
        settings.validate()?;

        info!(
            topic = %topic,
            opensearch_url = %opensearch_url,
            kafka_broker = %kafka_config.broker,
            connection_mode = ?connection_mode,
            retry_interval_secs = retry_interval,
            "Initializing dependencies"
        );

        let index_alias =
            env::var("INDEX_ALIAS").unwrap_or_else(|_| DEFAULT_INDEX_ALIAS.to_string());
        let index_version = env::var("INDEX_VERSION")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let request_timeout = env::var("OPENSEARCH_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let index_config =
            IndexConfig::new(index_alias, index_version).with_request_timeout(request_timeout);

        let search_provider = Self::connect_to_opensearch(
            &opensearch_url,
            index_config,
            connection_mode,
            Duration::from_secs(retry_interval),
        )
        .await?;

        info!("OpenSearch connection established");

        let transport = KafkaTransport::new(kafka_config.clone());
        let config = DynamicConfig::new(settings);

        let mut indexer = Indexer::new(
            topic.clone(),
            Arc::new(config.clone()),
            Arc::new(transport),
            Arc::new(search_provider),
        );

        if let Some(dlq_topic) = Self::dead_letter_topic(&topic) {
            let producer = KafkaDeadLetterProducer::new(&kafka_config, dlq_topic).map_err(|e| {
                IndexerError::config(format!("Failed to create dead letter producer: {}", e))
            })?;
            let sink: Arc<dyn DeadLetterSink> = Arc::new(producer);
            indexer = indexer.with_dead_letter_sink(sink);
        }

        Ok(Self { indexer, config })
    }

    /// Dead-letter topic, if dead letters are enabled.
    fn dead_letter_topic(topic: &str) -> Option<String> {
        if let Ok(explicit) = env::var("INDEXER_DEAD_LETTER_TOPIC") {
            if !explicit.trim().is_empty() {
                return Some(explicit);
            }
        }

        let enabled = env::var("INDEXER_DEAD_LETTER_ENABLED")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        enabled.then(|| dead_letter_topic_name(topic))
    }

    /// Connect to OpenSearch and make sure the index exists, retrying based
    /// on the connection mode.
    async fn connect_to_opensearch(
        url: &str,
        index_config: IndexConfig,
        mode: ConnectionMode,
        retry_interval: Duration,
    ) -> Result<OpenSearchProvider, IndexerError> {
        loop {
            match Self::try_connect_opensearch(url, index_config.clone()).await {
                Ok(provider) => return Ok(provider),
                Err(e) => match mode {
                    ConnectionMode::FailFast => return Err(e),
                    ConnectionMode::Retry => {
                        warn!(
                            opensearch_url = %url,
                            error = %e,
                            retry_interval_secs = retry_interval.as_secs(),
                            "Failed to connect to OpenSearch, retrying..."
                        );
                        sleep(retry_interval).await;
                    }
                },
            }
        }
    }

    async fn try_connect_opensearch(
        url: &str,
        index_config: IndexConfig,
    ) -> Result<OpenSearchProvider, IndexerError> {
        let search_provider = OpenSearchProvider::new(url, index_config)
            .await
            .map_err(|e| {
                IndexerError::config(format!("Failed to create OpenSearch provider: {}", e))
            })?;

        search_provider
            .ensure_index_exists()
            .await
            .map_err(|e| IndexerError::config(format!("Failed to ensure index exists: {}", e)))?;

        Ok(search_provider)
    }
}
