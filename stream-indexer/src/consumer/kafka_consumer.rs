//! Kafka implementation of the stream reader.
//!
//! Offsets are committed manually and only for positions the checkpoint
//! committer has released, so a restart resumes from the first unresolved
//! record of each partition.

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::Message as KafkaMessage,
    Offset, TopicPartitionList,
};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use stream_indexer_shared::StreamPosition;
use tracing::{debug, info, warn};

use crate::consumer::offset_gap::OffsetGapTracker;
use crate::consumer::{MessageTransport, Record, StreamReader};
use crate::errors::IngestError;

/// Default Kafka broker address.
const DEFAULT_KAFKA_BROKER: &str = "localhost:9092";

/// Default consumer session timeout in milliseconds.
const DEFAULT_SESSION_TIMEOUT_MS: u32 = 6000;

/// How long to wait for the broker when looking up a committed offset.
const COMMITTED_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings shared by the consumer and the dead-letter producer.
#[derive(Debug, Clone)]
pub struct KafkaConsumerConfig {
    /// Kafka broker addresses (comma-separated).
    pub broker: String,
    /// SASL username (enables SASL/SSL if set together with the password).
    pub username: Option<String>,
    /// SASL password.
    pub password: Option<String>,
    /// Custom CA certificate in PEM format.
    pub ssl_ca_pem: Option<String>,
    /// Consumer group session timeout.
    pub session_timeout_ms: u32,
}

impl KafkaConsumerConfig {
    /// Plaintext connection to `broker`.
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            username: None,
            password: None,
            ssl_ca_pem: None,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
        }
    }

    /// Create the configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KAFKA_BROKER` - Broker address (default: localhost:9092)
    /// - `KAFKA_USERNAME` - SASL username (optional)
    /// - `KAFKA_PASSWORD` - SASL password (optional)
    /// - `KAFKA_SSL_CA_PEM` - Custom CA cert in PEM format (optional)
    /// - `KAFKA_SESSION_TIMEOUT_MS` - Session timeout (default: 6000)
    pub fn from_env() -> Self {
        Self {
            broker: env::var("KAFKA_BROKER").unwrap_or_else(|_| DEFAULT_KAFKA_BROKER.to_string()),
            username: env::var("KAFKA_USERNAME").ok(),
            password: env::var("KAFKA_PASSWORD").ok(),
            ssl_ca_pem: env::var("KAFKA_SSL_CA_PEM").ok(),
            session_timeout_ms: env::var("KAFKA_SESSION_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SESSION_TIMEOUT_MS),
        }
    }

    /// Set SASL credentials.
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Base client configuration: brokers plus authentication.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.broker);

        // Managed clusters authenticate with SASL over TLS, local ones are plaintext.
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            client_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);

            if let Some(ca_pem) = &self.ssl_ca_pem {
                client_config.set("ssl.ca.pem", ca_pem);
            }
        }

        client_config
    }

    /// Client configuration for a manually committing consumer in `group`.
    pub fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", self.session_timeout_ms.to_string());
        client_config
    }
}

/// Creates Kafka subscriptions.
pub struct KafkaTransport {
    config: KafkaConsumerConfig,
}

impl KafkaTransport {
    pub fn new(config: KafkaConsumerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MessageTransport for KafkaTransport {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Arc<dyn StreamReader>, IngestError> {
        let consumer: StreamConsumer = self.config.consumer_config(group).create()?;
        consumer.subscribe(&[topic])?;

        info!(
            broker = %self.config.broker,
            topic = %topic,
            group = %group,
            "Subscribed to Kafka topic"
        );

        Ok(Arc::new(KafkaStreamReader::new(consumer, topic)))
    }
}

/// Highest acknowledged offset per partition, recorded once its commit was
/// accepted.
#[derive(Debug, Default)]
struct AcknowledgedOffsets {
    offsets: HashMap<i32, i64>,
}

impl AcknowledgedOffsets {
    fn advances(&self, position: StreamPosition) -> bool {
        self.offsets
            .get(&position.partition)
            .map_or(true, |&last| position.offset > last)
    }

    fn record(&mut self, position: StreamPosition) {
        let last = self.offsets.entry(position.partition).or_insert(position.offset);
        *last = (*last).max(position.offset);
    }

    /// Commit list for every partition. The committed offset is the next one
    /// to read.
    fn commit_list(&self, topic: &str) -> Result<TopicPartitionList, KafkaError> {
        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in &self.offsets {
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        }
        Ok(tpl)
    }
}

/// A Kafka subscription to a single topic.
pub struct KafkaStreamReader {
    consumer: Arc<StreamConsumer>,
    topic: String,
    gaps: Mutex<OffsetGapTracker>,
    acknowledged: Mutex<AcknowledgedOffsets>,
}

impl KafkaStreamReader {
    fn new(consumer: StreamConsumer, topic: &str) -> Self {
        Self {
            consumer: Arc::new(consumer),
            topic: topic.to_string(),
            gaps: Mutex::new(OffsetGapTracker::new()),
            acknowledged: Mutex::new(AcknowledgedOffsets::default()),
        }
    }

    /// The group's committed position for `partition`, if it has one.
    async fn committed_offset(&self, partition: i32) -> Option<i64> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, partition);
        let consumer = self.consumer.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            consumer.committed_offsets(tpl, COMMITTED_LOOKUP_TIMEOUT)
        })
        .await;

        match lookup {
            Ok(Ok(committed)) => committed
                .find_partition(&self.topic, partition)
                .and_then(|elem| match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                }),
            Ok(Err(e)) => {
                warn!(partition = partition, error = %e, "Failed to look up committed offset");
                None
            }
            Err(e) => {
                warn!(partition = partition, error = %e, "Committed offset lookup did not complete");
                None
            }
        }
    }
}

#[async_trait]
impl StreamReader for KafkaStreamReader {
    async fn next(&self) -> Result<Record, IngestError> {
        let record = {
            let msg = self.consumer.recv().await?;
            debug!(
                topic = %msg.topic(),
                partition = msg.partition(),
                offset = msg.offset(),
                "Received message from Kafka"
            );
            Record {
                position: StreamPosition::new(msg.partition(), msg.offset()),
                key: msg.key().map(<[u8]>::to_vec),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            }
        };
        let position = record.position;

        let first_sight = !self.gaps.lock().is_known(position.partition);
        if first_sight {
            if let Some(committed) = self.committed_offset(position.partition).await {
                self.gaps.lock().seed(position.partition, committed);
            }
        }

        let gap = self.gaps.lock().observe(position.partition, position.offset);
        if let Some(gap) = gap {
            if first_sight {
                warn!(
                    topic = %self.topic,
                    partition = gap.partition,
                    missing_from = gap.from,
                    missing_to = gap.to,
                    missing_count = gap.len(),
                    "Committed position is no longer retained, resumed from the oldest available record"
                );
            } else {
                warn!(
                    topic = %self.topic,
                    partition = gap.partition,
                    missing_from = gap.from,
                    missing_to = gap.to,
                    missing_count = gap.len(),
                    "Offsets skipped, records were removed before they could be indexed"
                );
            }
        }

        Ok(record)
    }

    async fn acknowledge(&self, position: StreamPosition) -> Result<(), IngestError> {
        let mut acknowledged = self.acknowledged.lock();
        if !acknowledged.advances(position) {
            return Ok(());
        }

        // The committed offset is the next one to read.
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &self.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        acknowledged.record(position);

        debug!(
            partition = position.partition,
            offset = position.offset,
            "Committed offset"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), IngestError> {
        let (tpl, partitions) = {
            let acknowledged = self.acknowledged.lock();
            (acknowledged.commit_list(&self.topic)?, acknowledged.offsets.len())
        };
        if partitions == 0 {
            return Ok(());
        }

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| IngestError::transport(e.to_string()))??;

        info!(topic = %self.topic, partitions = partitions, "Final offsets committed");
        Ok(())
    }
}
