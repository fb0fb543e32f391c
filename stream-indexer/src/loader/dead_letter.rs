//! Dead-letter publishing for mutations the index will never accept.

use async_trait::async_trait;
use rdkafka::{
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use serde_json::{json, Value};
use std::time::Duration;
use stream_indexer_shared::Mutation;
use tracing::{debug, info};

use crate::consumer::KafkaConsumerConfig;
use crate::errors::IngestError;

/// How long a dead-letter publish may wait for delivery.
const DEAD_LETTER_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for terminally failed mutations.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publish a failed mutation. Returns `false` if the sink discards it.
    async fn publish(
        &self,
        mutation: &Mutation,
        reason: &str,
        attempts: u32,
    ) -> Result<bool, IngestError>;
}

/// Sink used when no dead-letter topic is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDeadLetterSink;

#[async_trait]
impl DeadLetterSink for NoopDeadLetterSink {
    async fn publish(&self, _: &Mutation, _: &str, _: u32) -> Result<bool, IngestError> {
        Ok(false)
    }
}

/// Dead-letter topic for an input topic.
pub fn dead_letter_topic_name(topic: &str) -> String {
    format!("{}-dlq", topic)
}

/// Body of a dead-letter record.
///
/// The original document is embedded as JSON when it parses, and as a lossy
/// string otherwise.
pub fn dead_letter_envelope(mutation: &Mutation, reason: &str, attempts: u32) -> Value {
    let document = if mutation.payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&mutation.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&mutation.payload).into_owned()))
    };

    json!({
        "document_id": mutation.document_id,
        "operation": mutation.kind.as_str(),
        "version": mutation.version,
        "partition": mutation.position.partition,
        "offset": mutation.position.offset,
        "attempts": attempts,
        "reason": reason,
        "decoded_at": mutation.decoded_at,
        "document": document,
    })
}

/// Publishes dead letters to a Kafka topic, keyed by document id.
pub struct KafkaDeadLetterProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterProducer {
    pub fn new(config: &KafkaConsumerConfig, topic: impl Into<String>) -> Result<Self, IngestError> {
        let topic = topic.into();
        let producer: FutureProducer = config
            .client_config()
            .set("client.id", "stream-indexer-dlq")
            .set("compression.type", "zstd")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| IngestError::dead_letter(e.to_string()))?;

        info!(topic = %topic, "Created dead letter producer");
        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterProducer {
    async fn publish(
        &self,
        mutation: &Mutation,
        reason: &str,
        attempts: u32,
    ) -> Result<bool, IngestError> {
        let body = dead_letter_envelope(mutation, reason, attempts).to_string();
        let attempts_header = attempts.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dlq-reason",
                value: Some(reason),
            })
            .insert(Header {
                key: "dlq-attempts",
                value: Some(attempts_header.as_str()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(mutation.document_id.as_str())
            .payload(body.as_str())
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, DEAD_LETTER_DELIVERY_TIMEOUT)
            .await
            .map_err(|(err, _)| IngestError::dead_letter(err.to_string()))?;

        debug!(
            document_id = %mutation.document_id,
            dlq_partition = partition,
            dlq_offset = offset,
            "Published dead letter"
        );
        Ok(true)
    }
}
