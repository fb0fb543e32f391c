//! Consumer module for the stream indexer.
//!
//! Defines the stream reader abstraction the pipeline consumes from, and the
//! Kafka implementation of it.

mod kafka_consumer;
mod offset_gap;

pub use kafka_consumer::{KafkaConsumerConfig, KafkaStreamReader, KafkaTransport};
pub use offset_gap::{OffsetGap, OffsetGapTracker};

use async_trait::async_trait;
use std::sync::Arc;
use stream_indexer_shared::StreamPosition;

use crate::errors::IngestError;

/// A raw record read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Where the record was read from.
    pub position: StreamPosition,
    /// Optional record key.
    pub key: Option<Vec<u8>>,
    /// Raw record bytes.
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a record without a key.
    pub fn new(position: StreamPosition, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            position,
            key: None,
            payload: payload.into(),
        }
    }

    /// Attach a key.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A subscription to one topic.
///
/// Records arrive in strict offset order within a partition. Nothing is
/// guaranteed across partitions.
#[async_trait]
pub trait StreamReader: Send + Sync {
    /// Wait for the next record.
    async fn next(&self) -> Result<Record, IngestError>;

    /// Mark `position` and every earlier position of its partition as
    /// processed.
    ///
    /// Acknowledging a position at or below the last acknowledged one for
    /// the partition is a no-op.
    async fn acknowledge(&self, position: StreamPosition) -> Result<(), IngestError>;

    /// Make every acknowledgment so far durable, waiting for the broker.
    ///
    /// Called once when the pipeline stops.
    async fn flush(&self) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Creates stream subscriptions.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Join `group` and subscribe to `topic`.
    async fn subscribe(&self, topic: &str, group: &str)
        -> Result<Arc<dyn StreamReader>, IngestError>;
}

/// Consumer group used by the indexer for a topic.
pub fn consumer_group_name(topic: &str) -> String {
    format!("{}-consumer", topic)
}
