//! # Stream Indexer
//!
//! Bulk indexing processor that consumes records from a partitioned Kafka
//! topic and reflects them in an OpenSearch index.
//!
//! ## Architecture
//!
//! Records flow through a chain of tokio tasks connected by channels:
//!
//! 1. **Consumer**: Reads records and acknowledges checkpointed positions
//! 2. **Processor**: Decodes each record into a document mutation
//! 3. **Accumulator**: Groups mutations into batches bounded by count, size and time
//! 4. **Loader**: Submits batches as bulk requests and classifies per-item outcomes
//! 5. **Retry**: Re-queues retryable items with exponential backoff
//! 6. **Checkpoint**: Advances per-partition offsets once every earlier mutation is resolved
//! 7. **Orchestrator**: Starts, stops and reports on the pipeline
//!
//! ## Modules
//!
//! - [`accumulator`]: Batch buffering and the accumulator task
//! - [`checkpoint`]: Out-of-order safe offset tracking
//! - [`config`]: Settings, live configuration and dependency wiring
//! - [`consumer`]: Stream reader traits and the Kafka implementation
//! - [`errors`]: Error types for the pipeline
//! - [`loader`]: Bulk submission and dead-letter publishing
//! - [`metrics`]: Counters and progress reporting
//! - [`orchestrator`]: The [`Indexer`] lifecycle
//! - [`processor`]: Record decoding
//! - [`retry`]: Retry policy and coordinator

pub mod accumulator;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod loader;
pub mod metrics;
pub mod orchestrator;
pub mod processor;
pub mod retry;

pub use config::{Dependencies, DynamicConfig, IndexerConfig};
pub use errors::{DecodeError, IngestError};
pub use orchestrator::{HealthStatus, Indexer, ProcessorState};

use thiserror::Error;

/// Errors returned by the indexer lifecycle.
#[derive(Error, Debug)]
pub enum IndexerError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// `start` was called while a pipeline is already active.
    #[error("Indexer is already {0}")]
    AlreadyRunning(ProcessorState),

    /// Subscribing to the topic failed.
    #[error("Failed to subscribe: {0}")]
    SubscribeError(IngestError),

    /// `stop` gave up on in-flight work after the grace period.
    #[error("Shutdown timed out with {abandoned} unresolved mutations")]
    ShutdownTimeout {
        /// Positions that were neither accepted nor terminally failed.
        abandoned: usize,
    },

    /// Ingest error.
    #[error("Ingest error: {0}")]
    IngestError(#[from] IngestError),
}

impl IndexerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
