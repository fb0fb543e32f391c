//! Configuration and dependency initialization.

mod dependencies;
mod settings;

pub use dependencies::{ConnectionMode, Dependencies};
pub use settings::{
    ConfigProvider, DynamicConfig, IndexerConfig, DEFAULT_BATCH_QUEUE_CAPACITY,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONCURRENCY, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_MAX_BULK_ACTIONS, DEFAULT_MAX_BULK_BYTES, DEFAULT_MAX_RETRY_ATTEMPTS,
    DEFAULT_PROGRESS_INTERVAL, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_MAX_INTERVAL,
    DEFAULT_RETRY_MULTIPLIER, DEFAULT_SHUTDOWN_GRACE, DEFAULT_WORKER_COUNT,
};
