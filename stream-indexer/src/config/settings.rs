//! Indexer settings and the live configuration provider.

use parking_lot::RwLock;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::IndexerError;

/// Default number of decode workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of concurrent bulk submission workers.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default maximum number of actions in a single bulk request.
pub const DEFAULT_MAX_BULK_ACTIONS: usize = 1000;

/// Default maximum bulk request size (2 MiB).
pub const DEFAULT_MAX_BULK_BYTES: usize = 2 * 1024 * 1024;

/// Default time a buffered mutation may wait before its batch is flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default base interval of the retry backoff.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Default growth factor of the retry backoff.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Default ceiling of a single retry delay.
pub const DEFAULT_RETRY_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of retries before a mutation is given up on.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Default time `stop` waits for in-flight work before abandoning it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Default capacity of the record and mutation channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Default number of sealed batches allowed to wait for a worker.
pub const DEFAULT_BATCH_QUEUE_CAPACITY: usize = 4;

/// Default interval between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Settings for the bulk indexing processor.
///
/// `concurrency` and `worker_count` size the task pools and are read once per
/// `start`. Every other value is read by the component that uses it at the
/// moment it is needed, so updates through a [`ConfigProvider`] apply to the
/// running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexerConfig {
    /// Whether `start` launches the pipeline at all.
    pub enabled: bool,
    /// Number of decode workers. Records are sharded to workers by partition.
    pub concurrency: usize,
    /// Number of bulk submission workers (max in-flight batches).
    pub worker_count: usize,
    /// Maximum number of mutations per batch.
    pub max_bulk_actions: usize,
    /// Maximum estimated size of a batch in bytes.
    pub max_bulk_bytes: usize,
    /// Maximum time the oldest buffered mutation waits before a flush.
    pub flush_interval: Duration,
    /// Base interval of the retry backoff.
    pub retry_interval: Duration,
    /// Growth factor applied per retry attempt.
    pub retry_multiplier: f64,
    /// Ceiling of a single retry delay.
    pub retry_max_interval: Duration,
    /// Number of retries before a mutation becomes a terminal failure.
    pub max_retry_attempts: u32,
    /// Time `stop` waits for in-flight batches and retries.
    pub shutdown_grace: Duration,
    /// Capacity of the record and fresh mutation channels.
    pub channel_capacity: usize,
    /// Capacity of the sealed batch queue.
    pub batch_queue_capacity: usize,
    /// Interval between progress log lines.
    pub progress_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: DEFAULT_CONCURRENCY,
            worker_count: DEFAULT_WORKER_COUNT,
            max_bulk_actions: DEFAULT_MAX_BULK_ACTIONS,
            max_bulk_bytes: DEFAULT_MAX_BULK_BYTES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_max_interval: DEFAULT_RETRY_MAX_INTERVAL,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_queue_capacity: DEFAULT_BATCH_QUEUE_CAPACITY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl IndexerConfig {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// # Environment Variables
    ///
    /// - `INDEXER_ENABLED`: Launch the pipeline on start (default: true)
    /// - `INDEXER_CONCURRENCY`: Decode workers (default: 4)
    /// - `INDEXER_WORKER_COUNT`: Bulk submission workers (default: 2)
    /// - `INDEXER_MAX_BULK_ACTIONS`: Max mutations per batch (default: 1000)
    /// - `INDEXER_MAX_BULK_BYTES`: Max batch size in bytes (default: 2 MiB)
    /// - `INDEXER_FLUSH_INTERVAL_MS`: Flush interval (default: 1000)
    /// - `INDEXER_RETRY_INTERVAL_MS`: Base retry interval (default: 500)
    /// - `INDEXER_RETRY_MULTIPLIER`: Backoff growth factor (default: 2.0)
    /// - `INDEXER_RETRY_MAX_INTERVAL_MS`: Max retry delay (default: 30000)
    /// - `INDEXER_MAX_RETRY_ATTEMPTS`: Retries before giving up (default: 5)
    /// - `INDEXER_SHUTDOWN_GRACE_MS`: Drain timeout on stop (default: 30000)
    /// - `INDEXER_CHANNEL_CAPACITY`: Record channel capacity (default: 1000)
    /// - `INDEXER_BATCH_QUEUE_CAPACITY`: Sealed batch queue capacity (default: 4)
    /// - `INDEXER_PROGRESS_INTERVAL_SECS`: Progress log interval (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_or("INDEXER_ENABLED", defaults.enabled),
            concurrency: env_or("INDEXER_CONCURRENCY", defaults.concurrency),
            worker_count: env_or("INDEXER_WORKER_COUNT", defaults.worker_count),
            max_bulk_actions: env_or("INDEXER_MAX_BULK_ACTIONS", defaults.max_bulk_actions),
            max_bulk_bytes: env_or("INDEXER_MAX_BULK_BYTES", defaults.max_bulk_bytes),
            flush_interval: env_millis("INDEXER_FLUSH_INTERVAL_MS", defaults.flush_interval),
            retry_interval: env_millis("INDEXER_RETRY_INTERVAL_MS", defaults.retry_interval),
            retry_multiplier: env_or("INDEXER_RETRY_MULTIPLIER", defaults.retry_multiplier),
            retry_max_interval: env_millis(
                "INDEXER_RETRY_MAX_INTERVAL_MS",
                defaults.retry_max_interval,
            ),
            max_retry_attempts: env_or("INDEXER_MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
            shutdown_grace: env_millis("INDEXER_SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            channel_capacity: env_or("INDEXER_CHANNEL_CAPACITY", defaults.channel_capacity),
            batch_queue_capacity: env_or(
                "INDEXER_BATCH_QUEUE_CAPACITY",
                defaults.batch_queue_capacity,
            ),
            progress_interval: env::var("INDEXER_PROGRESS_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.progress_interval),
        }
    }

    /// Check that the settings describe a runnable pipeline.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let positive = [
            ("concurrency", self.concurrency),
            ("worker_count", self.worker_count),
            ("max_bulk_actions", self.max_bulk_actions),
            ("max_bulk_bytes", self.max_bulk_bytes),
            ("channel_capacity", self.channel_capacity),
            ("batch_queue_capacity", self.batch_queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IndexerError::config(format!("{} must be greater than 0", name)));
            }
        }

        if self.flush_interval.is_zero() {
            return Err(IndexerError::config("flush_interval must be greater than 0"));
        }

        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(IndexerError::config(format!(
                "retry_multiplier must be a finite value >= 1.0, got {}",
                self.retry_multiplier
            )));
        }

        if self.retry_max_interval < self.retry_interval {
            return Err(IndexerError::config(
                "retry_max_interval must not be smaller than retry_interval",
            ));
        }

        Ok(())
    }
}

/// Read a parsable environment variable, warning and falling back on bad input.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Source of the current indexer settings.
///
/// Implementations may change the returned value at any time; callers must
/// not cache it beyond the decision they are making.
pub trait ConfigProvider: Send + Sync {
    /// The settings in effect right now.
    fn current(&self) -> IndexerConfig;
}

/// Settings shared between the indexer and whatever owns its configuration.
///
/// Cloning yields another handle to the same settings.
#[derive(Debug, Clone, Default)]
pub struct DynamicConfig {
    inner: Arc<RwLock<IndexerConfig>>,
}

impl DynamicConfig {
    /// Wrap an initial configuration.
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Replace the settings.
    pub fn set(&self, config: IndexerConfig) {
        *self.inner.write() = config;
    }

    /// Replace the settings if `config` is valid. Invalid settings are
    /// rejected and the current ones stay in effect.
    pub fn reload(&self, config: IndexerConfig) -> Result<(), IndexerError> {
        config.validate()?;
        self.set(config);
        Ok(())
    }

    /// Modify the settings in place.
    pub fn update(&self, f: impl FnOnce(&mut IndexerConfig)) {
        f(&mut *self.inner.write());
    }
}

impl ConfigProvider for DynamicConfig {
    fn current(&self) -> IndexerConfig {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(IndexerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = IndexerConfig {
            worker_count: 0,
            ..IndexerConfig::default()
        };
        assert!(matches!(config.validate(), Err(IndexerError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let config = IndexerConfig {
            retry_multiplier: 0.5,
            ..IndexerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_retry_bounds() {
        let config = IndexerConfig {
            retry_interval: Duration::from_secs(10),
            retry_max_interval: Duration::from_secs(1),
            ..IndexerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dynamic_config_updates_are_visible_to_clones() {
        let config = DynamicConfig::new(IndexerConfig::default());
        let handle = config.clone();

        config.update(|c| {
            c.enabled = false;
            c.max_bulk_actions = 7;
        });

        let current = handle.current();
        assert!(!current.enabled);
        assert_eq!(current.max_bulk_actions, 7);
    }

    #[test]
    fn test_reload_applies_valid_settings_only() {
        let config = DynamicConfig::new(IndexerConfig::default());
        let handle = config.clone();

        let larger = IndexerConfig {
            max_bulk_actions: 5000,
            ..IndexerConfig::default()
        };
        config.reload(larger).unwrap();
        assert_eq!(handle.current().max_bulk_actions, 5000);

        let broken = IndexerConfig {
            worker_count: 0,
            ..IndexerConfig::default()
        };
        assert!(matches!(
            config.reload(broken),
            Err(IndexerError::ConfigError(_))
        ));
        assert_eq!(handle.current().max_bulk_actions, 5000);
        assert_eq!(handle.current().worker_count, DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("STREAM_INDEXER_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("STREAM_INDEXER_TEST_GARBAGE", 12usize), 12);
        env::set_var("STREAM_INDEXER_TEST_GARBAGE", " 34 ");
        assert_eq!(env_or("STREAM_INDEXER_TEST_GARBAGE", 12usize), 34);
        env::remove_var("STREAM_INDEXER_TEST_GARBAGE");
    }
}
