//! OpenSearch index configuration.
//!
//! Document mappings are owned by whoever manages the index schema; this module
//! only describes where documents go and the settings used when the indexer
//! has to create a missing index itself.

use serde_json::{json, Value};
use std::time::Duration;

/// Default timeout for a single request against the cluster.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the search index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// The alias name for the search index (used for all operations).
    pub alias: String,
    /// The version number for the index (e.g., 0 for "visibility_v0").
    pub version: u32,
    /// Timeout applied to every request.
    pub request_timeout: Duration,
}

impl IndexConfig {
    /// Create a new index configuration.
    ///
    /// # Arguments
    ///
    /// * `alias` - The index alias name
    /// * `version` - The version number
    pub fn new(alias: impl Into<String>, version: u32) -> Self {
        Self {
            alias: alias.into(),
            version,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Name of the concrete index behind the alias (e.g. "visibility_v0").
    pub fn versioned_index_name(&self) -> String {
        format!("{}_v{}", self.alias, self.version)
    }

    /// Body used to create the concrete index with its alias attached.
    pub fn create_index_body(&self) -> Value {
        json!({
            "settings": {
                "number_of_shards": 1,
                "number_of_replicas": 1
            },
            "aliases": {
                (self.alias.clone()): {}
            }
        })
    }
}
