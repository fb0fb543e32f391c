//! Search index provider trait definition.
//!
//! This module defines the abstract interface for search index operations,
//! allowing for different backend implementations (OpenSearch, Elasticsearch, etc.).

use async_trait::async_trait;

use crate::errors::SearchIndexError;
use crate::types::{BulkItemResponse, BulkOperation};

/// Abstracts the underlying search index implementation (OpenSearch, Elasticsearch, etc.).
///
/// The stream indexer only ever writes through `bulk`. Implementations are
/// injected into the pipeline's submitter so tests can substitute an in-memory
/// index.
///
/// # Index Initialization
///
/// Implementations should call `ensure_index_exists` during application startup to ensure
/// the search index and any aliases are properly configured before performing document operations.
#[async_trait]
pub trait SearchIndexProvider: Send + Sync {
    /// Ensure the search index and any required aliases exist, creating them if necessary.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the index is ready for use
    /// * `Err(SearchIndexError)` - If initialization fails
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError>;

    /// Submit a list of operations as one bulk request.
    ///
    /// The index evaluates every operation independently. On success the
    /// returned vector is parallel to `operations`: entry `i` describes the
    /// outcome of `operations[i]`. A response may be shorter than the request
    /// if the backend truncated it; callers must treat missing entries as
    /// unresolved.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<BulkItemResponse>)` - Per-operation outcomes
    /// * `Err(SearchIndexError)` - If the request as a whole failed and no
    ///   operation can be assumed to have been applied
    async fn bulk(
        &self,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResponse>, SearchIndexError>;
}
