//! # Stream Indexer Repository
//!
//! This crate provides the trait the stream indexer uses to talk to the search
//! index, the bulk request/response types exchanged through it, and a concrete
//! implementation for OpenSearch.

pub mod errors;
pub mod interfaces;
pub mod opensearch;
pub mod types;
pub mod utils;

pub use errors::SearchIndexError;
pub use interfaces::SearchIndexProvider;
pub use opensearch::OpenSearchProvider;
pub use types::{BulkItemError, BulkItemResponse, BulkOperation, BulkOperationKind};
pub use utils::{is_retryable_error_type, is_retryable_status};
