//! Request and response types for bulk operations.

use serde_json::Value;
use stream_indexer_shared::{Mutation, MutationKind};

use crate::errors::SearchIndexError;

/// The action a bulk operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperationKind {
    /// Index (create or replace) the document.
    Index,
    /// Delete the document.
    Delete,
}

impl BulkOperationKind {
    /// Action name used on the bulk action line.
    pub fn action_name(&self) -> &'static str {
        match self {
            BulkOperationKind::Index => "index",
            BulkOperationKind::Delete => "delete",
        }
    }
}

/// A single operation inside a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    /// The action to perform.
    pub kind: BulkOperationKind,
    /// The document identifier.
    pub document_id: String,
    /// External version. When set, the index rejects writes older than the
    /// version it already holds.
    pub version: Option<i64>,
    /// Document body. Only present for index operations.
    pub source: Option<Value>,
}

impl BulkOperation {
    /// Create an index operation.
    pub fn index(document_id: impl Into<String>, source: Value) -> Self {
        Self {
            kind: BulkOperationKind::Index,
            document_id: document_id.into(),
            version: None,
            source: Some(source),
        }
    }

    /// Create a delete operation.
    pub fn delete(document_id: impl Into<String>) -> Self {
        Self {
            kind: BulkOperationKind::Delete,
            document_id: document_id.into(),
            version: None,
            source: None,
        }
    }

    /// Attach an external version.
    pub fn with_version(mut self, version: Option<i64>) -> Self {
        self.version = version;
        self
    }

    /// Build the bulk operation for a decoded mutation.
    ///
    /// Fails if an upsert payload is not valid JSON.
    pub fn from_mutation(mutation: &Mutation) -> Result<Self, SearchIndexError> {
        let op = match mutation.kind {
            MutationKind::Upsert => {
                let source: Value = serde_json::from_slice(&mutation.payload)
                    .map_err(|e| SearchIndexError::serialization(e.to_string()))?;
                Self::index(mutation.document_id.clone(), source)
            }
            MutationKind::Delete => Self::delete(mutation.document_id.clone()),
        };
        Ok(op.with_version(mutation.version))
    }
}

/// Error detail attached to a rejected bulk item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemError {
    /// Backend error type, e.g. `mapper_parsing_exception`.
    pub error_type: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Outcome of a single operation inside a bulk response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResponse {
    /// The document identifier echoed by the backend, if any.
    pub document_id: Option<String>,
    /// HTTP-like status for this item.
    pub status: u16,
    /// Error detail when the item was rejected.
    pub error: Option<BulkItemError>,
}

impl BulkItemResponse {
    /// A successful item.
    pub fn ok(document_id: impl Into<String>, status: u16) -> Self {
        Self {
            document_id: Some(document_id.into()),
            status,
            error: None,
        }
    }

    /// A rejected item.
    pub fn failed(
        document_id: impl Into<String>,
        status: u16,
        error_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            document_id: Some(document_id.into()),
            status,
            error: Some(BulkItemError {
                error_type: error_type.into(),
                reason: reason.into(),
            }),
        }
    }

    /// Whether the backend applied the operation.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }

    /// Short description of the failure for logs.
    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(err) => format!("{} ({}): {}", err.error_type, self.status, err.reason),
            None => format!("status {}", self.status),
        }
    }
}
