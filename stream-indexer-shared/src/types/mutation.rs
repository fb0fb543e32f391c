//! Document mutation types.
//!
//! A `Mutation` is the decoded unit of work produced for every stream record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::position::StreamPosition;

/// `{"` + `":{"_id":` + `}}` + newline around the action name and id.
const ACTION_LINE_FRAME: usize = 2 + 9 + 2 + 1;

/// `,"version":` + `,"version_type":"external"` around the version digits.
const VERSION_FRAME: usize = 11 + 26;

/// Kind of change a mutation applies to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Create the document, or replace it if it exists.
    Upsert,
    /// Remove the document.
    Delete,
}

impl MutationKind {
    /// Lowercase name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Upsert => "upsert",
            MutationKind::Delete => "delete",
        }
    }

    /// Name of the bulk action that applies this kind.
    pub fn bulk_action(&self) -> &'static str {
        match self {
            MutationKind::Upsert => "index",
            MutationKind::Delete => "delete",
        }
    }
}

/// A decoded document mutation tied to the record it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Identifier of the document in the search index.
    pub document_id: String,
    /// Operation to perform.
    pub kind: MutationKind,
    /// Serialized JSON document body. Empty for deletes.
    pub payload: Vec<u8>,
    /// External document version, used to reject stale writes at the index.
    ///
    /// Without a version the index applies writes in the order they arrive.
    /// A retried mutation goes back behind later mutations of the same
    /// document, and concurrent batches may complete in any order, so an
    /// unversioned document can end up holding an older state. Producers
    /// that need last-writer-wins semantics must set a version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Position of the originating record.
    pub position: StreamPosition,
    /// When the mutation was decoded.
    pub decoded_at: DateTime<Utc>,
}

impl Mutation {
    /// Create an upsert mutation.
    pub fn upsert(
        document_id: impl Into<String>,
        payload: Vec<u8>,
        version: Option<i64>,
        position: StreamPosition,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            kind: MutationKind::Upsert,
            payload,
            version,
            position,
            decoded_at: Utc::now(),
        }
    }

    /// Create a delete mutation.
    pub fn delete(
        document_id: impl Into<String>,
        version: Option<i64>,
        position: StreamPosition,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            kind: MutationKind::Delete,
            payload: Vec::new(),
            version,
            position,
            decoded_at: Utc::now(),
        }
    }

    /// Number of bytes this mutation adds to a bulk request body.
    ///
    /// Counts the action line `{"<action>":{"_id":<id>[,"version":N,"version_type":"external"]}}`
    /// with the id JSON-escaped, and for upserts the source line. Both lines
    /// end with a newline. The payload is assumed to be compact JSON.
    pub fn size_in_bytes(&self) -> usize {
        let escaped_id = serde_json::to_string(&self.document_id)
            .map(|id| id.len())
            .unwrap_or(self.document_id.len() + 2);

        let mut size = ACTION_LINE_FRAME + self.kind.bulk_action().len() + escaped_id;
        if let Some(version) = self.version {
            size += VERSION_FRAME + version.to_string().len();
        }
        if self.kind == MutationKind::Upsert {
            size += self.payload.len() + 1;
        }
        size
    }
}
