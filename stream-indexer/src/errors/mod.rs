//! Error types for the stream indexer pipeline.

use thiserror::Error;

/// Errors that can occur while moving records through the pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The message transport failed (subscribe, receive or commit).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Publishing to the dead-letter destination failed.
    #[error("Dead letter error: {0}")]
    DeadLetterError(String),
}

impl IngestError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// Create a dead letter error.
    pub fn dead_letter(msg: impl Into<String>) -> Self {
        Self::DeadLetterError(msg.into())
    }
}

impl From<rdkafka::error::KafkaError> for IngestError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::TransportError(err.to_string())
    }
}

/// Reasons a record could not be turned into a mutation.
///
/// A decode error is terminal for its record: it is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The record carried no payload.
    #[error("Record has an empty payload")]
    EmptyPayload,

    /// The payload is not a well-formed message.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// A required field is absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The message asks for an operation the indexer does not support.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_messages() {
        assert_eq!(
            DecodeError::MissingField("document_id").to_string(),
            "Missing required field: document_id"
        );
        assert_eq!(
            DecodeError::UnknownOperation("merge".to_string()).to_string(),
            "Unknown operation: merge"
        );
    }

    #[test]
    fn test_ingest_error_constructors() {
        assert!(matches!(
            IngestError::transport("broker down"),
            IngestError::TransportError(msg) if msg == "broker down"
        ));
        assert!(matches!(
            IngestError::dead_letter("timeout"),
            IngestError::DeadLetterError(_)
        ));
    }
}
