//! Decoder for JSON index messages.

use stream_indexer_shared::{IndexMessage, MessageOperation, Mutation};

use crate::consumer::Record;
use crate::errors::DecodeError;
use crate::processor::Decode;

/// Decodes records carrying an [`IndexMessage`].
///
/// When a message omits `document_id`, a non-empty UTF-8 record key is used
/// instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageDecoder;

impl JsonMessageDecoder {
    pub fn new() -> Self {
        Self
    }

    fn document_id(message: &mut IndexMessage, record: &Record) -> Result<String, DecodeError> {
        if let Some(id) = message.document_id.take().filter(|id| !id.trim().is_empty()) {
            return Ok(id);
        }

        record
            .key
            .as_deref()
            .and_then(|key| std::str::from_utf8(key).ok())
            .filter(|key| !key.trim().is_empty())
            .map(str::to_string)
            .ok_or(DecodeError::MissingField("document_id"))
    }
}

impl Decode for JsonMessageDecoder {
    fn decode(&self, record: &Record) -> Result<Mutation, DecodeError> {
        if record.payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        let mut message: IndexMessage = serde_json::from_slice(&record.payload)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let operation_name = message
            .operation
            .as_deref()
            .ok_or(DecodeError::MissingField("operation"))?;
        let operation = MessageOperation::parse(operation_name)
            .ok_or_else(|| DecodeError::UnknownOperation(operation_name.to_string()))?;

        let document_id = Self::document_id(&mut message, record)?;

        match operation {
            MessageOperation::Index => {
                let fields = message.fields.ok_or(DecodeError::MissingField("fields"))?;
                let payload = serde_json::to_vec(&fields)
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                Ok(Mutation::upsert(
                    document_id,
                    payload,
                    message.version,
                    record.position,
                ))
            }
            MessageOperation::Delete => Ok(Mutation::delete(
                document_id,
                message.version,
                record.position,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use stream_indexer_shared::{MutationKind, StreamPosition};

    fn record(payload: Value) -> Record {
        Record::new(StreamPosition::new(0, 42), payload.to_string().into_bytes())
    }

    #[test]
    fn test_decode_index_message() {
        let mutation = JsonMessageDecoder::new()
            .decode(&record(json!({
                "operation": "index",
                "document_id": "wf-1",
                "version": 3,
                "fields": {"status": "open"}
            })))
            .unwrap();

        assert_eq!(mutation.kind, MutationKind::Upsert);
        assert_eq!(mutation.document_id, "wf-1");
        assert_eq!(mutation.version, Some(3));
        assert_eq!(mutation.position, StreamPosition::new(0, 42));
        let payload: Value = serde_json::from_slice(&mutation.payload).unwrap();
        assert_eq!(payload, json!({"status": "open"}));
    }

    #[test]
    fn test_decode_delete_ignores_fields() {
        let mutation = JsonMessageDecoder::new()
            .decode(&record(json!({
                "operation": "DELETE",
                "document_id": "wf-2",
                "fields": {"ignored": true}
            })))
            .unwrap();

        assert_eq!(mutation.kind, MutationKind::Delete);
        assert!(mutation.payload.is_empty());
        assert_eq!(mutation.version, None);
    }

    #[test]
    fn test_empty_payload() {
        let empty = Record::new(StreamPosition::new(0, 1), Vec::new());
        assert_eq!(
            JsonMessageDecoder::new().decode(&empty),
            Err(DecodeError::EmptyPayload)
        );
    }

    #[test]
    fn test_malformed_payload() {
        let garbage = Record::new(StreamPosition::new(0, 1), b"not json".to_vec());
        assert!(matches!(
            JsonMessageDecoder::new().decode(&garbage),
            Err(DecodeError::Malformed(_))
        ));

        let wrong_shape = record(json!(["index", "wf-1"]));
        assert!(matches!(
            JsonMessageDecoder::new().decode(&wrong_shape),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_fields() {
        let decoder = JsonMessageDecoder::new();

        assert_eq!(
            decoder.decode(&record(json!({"document_id": "wf-1"}))),
            Err(DecodeError::MissingField("operation"))
        );
        assert_eq!(
            decoder.decode(&record(json!({"operation": "index", "fields": {}}))),
            Err(DecodeError::MissingField("document_id"))
        );
        assert_eq!(
            decoder.decode(&record(json!({"operation": "index", "document_id": "  ", "fields": {}}))),
            Err(DecodeError::MissingField("document_id"))
        );
        assert_eq!(
            decoder.decode(&record(json!({"operation": "index", "document_id": "wf-1"}))),
            Err(DecodeError::MissingField("fields"))
        );
    }

    #[test]
    fn test_unknown_operation() {
        assert_eq!(
            JsonMessageDecoder::new().decode(&record(json!({
                "operation": "merge",
                "document_id": "wf-1"
            }))),
            Err(DecodeError::UnknownOperation("merge".to_string()))
        );
    }

    #[test]
    fn test_record_key_supplies_missing_document_id() {
        let keyed = record(json!({"operation": "delete"})).with_key("wf-9");
        let mutation = JsonMessageDecoder::new().decode(&keyed).unwrap();
        assert_eq!(mutation.document_id, "wf-9");
    }
}
