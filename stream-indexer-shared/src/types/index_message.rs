//! Wire format of the messages published to the indexing topic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation requested by a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOperation {
    /// Index (upsert) the document.
    Index,
    /// Delete the document.
    Delete,
}

/// A message as published by producers of the indexing topic.
///
/// ```json
/// {"operation": "index", "document_id": "wf-1", "version": 7, "fields": {"status": "open"}}
/// ```
///
/// Fields are left optional at the serde level so that the decoder can report
/// exactly which required field was missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
}

impl IndexMessage {
    /// Build an index message.
    pub fn index(document_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            operation: Some("index".to_string()),
            document_id: Some(document_id.into()),
            version: None,
            fields: Some(fields),
        }
    }

    /// Build a delete message.
    pub fn delete(document_id: impl Into<String>) -> Self {
        Self {
            operation: Some("delete".to_string()),
            document_id: Some(document_id.into()),
            version: None,
            fields: None,
        }
    }

    /// Attach an external version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}

impl MessageOperation {
    /// Parse an operation name. Matching is case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "index" | "upsert" => Some(Self::Index),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_message_round_trips_through_json() {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("open"));
        let msg = IndexMessage::index("wf-1", fields).with_version(7);

        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({"operation": "index", "document_id": "wf-1", "version": 7, "fields": {"status": "open"}})
        );
    }

    #[test]
    fn test_delete_message_omits_fields() {
        let encoded = serde_json::to_value(IndexMessage::delete("wf-2")).unwrap();
        assert!(encoded.get("fields").is_none());
        assert!(encoded.get("version").is_none());
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(MessageOperation::parse("INDEX"), Some(MessageOperation::Index));
        assert_eq!(MessageOperation::parse("upsert"), Some(MessageOperation::Index));
        assert_eq!(MessageOperation::parse("delete"), Some(MessageOperation::Delete));
        assert_eq!(MessageOperation::parse("merge"), None);
    }
}
