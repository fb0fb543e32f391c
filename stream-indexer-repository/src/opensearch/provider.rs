//! OpenSearch provider implementation.
//!
//! This module provides the concrete implementation of `SearchIndexProvider`
//! using the OpenSearch Rust crate's bulk API.

use async_trait::async_trait;
use opensearch::{
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{IndicesCreateParts, IndicesExistsAliasParts},
    BulkParts, OpenSearch,
};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::opensearch::index_config::IndexConfig;
use crate::types::{BulkItemError, BulkItemResponse, BulkOperation, BulkOperationKind};

/// OpenSearch provider implementation.
///
/// # Example
///
/// ```ignore
/// use stream_indexer_repository::opensearch::{IndexConfig, OpenSearchProvider};
/// use stream_indexer_repository::{BulkOperation, SearchIndexProvider};
///
/// let config = IndexConfig::new("visibility", 0);
/// let provider = OpenSearchProvider::new("http://localhost:9200", config).await?;
/// provider.ensure_index_exists().await?;
///
/// let items = provider
///     .bulk(&[BulkOperation::index("wf-1", json!({"status": "open"}))])
///     .await?;
/// assert!(items[0].is_success());
/// ```
pub struct OpenSearchProvider {
    client: OpenSearch,
    index_config: IndexConfig,
}

impl OpenSearchProvider {
    /// Create a new OpenSearch provider connected to the specified URL.
    ///
    /// # Arguments
    ///
    /// * `url` - The OpenSearch server URL (e.g., "http://localhost:9200")
    /// * `index_config` - The index configuration containing alias and version
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchProvider)` - A new provider instance
    /// * `Err(SearchIndexError)` - If connection setup fails
    pub async fn new(url: &str, index_config: IndexConfig) -> Result<Self, SearchIndexError> {
        let parsed_url =
            Url::parse(url).map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .timeout(index_config.request_timeout)
            .build()
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let client = OpenSearch::new(transport);

        info!(
            url = %url,
            alias = %index_config.alias,
            version = index_config.version,
            timeout_ms = index_config.request_timeout.as_millis() as u64,
            "Created OpenSearch provider"
        );

        Ok(Self {
            client,
            index_config,
        })
    }

    /// Build the newline-delimited bulk body: one action line per operation,
    /// followed by the document source for index operations.
    fn build_bulk_body(operations: &[BulkOperation]) -> Vec<Value> {
        let mut body: Vec<Value> = Vec::with_capacity(operations.len() * 2);

        for op in operations {
            let mut meta = Map::new();
            meta.insert("_id".to_string(), json!(op.document_id));
            if let Some(version) = op.version {
                meta.insert("version".to_string(), json!(version));
                meta.insert("version_type".to_string(), json!("external"));
            }

            body.push(json!({ (op.kind.action_name()): meta }));

            if op.kind == BulkOperationKind::Index {
                body.push(op.source.clone().unwrap_or_else(|| json!({})));
            }
        }

        body
    }

    /// Parse the `items` array of a bulk response into per-operation outcomes.
    ///
    /// Each entry is an object with a single key naming the action
    /// (`index`, `delete`, ...). The order matches the request.
    fn parse_bulk_response(body: &Value) -> Result<Vec<BulkItemResponse>, SearchIndexError> {
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| SearchIndexError::parse("bulk response has no items array"))?;

        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            let inner = item
                .as_object()
                .and_then(|obj| obj.values().next())
                .ok_or_else(|| SearchIndexError::parse(format!("malformed bulk item: {}", item)))?;

            let status = inner
                .get("status")
                .and_then(Value::as_u64)
                .map(|s| s as u16)
                .ok_or_else(|| SearchIndexError::parse(format!("bulk item without status: {}", item)))?;

            let document_id = inner
                .get("_id")
                .and_then(Value::as_str)
                .map(str::to_string);

            let error = inner.get("error").map(|err| match err {
                Value::Object(obj) => BulkItemError {
                    error_type: obj
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    reason: obj
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                other => BulkItemError {
                    error_type: "unknown".to_string(),
                    reason: other.to_string(),
                },
            });

            responses.push(BulkItemResponse {
                document_id,
                status,
                error,
            });
        }

        Ok(responses)
    }
}

#[async_trait]
impl SearchIndexProvider for OpenSearchProvider {
    /// Ensure the alias exists, creating the versioned index behind it if not.
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError> {
        let alias = self.index_config.alias.as_str();

        let response = self
            .client
            .indices()
            .exists_alias(IndicesExistsAliasParts::Name(&[alias]))
            .send()
            .await
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        if response.status_code().is_success() {
            debug!(alias = %alias, "Index alias already exists");
            return Ok(());
        }

        let index_name = self.index_config.versioned_index_name();
        info!(alias = %alias, index = %index_name, "Creating index");

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&index_name))
            .body(self.index_config.create_index_body())
            .send()
            .await
            .map_err(|e| SearchIndexError::index_creation(e.to_string()))?;

        let status = response.status_code();
        if status.is_success() {
            return Ok(());
        }

        let error_body = response.text().await.unwrap_or_default();
        // Another indexer instance may have won the race.
        if error_body.contains("resource_already_exists_exception") {
            warn!(index = %index_name, "Index was created concurrently");
            return Ok(());
        }

        error!(status = %status, body = %error_body, "Index creation failed");
        Err(SearchIndexError::index_creation(format!(
            "Create index {} failed with status {}: {}",
            index_name, status, error_body
        )))
    }

    async fn bulk(
        &self,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResponse>, SearchIndexError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let body: Vec<JsonBody<Value>> = Self::build_bulk_body(operations)
            .into_iter()
            .map(JsonBody::new)
            .collect();

        let response = self
            .client
            .bulk(BulkParts::Index(&self.index_config.alias))
            .body(body)
            .send()
            .await
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %error_body, "Bulk request rejected");
            return Err(SearchIndexError::unavailable(status.as_u16(), error_body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;

        let items = Self::parse_bulk_response(&body)?;
        debug!(
            operations = operations.len(),
            items = items.len(),
            errors = body.get("errors").and_then(serde_json::Value::as_bool).unwrap_or(false),
            "Bulk request completed"
        );
        Ok(items)
    }
}
