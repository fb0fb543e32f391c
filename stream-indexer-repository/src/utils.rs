//! Utility functions for interpreting search index responses.

/// Whether a per-item or whole-request status signals a transient condition.
///
/// Request timeout, throttling and every server-side error are worth retrying;
/// all other statuses are permanent for an unchanged document.
///
/// # Example
///
/// ```
/// use stream_indexer_repository::is_retryable_status;
///
/// assert!(is_retryable_status(429));
/// assert!(is_retryable_status(503));
/// assert!(!is_retryable_status(400));
/// ```
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Whether a backend error type signals resource exhaustion rather than a
/// problem with the document itself.
pub fn is_retryable_error_type(error_type: &str) -> bool {
    matches!(
        error_type,
        "es_rejected_execution_exception"
            | "opensearch_rejected_execution_exception"
            | "rejected_execution_exception"
            | "cluster_block_exception"
            | "timeout_exception"
            | "process_cluster_event_timeout_exception"
            | "circuit_breaking_exception"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504, 507] {
            assert!(is_retryable_status(status), "{status} should be retryable");
        }
        for status in [200, 201, 400, 404, 409] {
            assert!(!is_retryable_status(status), "{status} should not be retryable");
        }
    }

    #[test]
    fn test_retryable_error_types() {
        assert!(is_retryable_error_type("es_rejected_execution_exception"));
        assert!(is_retryable_error_type("circuit_breaking_exception"));
        assert!(!is_retryable_error_type("mapper_parsing_exception"));
        assert!(!is_retryable_error_type("version_conflict_engine_exception"));
    }
}
