//! Error types for the flowbot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! `ProviderError` and `StoreError` are mostly produced outside this
//! workspace: they are the failure vocabulary for host implementations of
//! [`CompletionProvider`](crate::provider::CompletionProvider) and
//! [`RecordStore`](crate::record::RecordStore). flowbot itself only logs
//! them, retries store writes and maps model failures to a fixed reply.

use thiserror::Error;

/// The top-level error type for all flowbot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model completion errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- External record store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Knowledge source errors ---
    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the language-model completion collaborator.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Provider returned an empty completion")]
    EmptyCompletion,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures of the external tabular record store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Upsert into {table} failed: {reason}")]
    UpsertFailed { table: String, reason: String },

    #[error("Read from {table} failed: {reason}")]
    ReadFailed { table: String, reason: String },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Failures fetching the raw knowledge text.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Failed to read knowledge source {source_name}: {reason}")]
    FetchFailed { source_name: String, reason: String },

    #[error("Knowledge source {0} is empty")]
    Empty(String),

    #[error("No knowledge source path configured")]
    NotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn store_and_knowledge_errors_convert_into_top_level() {
        let err: Error = StoreError::UpsertFailed {
            table: "PEDIDOS".into(),
            reason: "quota".into(),
        }
        .into();
        assert!(matches!(err, Error::Store(_)));
        assert!(err.to_string().contains("PEDIDOS"));

        let err: Error = KnowledgeError::NotConfigured.into();
        assert!(err.to_string().contains("No knowledge source path configured"));
    }

    #[test]
    fn store_error_names_table() {
        let err = Error::Store(StoreError::UpsertFailed {
            table: "CONTACTOS".into(),
            reason: "timeout".into(),
        });
        assert!(err.to_string().contains("CONTACTOS"));
        assert!(err.to_string().contains("timeout"));
    }
}
