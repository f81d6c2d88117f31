//! RecordStore trait: the external tabular store (spreadsheet-like).
//!
//! The store has no transactional guarantees and `upsert` is not
//! idempotent, so callers always send complete rows and route every write
//! through the write queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One row: column name → value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Store-specific write options, passed through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertOptions {
    /// Opaque properties understood by the concrete store
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl UpsertOptions {
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// The external record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// The backend name (e.g., "appsheet", "in_memory").
    fn name(&self) -> &str;

    /// Insert or update complete rows; returns the rows as stored.
    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Row>,
        options: &UpsertOptions,
    ) -> std::result::Result<Vec<Row>, StoreError>;

    /// Read every row of a table.
    async fn rows(&self, table: &str) -> std::result::Result<Vec<Row>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder_adds_properties() {
        let opts = UpsertOptions::default().with_property("Locale", "es-CO".into());
        assert_eq!(opts.properties["Locale"], "es-CO");
    }
}
