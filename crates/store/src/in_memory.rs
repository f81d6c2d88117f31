//! In-memory stores: useful for testing and ephemeral hosts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use flowbot_core::error::StoreError;
use flowbot_core::message::ConversationId;
use flowbot_core::record::{RecordStore, Row, UpsertOptions};
use flowbot_core::state::{ConversationState, StateStore};
use tokio::sync::RwLock;

/// A record store holding tables as vectors of rows.
///
/// Tables with a key column replace the row whose key matches; other
/// tables append, like the non-idempotent store they stand in for.
pub struct InMemoryRecordStore {
    tables: Arc<RwLock<HashMap<String, Vec<Row>>>>,
    key_columns: HashMap<String, String>,
    broken_tables: Vec<String>,
    failures_left: AtomicU32,
    upserts: AtomicU32,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            key_columns: HashMap::new(),
            broken_tables: Vec::new(),
            failures_left: AtomicU32::new(0),
            upserts: AtomicU32::new(0),
        }
    }

    /// Upserts into `table` replace the row with the same `column` value.
    pub fn with_key_column(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.key_columns.insert(table.into(), column.into());
        self
    }

    /// Fail the next `n` upserts with `StoreError::Unavailable`.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every upsert into `table`.
    pub fn failing_table(mut self, table: impl Into<String>) -> Self {
        self.broken_tables.push(table.into());
        self
    }

    /// Fail the next `n` upserts from now on.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Upsert calls seen so far, failed ones included.
    pub fn upsert_calls(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Seed a table without going through `upsert`.
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Row>,
        _options: &UpsertOptions,
    ) -> Result<Vec<Row>, StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || self.broken_tables.iter().any(|t| t == table) {
            return Err(StoreError::Unavailable(format!(
                "simulated outage writing {table}"
            )));
        }

        let mut tables = self.tables.write().await;
        let stored = tables.entry(table.to_string()).or_default();
        match self.key_columns.get(table) {
            Some(column) => {
                for row in &rows {
                    let key = row.get(column);
                    match stored.iter_mut().find(|r| key.is_some() && r.get(column) == key) {
                        Some(existing) => *existing = row.clone(),
                        None => stored.push(row.clone()),
                    }
                }
            }
            None => stored.extend(rows.iter().cloned()),
        }
        Ok(rows)
    }

    async fn rows(&self, table: &str) -> Result<Vec<Row>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default())
    }
}

/// Conversation states kept in a map, keyed by conversation id.
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<ConversationId, ConversationState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.conversation_id.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(phone: &str, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("TELEFONO".into(), json!(phone));
        row.insert("NOMBRE".into(), json!(name));
        row
    }

    #[tokio::test]
    async fn keyed_table_replaces_matching_row() {
        let store = InMemoryRecordStore::new().with_key_column("CONTACTOS", "TELEFONO");
        let opts = UpsertOptions::default();
        store.upsert("CONTACTOS", vec![row("1", "Ana")], &opts).await.unwrap();
        store.upsert("CONTACTOS", vec![row("2", "Luis")], &opts).await.unwrap();
        store.upsert("CONTACTOS", vec![row("1", "Ana María")], &opts).await.unwrap();

        let rows = store.rows("CONTACTOS").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["NOMBRE"], "Ana María");
    }

    #[tokio::test]
    async fn unkeyed_table_appends() {
        let store = InMemoryRecordStore::new();
        let opts = UpsertOptions::default();
        store.upsert("PEDIDOS", vec![row("1", "a")], &opts).await.unwrap();
        store.upsert("PEDIDOS", vec![row("1", "a")], &opts).await.unwrap();
        assert_eq!(store.rows("PEDIDOS").await.unwrap().len(), 2);
        assert!(store.rows("OTRA").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn simulated_failures_run_out() {
        let store = InMemoryRecordStore::new().failing_first(2);
        let opts = UpsertOptions::default();
        assert!(store.upsert("T", vec![row("1", "a")], &opts).await.is_err());
        assert!(store.upsert("T", vec![row("1", "a")], &opts).await.is_err());
        assert!(store.upsert("T", vec![row("1", "a")], &opts).await.is_ok());
        assert_eq!(store.upsert_calls(), 3);
        assert_eq!(store.rows("T").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_store_creates_then_loads() {
        let store = InMemoryStateStore::new();
        let id = ConversationId::from("573001112233");
        let mut state = store.load_or_create(&id).await.unwrap();
        assert_eq!(state.current_step_index, 0);

        state.jump_to_step(2);
        store.save(&state).await.unwrap();
        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.current_step_index, 2);
    }
}
