//! Contact book: one row per phone number in the contacts table.
//!
//! The store is not idempotent, so every write sends the complete row:
//! new contacts get every column (empty by default) plus the first-contact
//! date and default tags; existing ones are merged over the cached row.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use flowbot_config::StoreConfig;
use flowbot_core::error::StoreError;
use flowbot_core::record::{RecordStore, Row, UpsertOptions};
use regex_lite::Regex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::queue::{WriteError, WriteQueue};

/// Columns accepted by the contacts table, in sheet order.
pub const CONTACT_COLUMNS: [&str; 16] = [
    "FECHA_PRIMER_CONTACTO",
    "FECHA_ULTIMO_CONTACTO",
    "TELEFONO",
    "NOMBRE",
    "RESP_BOT",
    "IDENTIFICACION",
    "EMAIL",
    "DIRECCION",
    "DIRECCION_2",
    "CIUDAD",
    "PAIS",
    "ESTADO_DEPARTAMENTO",
    "ETIQUETA",
    "TIPO DE CLIENTE",
    "RESUMEN_ULTIMA_CONVERSACION",
    "NUMERO_DE_TELEFONO_SECUNDARIO",
];

const PHONE: &str = "TELEFONO";
const FIRST_CONTACT: &str = "FECHA_PRIMER_CONTACTO";
const LAST_CONTACT: &str = "FECHA_ULTIMO_CONTACTO";
const SUMMARY: &str = "RESUMEN_ULTIMA_CONVERSACION";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:me llamo|mi nombre es)[ \t]+([^\d\n,.;:!?¿¡]+)").expect("name pattern is valid")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern is valid")
});

/// Today's date as the contacts sheet expects it.
fn today() -> String {
    chrono::Local::now().format("%d/%m/%Y").to_string()
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// A full row for a contact seen for the first time.
fn new_contact_row(phone: &str, date: &str) -> Row {
    let mut row: Row = CONTACT_COLUMNS
        .iter()
        .map(|c| (c.to_string(), Value::String(String::new())))
        .collect();
    row.insert(FIRST_CONTACT.into(), Value::from(date));
    row.insert("ETIQUETA".into(), Value::from("Nuevo"));
    row.insert("RESP_BOT".into(), Value::from("Sí"));
    row.insert(PHONE.into(), Value::from(phone));
    row
}

/// Summaries that are too short or look like leaked JSON are not stored.
fn is_usable_summary(summary: &str) -> bool {
    let trimmed = summary.trim();
    if trimmed.chars().count() < 5 {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !(trimmed.starts_with('{')
        || lower.contains("```json")
        || lower.contains("\"nombre\"")
        || lower.contains("\"email\""))
}

/// Pull a name and an e-mail address out of a customer message.
///
/// The name is whatever follows "me llamo" / "mi nombre es" up to the next
/// punctuation, capped at four words; the e-mail is the first address found.
pub fn extract_contact_fields(message: &str) -> Row {
    let mut fields = Row::new();

    if let Some(caps) = NAME_RE.captures(message) {
        let name = caps
            .get(1)
            .map(|m| m.as_str().split_whitespace().take(4).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        if !name.is_empty() {
            fields.insert("NOMBRE".into(), Value::from(name));
        }
    }
    if let Some(email) = EMAIL_RE.find(message) {
        fields.insert("EMAIL".into(), Value::from(email.as_str().to_lowercase()));
    }

    fields
}

/// Contacts keyed by phone: a local cache in front of the record store.
pub struct ContactBook {
    store: Arc<dyn RecordStore>,
    queue: WriteQueue,
    table: String,
    cache: RwLock<HashMap<String, Row>>,
}

impl ContactBook {
    pub fn new(store: Arc<dyn RecordStore>, queue: WriteQueue, table: impl Into<String>) -> Self {
        Self {
            store,
            queue,
            table: table.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(store: Arc<dyn RecordStore>, queue: WriteQueue, config: &StoreConfig) -> Self {
        Self::new(store, queue, config.contacts_table.clone())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fill the cache from the store. Returns the number of contacts loaded.
    pub async fn warm_cache(&self) -> Result<usize, StoreError> {
        let rows = self.store.rows(&self.table).await?;
        let mut cache = self.cache.write().await;
        for row in rows {
            if let Some(phone) = row.get(PHONE).and_then(Value::as_str) {
                cache.insert(phone.to_string(), row.clone());
            }
        }
        info!(table = %self.table, contacts = cache.len(), "Contact cache loaded");
        Ok(cache.len())
    }

    /// The cached row for `phone`.
    pub async fn contact(&self, phone: &str) -> Option<Row> {
        self.cache.read().await.get(phone).cloned()
    }

    /// Create or update a contact with `fields`.
    ///
    /// Unknown columns and blank values are ignored. On failure the cached
    /// row stays as it was and the error is returned.
    pub async fn upsert_contact(&self, phone: &str, fields: Row) -> Result<Row, WriteError> {
        let date = today();
        let mut row = match self.contact(phone).await {
            Some(existing) => existing,
            None => {
                debug!(phone, "New contact");
                new_contact_row(phone, &date)
            }
        };

        for (column, value) in fields {
            if !CONTACT_COLUMNS.contains(&column.as_str()) {
                debug!(phone, column = %column, "Ignoring unknown contact column");
                continue;
            }
            if is_blank(&value) {
                continue;
            }
            row.insert(column, value);
        }
        row.insert(LAST_CONTACT.into(), Value::from(date));
        row.insert(PHONE.into(), Value::from(phone));

        match self.write(phone, "upsert", row.clone()).await {
            Ok(_) => {
                self.cache.write().await.insert(phone.to_string(), row.clone());
                info!(phone, table = %self.table, "Contact saved");
                Ok(row)
            }
            Err(e) => {
                error!(
                    phone,
                    table = %self.table,
                    row = ?row,
                    error = %e,
                    "Contact upsert failed, keeping previous cache entry"
                );
                Err(e)
            }
        }
    }

    /// Stamp the last-contact date (and the first-contact date if missing).
    ///
    /// The cache is updated even when the write fails.
    pub async fn touch_dates(&self, phone: &str) -> Result<(), WriteError> {
        let date = today();
        let mut row = self
            .contact(phone)
            .await
            .unwrap_or_else(|| new_contact_row(phone, &date));
        if row.get(FIRST_CONTACT).is_none_or(is_blank) {
            row.insert(FIRST_CONTACT.into(), Value::from(date.as_str()));
        }
        row.insert(LAST_CONTACT.into(), Value::from(date));

        self.persist_for_continuity(phone, "dates", row).await
    }

    /// Store the last-conversation summary. Returns `Ok(false)` when the
    /// summary was rejected as unusable.
    ///
    /// The cache is updated even when the write fails.
    pub async fn save_summary(&self, phone: &str, summary: &str) -> Result<bool, WriteError> {
        if !is_usable_summary(summary) {
            warn!(phone, chars = summary.chars().count(), "Summary ignored");
            return Ok(false);
        }
        let date = today();
        let mut row = self
            .contact(phone)
            .await
            .unwrap_or_else(|| new_contact_row(phone, &date));
        row.insert(SUMMARY.into(), Value::from(summary.trim()));
        row.insert(LAST_CONTACT.into(), Value::from(date));

        self.persist_for_continuity(phone, "summary", row).await?;
        Ok(true)
    }

    async fn persist_for_continuity(&self, phone: &str, what: &str, row: Row) -> Result<(), WriteError> {
        let result = self.write(phone, what, row.clone()).await;
        if let Err(e) = &result {
            error!(
                phone,
                table = %self.table,
                row = ?row,
                error = %e,
                "Contact {what} write failed, cache updated anyway"
            );
        }
        self.cache.write().await.insert(phone.to_string(), row);
        result.map(|_| ())
    }

    fn write(
        &self,
        phone: &str,
        what: &str,
        row: Row,
    ) -> impl Future<Output = Result<Vec<Row>, WriteError>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let table = self.table.clone();
        self.queue.enqueue(format!("contacts.{what}:{phone}"), move || {
            let store = Arc::clone(&store);
            let table = table.clone();
            let row = row.clone();
            async move { store.upsert(&table, vec![row], &UpsertOptions::default()).await }
        })
    }
}
