//! Order book: turns a cart into a header row and detail rows.

use std::sync::Arc;

use flowbot_config::StoreConfig;
use flowbot_core::error::StoreError;
use flowbot_core::record::{RecordStore, Row, UpsertOptions};
use flowbot_core::state::LineItem;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::queue::{WriteError, WriteQueue};

const ORDER_NUMBER: &str = "NUMERO_CONSECUTIVO";

/// What was written for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: String,
    pub number: u64,
    /// Customer-facing number, e.g. `PED-007`
    pub visible_number: String,
    pub total: f64,
    pub detail_rows: usize,
}

/// Writes orders to the orders and order-details tables.
pub struct OrderBook {
    store: Arc<dyn RecordStore>,
    queue: WriteQueue,
    orders_table: String,
    details_table: String,
}

impl OrderBook {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: WriteQueue,
        orders_table: impl Into<String>,
        details_table: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            orders_table: orders_table.into(),
            details_table: details_table.into(),
        }
    }

    pub fn from_config(store: Arc<dyn RecordStore>, queue: WriteQueue, config: &StoreConfig) -> Self {
        Self::new(
            store,
            queue,
            config.orders_table.clone(),
            config.order_details_table.clone(),
        )
    }

    /// Highest `NUMERO_CONSECUTIVO` in the orders table plus one; 1 when empty.
    pub async fn next_order_number(&self) -> Result<u64, StoreError> {
        next_number(self.store.as_ref(), &self.orders_table).await
    }

    /// Write the header row, then the detail rows, as two queued tasks.
    ///
    /// The order number is read inside the header task, so two orders
    /// placed back to back never share a number. `contact` supplies the
    /// customer columns; missing ones default to blank.
    pub async fn place_order(
        &self,
        phone: &str,
        cart: &[LineItem],
        contact: Option<&Row>,
    ) -> Result<Option<PlacedOrder>, WriteError> {
        if cart.is_empty() {
            warn!(phone, "Cart is empty, no order placed");
            return Ok(None);
        }

        let now = chrono::Local::now();
        let order_id = format!("PED-{}", now.timestamp_millis());
        let total: f64 = cart.iter().map(LineItem::subtotal).sum();
        let header = header_row(&order_id, phone, total, contact, now);

        let header_snapshot = header.clone();
        let store = Arc::clone(&self.store);
        let table = self.orders_table.clone();
        let number = self
            .queue
            .enqueue(format!("orders.header:{order_id}"), move || {
                let store = Arc::clone(&store);
                let table = table.clone();
                let mut header = header.clone();
                async move {
                    let number = next_number(store.as_ref(), &table).await?;
                    header.insert(ORDER_NUMBER.into(), json!(number));
                    header.insert("NUMERO_PEDIDO_VISIBLE".into(), json!(visible(number)));
                    store.upsert(&table, vec![header], &UpsertOptions::default()).await?;
                    Ok::<_, StoreError>(number)
                }
            })
            .await
            .inspect_err(|e| {
                error!(
                    phone,
                    order_id = %order_id,
                    table = %self.orders_table,
                    row = ?header_snapshot,
                    error = %e,
                    "Order header write failed, nothing was recorded for this order"
                );
            })?;

        let details = detail_rows(&order_id, cart);
        let detail_count = details.len();
        let details_snapshot = details.clone();
        let store = Arc::clone(&self.store);
        let table = self.details_table.clone();
        self.queue
            .enqueue(format!("orders.details:{order_id}"), move || {
                let store = Arc::clone(&store);
                let table = table.clone();
                let details = details.clone();
                async move { store.upsert(&table, details, &UpsertOptions::default()).await }
            })
            .await
            .inspect_err(|e| {
                error!(
                    phone,
                    order_id = %order_id,
                    number,
                    table = %self.details_table,
                    rows = ?details_snapshot,
                    error = %e,
                    "Order detail write failed, header row has no details"
                );
            })?;

        info!(phone, order_id = %order_id, number, items = detail_count, total, "Order placed");
        Ok(Some(PlacedOrder {
            order_id,
            number,
            visible_number: visible(number),
            total,
            detail_rows: detail_count,
        }))
    }
}

async fn next_number(store: &dyn RecordStore, table: &str) -> Result<u64, StoreError> {
    let rows = store.rows(table).await?;
    let max = rows
        .iter()
        .filter_map(|row| match row.get(ORDER_NUMBER)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    Ok(max + 1)
}

fn visible(number: u64) -> String {
    format!("PED-{number:03}")
}

fn header_row(
    order_id: &str,
    phone: &str,
    total: f64,
    contact: Option<&Row>,
    now: chrono::DateTime<chrono::Local>,
) -> Row {
    let field = |column: &str| -> Value {
        contact
            .and_then(|c| c.get(column))
            .filter(|v| v.as_str().is_some_and(|s| !s.trim().is_empty()))
            .cloned()
            .unwrap_or_else(|| json!(""))
    };

    let mut row = Row::new();
    row.insert("ID_PEDIDO".into(), json!(order_id));
    row.insert("FECHA_PEDIDO".into(), json!(now.format("%d/%m/%Y").to_string()));
    row.insert("HORA_PEDIDO".into(), json!(now.format("%H:%M:%S").to_string()));
    row.insert("TELEFONO_REGISTRADO".into(), json!(phone));
    row.insert("NOMBRE_COMPLETO_CLIENTE".into(), field("NOMBRE"));
    row.insert("DIRECCION".into(), field("DIRECCION"));
    row.insert("DIRECCION_2".into(), field("DIRECCION_2"));
    row.insert("CIUDAD".into(), field("CIUDAD"));
    row.insert("DEPARTAMENTO_REGION_ESTADO".into(), field("ESTADO_DEPARTAMENTO"));
    row.insert("PAIS".into(), field("PAIS"));
    row.insert("EMAIL".into(), field("EMAIL"));
    row.insert("TELEFONO".into(), json!(phone));
    row.insert("SUBTOTAL".into(), json!(total));
    row.insert("VALOR_ENVIO".into(), json!(0));
    row.insert("IMPUESTOS".into(), json!(0));
    row.insert("DESCUENTOS".into(), json!(0));
    row.insert("VALOR__TOTAL".into(), json!(total));
    row.insert("FORMA_PAGO".into(), json!("Por definir"));
    row.insert("ESTADO_PAGO".into(), json!("Pendiente de Pago"));
    row.insert("SALDO_PENDIENTE".into(), json!(total));
    row.insert("ESTADO_PEDIDO".into(), json!("Nuevo"));

    // Blank text columns are left out of the header
    row.retain(|_, v| !v.as_str().is_some_and(|s| s.trim().is_empty()));
    row
}

fn detail_rows(order_id: &str, cart: &[LineItem]) -> Vec<Row> {
    cart.iter()
        .enumerate()
        .map(|(i, item)| {
            let mut row = Row::new();
            row.insert("ID_DETALLE".into(), json!(format!("{order_id}-DET-{}", i + 1)));
            row.insert("ID_PEDIDO".into(), json!(order_id));
            row.insert("SKU".into(), json!(if item.sku.is_empty() { "N/A" } else { item.sku.as_str() }));
            row.insert("NOMBRE_PRODUCTO".into(), json!(item.name));
            row.insert("TIPO_PRODUCTO".into(), json!("PRODUCTO"));
            row.insert("CANTIDAD".into(), json!(item.quantity));
            row.insert("PRECIO_UNITARIO".into(), json!(item.unit_price));
            row.insert("TOTAL_PRODUCTOS".into(), json!(item.subtotal()));
            row.insert(
                "CATEGORIA".into(),
                json!(if item.category.is_empty() { "General" } else { item.category.as_str() }),
            );
            row
        })
        .collect()
}
