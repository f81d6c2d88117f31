//! Contact and order writes sharing one queue against a flaky store.

use std::sync::Arc;
use std::time::Duration;

use flowbot_config::AppConfig;
use flowbot_core::record::{RecordStore, Row};
use flowbot_core::state::LineItem;
use flowbot_store::{ContactBook, InMemoryRecordStore, OrderBook, RetryPolicy, WriteQueue};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn contact_then_order_through_one_queue() {
    let config = AppConfig::default();
    let store = Arc::new(
        InMemoryRecordStore::new()
            .with_key_column(config.store.contacts_table.clone(), "TELEFONO")
            .failing_first(2),
    );
    let queue = WriteQueue::new(RetryPolicy::fixed(3, Duration::from_millis(1000)));
    let contacts = ContactBook::from_config(store.clone(), queue.clone(), &config.store);
    let orders = OrderBook::from_config(store.clone(), queue.clone(), &config.store);

    let mut fields = Row::new();
    fields.insert("NOMBRE".into(), json!("Ana"));
    let contact = contacts.upsert_contact("573001", fields).await.unwrap();

    let cart = vec![LineItem {
        sku: "CAF-1".into(),
        name: "Café de origen".into(),
        quantity: 1,
        unit_price: 18000.0,
        category: "bebidas".into(),
    }];
    let placed = orders
        .place_order("573001", &cart, Some(&contact))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(placed.number, 1);
    assert_eq!(store.rows("CONTACTOS").await.unwrap().len(), 1);
    assert_eq!(store.rows("PEDIDOS").await.unwrap()[0]["NOMBRE_COMPLETO_CLIENTE"], "Ana");
    assert_eq!(store.rows("PEDIDOS_DETALLES").await.unwrap().len(), 1);
    // two simulated failures, then contact, header and details
    assert_eq!(store.upsert_calls(), 5);
    assert_eq!(queue.pending(), 0);
}
