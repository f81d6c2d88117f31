//! Domain event system: decoupled observation of conversation flow.
//!
//! Events are published when a turn changes the scripted flow or a
//! directive cannot be honoured. Hosts subscribe for dashboards or audits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A directive or the advance signal moved the conversation to another step
    StepChanged {
        conversation_id: String,
        from: usize,
        to: usize,
        timestamp: DateTime<Utc>,
    },

    /// A section directive pulled a knowledge block into context
    SectionActivated {
        conversation_id: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A directive key matched no knowledge block
    DirectiveDropped {
        conversation_id: String,
        raw_key: String,
        timestamp: DateTime<Utc>,
    },

    /// The orchestration loop settled a turn
    TurnSettled {
        conversation_id: String,
        outcome: String,
        completions: u32,
        timestamp: DateTime<Utc>,
    },

    /// A line item was added to the cart
    CartUpdated {
        conversation_id: String,
        sku: String,
        items: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
