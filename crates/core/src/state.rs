//! Per-conversation state.
//!
//! The state records where the scripted flow stands (step index or
//! explicitly activated sections), the history, the cart and the hash of
//! the last reply sent. Storage is the host's concern; `StateStore` is the
//! contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::message::{ConversationId, Message};

/// A product line the customer accepted during the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub category: String,
}

impl LineItem {
    pub fn subtotal(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

/// State of one conversation.
///
/// Invariant: `active_sections` and step-driven content are mutually
/// exclusive. Every step change goes through [`jump_to_step`] or
/// [`advance_step`], both of which clear the active sections.
///
/// [`jump_to_step`]: ConversationState::jump_to_step
/// [`advance_step`]: ConversationState::advance_step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: ConversationId,

    /// Zero-based index into the knowledge base's steps
    #[serde(default)]
    pub current_step_index: usize,

    /// Section keys pulled in by directives, in activation order, no duplicates
    #[serde(default)]
    active_sections: Vec<String>,

    #[serde(default)]
    pub history: Vec<Message>,

    #[serde(default)]
    pub cart: Vec<LineItem>,

    /// Products last offered to the customer, as supplied by the host's catalog
    #[serde(default)]
    pub last_suggested_products: Vec<serde_json::Value>,

    /// Hex SHA-256 of the last reply delivered (lowercased)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_emitted_response_hash: Option<String>,
}

impl ConversationState {
    /// Fresh state for the first turn of a conversation: step 0, nothing active.
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            current_step_index: 0,
            active_sections: Vec::new(),
            history: Vec::new(),
            cart: Vec::new(),
            last_suggested_products: Vec::new(),
            last_emitted_response_hash: None,
        }
    }

    pub fn active_sections(&self) -> &[String] {
        &self.active_sections
    }

    /// Insert a section key, preserving activation order.
    /// Returns `false` if it was already active.
    pub fn activate_section(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.active_sections.contains(&key) {
            return false;
        }
        self.active_sections.push(key);
        true
    }

    pub fn clear_sections(&mut self) {
        self.active_sections.clear();
    }

    /// Move to a zero-based step. Active sections are always cleared.
    pub fn jump_to_step(&mut self, index: usize) {
        self.current_step_index = index;
        self.active_sections.clear();
    }

    /// Move to the next step. Active sections are always cleared.
    pub fn advance_step(&mut self) {
        self.jump_to_step(self.current_step_index.saturating_add(1));
    }

    pub fn push_history(&mut self, message: Message) {
        self.history.push(message);
    }

    /// The last `n` history entries, oldest first.
    pub fn recent_history(&self, n: usize) -> &[Message] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Whether `text` is the same reply that was delivered last.
    pub fn is_repeat(&self, text: &str) -> bool {
        self.last_emitted_response_hash.as_deref() == Some(response_hash(text).as_str())
    }

    pub fn remember_response(&mut self, text: &str) {
        self.last_emitted_response_hash = Some(response_hash(text));
    }

    pub fn cart_total(&self) -> f64 {
        self.cart.iter().map(LineItem::subtotal).sum()
    }
}

/// Hex SHA-256 of the trimmed, lowercased reply text.
pub fn response_hash(text: &str) -> String {
    let digest = Sha256::digest(text.trim().to_lowercase().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Storage of conversation states, owned by the host.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> std::result::Result<Option<ConversationState>, StoreError>;

    async fn save(&self, state: &ConversationState) -> std::result::Result<(), StoreError>;

    /// Load the state, or create a fresh one on the first turn.
    async fn load_or_create(
        &self,
        id: &ConversationId,
    ) -> std::result::Result<ConversationState, StoreError> {
        Ok(self
            .load(id)
            .await?
            .unwrap_or_else(|| ConversationState::new(id.clone())))
    }
}
