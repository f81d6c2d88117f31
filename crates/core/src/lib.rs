//! # flowbot Core
//!
//! Domain types, traits, and error definitions for the flowbot scripted
//! conversational agent. Every external collaborator (the language model,
//! the tabular record store, the conversation state store) is described as
//! a trait here; implementations live in their respective crates.
//!
//! Crates depend inward on core:
//! - `flowbot-knowledge` builds the knowledge base
//! - `flowbot-agent` runs conversation turns
//! - `flowbot-store` persists records through the write queue

pub mod error;
pub mod event;
pub mod key;
pub mod message;
pub mod provider;
pub mod record;
pub mod state;

// Re-export key types at crate root for ergonomics
pub use error::{Error, KnowledgeError, ProviderError, Result, StoreError};
pub use event::{DomainEvent, EventBus};
pub use key::normalize_key;
pub use message::{ConversationId, Message, Role};
pub use provider::{CompletionProvider, CompletionRequest, CompletionResponse, Usage};
pub use record::{RecordStore, Row, UpsertOptions};
pub use state::{ConversationState, LineItem, StateStore};
