//! One user turn, end to end.
//!
//! Compose, ask, settle the orchestration loop, then the side effects:
//! cart extraction, duplicate suppression and contact bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use flowbot_config::AppConfig;
use flowbot_core::event::{DomainEvent, EventBus};
use flowbot_core::message::Message;
use flowbot_core::provider::CompletionProvider;
use flowbot_core::state::{ConversationState, LineItem};
use flowbot_knowledge::KnowledgeStore;
use flowbot_store::{ContactBook, extract_contact_fields};
use tracing::{debug, info, warn};

use crate::cart::CartExtractor;
use crate::composer::{AuditEntry, ComposeOptions, PromptComposer};
use crate::loop_runner::{LoopOutcome, LoopPhase, OrchestrationLoop};

/// What the host gets back from a turn.
#[derive(Debug, Clone)]
pub struct TurnReply {
    /// The reply to deliver; `None` when it repeats the previous one
    pub text: Option<String>,
    pub phase: LoopPhase,
    pub completions: u32,
    /// The line item added to the cart this turn, if any
    pub cart_item: Option<LineItem>,
    /// Pieces of the first prompt of the turn
    pub audit: Vec<AuditEntry>,
}

impl TurnReply {
    pub fn is_suppressed(&self) -> bool {
        self.text.is_none()
    }
}

/// Runs conversation turns against a shared knowledge store.
pub struct ConversationAgent {
    orchestration: OrchestrationLoop,
    knowledge: Arc<KnowledgeStore>,
    cart: Option<CartExtractor>,
    contacts: Option<Arc<ContactBook>>,
}

impl ConversationAgent {
    /// An agent with default settings and cart extraction enabled.
    pub fn new(provider: Arc<dyn CompletionProvider>, knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            cart: Some(CartExtractor::new(Arc::clone(&provider))),
            orchestration: OrchestrationLoop::new(provider, Arc::new(EventBus::default())),
            knowledge,
            contacts: None,
        }
    }

    pub fn from_config(
        provider: Arc<dyn CompletionProvider>,
        knowledge: Arc<KnowledgeStore>,
        config: &AppConfig,
    ) -> flowbot_core::Result<Self> {
        let orchestration = OrchestrationLoop::from_config(
            Arc::clone(&provider),
            Arc::new(EventBus::default()),
            &config.orchestration,
            &config.model,
        )?;
        let cart = config
            .orchestration
            .cart_extraction
            .then(|| CartExtractor::new(provider).with_model(config.model.clone()));
        Ok(Self {
            orchestration,
            knowledge,
            cart,
            contacts: None,
        })
    }

    /// Record contacts for every turn. The conversation id is the phone.
    pub fn with_contacts(mut self, contacts: Arc<ContactBook>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.orchestration = self.orchestration.with_event_bus(bus);
        self
    }

    /// Turn cart extraction on (with this extractor) or off.
    pub fn with_cart_extraction(mut self, extractor: Option<CartExtractor>) -> Self {
        self.cart = extractor;
        self
    }

    pub fn with_max_completions(mut self, max: u32) -> Self {
        self.orchestration = self.orchestration.with_max_completions(max);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.orchestration.event_bus()
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    /// Handle one user message.
    ///
    /// Never fails: model and store problems end up as a fixed reply or a
    /// log line.
    pub async fn handle_turn(
        &self,
        state: &mut ConversationState,
        user_text: &str,
        options: &ComposeOptions,
    ) -> TurnReply {
        let conversation_id = state.conversation_id.to_string();
        info!(conversation_id = %conversation_id, chars = user_text.chars().count(), "Turn started");

        state.push_history(Message::user(user_text));

        // The snapshot is held for the whole turn; a reload does not affect it
        let kb = self.knowledge.snapshot().await;
        let prompt = PromptComposer::compose(state, &kb, options);
        let audit = prompt.audit.clone();

        let outcome = match self.orchestration.ask(state, prompt.text, user_text).await {
            Ok(initial) => {
                self.orchestration
                    .run(state, &kb, initial, user_text, options)
                    .await
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Model call failed, answering with the apology");
                let outcome = self.orchestration.unavailable();
                self.publish_settled(&conversation_id, &outcome);
                outcome
            }
        };

        let cart_item = if outcome.is_finalized() && outcome.signals.add_to_cart {
            self.extract_cart_item(state, &outcome.reply).await
        } else {
            None
        };

        let text = if state.is_repeat(&outcome.reply) {
            info!(conversation_id = %conversation_id, "Reply repeats the previous one, suppressed");
            None
        } else {
            state.remember_response(&outcome.reply);
            state.push_history(Message::assistant(outcome.reply.clone()));
            Some(outcome.reply)
        };

        if let Some(contacts) = &self.contacts {
            record_contact(contacts, &conversation_id, user_text).await;
        }

        info!(
            conversation_id = %conversation_id,
            phase = outcome.phase.as_str(),
            completions = outcome.completions,
            suppressed = text.is_none(),
            "Turn finished"
        );

        TurnReply {
            text,
            phase: outcome.phase,
            completions: outcome.completions,
            cart_item,
            audit,
        }
    }

    async fn extract_cart_item(&self, state: &mut ConversationState, reply: &str) -> Option<LineItem> {
        let Some(extractor) = &self.cart else {
            debug!(conversation_id = %state.conversation_id, "Add-to-cart signal without an extractor");
            return None;
        };

        let mut excerpt = state
            .recent_history(self.orchestration.model().history_window)
            .to_vec();
        excerpt.push(Message::assistant(reply));
        let item = extractor
            .extract(state.conversation_id.as_str(), &excerpt)
            .await?;

        state.cart.push(item.clone());
        info!(
            conversation_id = %state.conversation_id,
            sku = %item.sku,
            items = state.cart.len(),
            total = state.cart_total(),
            "Cart updated"
        );
        self.events().publish(DomainEvent::CartUpdated {
            conversation_id: state.conversation_id.to_string(),
            sku: item.sku.clone(),
            items: state.cart.len(),
            timestamp: Utc::now(),
        });
        Some(item)
    }

    fn publish_settled(&self, conversation_id: &str, outcome: &LoopOutcome) {
        self.events().publish(DomainEvent::TurnSettled {
            conversation_id: conversation_id.to_string(),
            outcome: outcome.phase.as_str().to_string(),
            completions: outcome.completions,
            timestamp: Utc::now(),
        });
    }
}

async fn record_contact(contacts: &ContactBook, phone: &str, user_text: &str) {
    let fields = extract_contact_fields(user_text);
    let result = if fields.is_empty() {
        contacts.touch_dates(phone).await
    } else {
        debug!(phone, fields = ?fields.keys().collect::<Vec<_>>(), "Contact details found in message");
        contacts.upsert_contact(phone, fields).await.map(|_| ())
    };
    if let Err(e) = result {
        warn!(phone, table = contacts.table(), error = %e, "Contact bookkeeping failed");
    }
}
