//! End-to-end conversations through `ConversationAgent`.
//!
//! These tests drive whole turns: prompt composition, directive handling,
//! the completion budget, knowledge reloads and the cart-to-order path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use flowbot_agent::{AbortReason, ComposeOptions, ConversationAgent, LoopPhase};
use flowbot_config::{AppConfig, OrchestrationConfig};
use flowbot_core::error::{KnowledgeError, ProviderError};
use flowbot_core::event::DomainEvent;
use flowbot_core::message::ConversationId;
use flowbot_core::provider::{CompletionProvider, CompletionRequest, CompletionResponse};
use flowbot_core::state::ConversationState;
use flowbot_knowledge::{KnowledgeLayout, KnowledgeSource, KnowledgeStore, StaticSource};
use flowbot_store::{ContactBook, InMemoryRecordStore, OrderBook, RetryPolicy, WriteQueue};

// ── Mock Provider ────────────────────────────────────────────────────────

/// Replays scripted replies and records the system prompt of every call.
struct RecordingProvider {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl RecordingProvider {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for RecordingProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.prompts.lock().unwrap().push(request.system_prompt);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .map(CompletionResponse::text)
            .ok_or(ProviderError::EmptyCompletion)
    }
}

/// A model that answers every request with another section directive.
struct StubbornProvider {
    calls: Mutex<usize>,
}

#[async_trait::async_trait]
impl CompletionProvider for StubbornProvider {
    fn name(&self) -> &str {
        "stubborn_mock"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        Ok(CompletionResponse::text(format!(
            "Dame un segundo 🧩tema_{}🧩",
            *calls
        )))
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

const INTRO: &str = "Eres Lía, asistente de Café Aurora.";
const STEP_1: &str = "Saluda y pregunta qué desea el cliente.";
const STEP_2: &str = "Presenta las categorías del menú.";
const BEBIDAS: &str = "Café filtrado $4.500. Té chai $5.000.";

fn knowledge_text() -> String {
    format!(
        "=== BEGIN SECTION: Introduction ===\n{INTRO}\n=== END SECTION: Introduction ===\n\
         === BEGIN SECTION: Steps ===\n\
         BEGIN STEP: 1\n{STEP_1}\nEND STEP: 1\n\
         BEGIN STEP: 2\n{STEP_2}\nEND STEP: 2\n\
         === END SECTION: Steps ===\n\
         === BEGIN SECTION: Products ===\n\
         BEGIN CATEGORY: Bebidas\n{BEBIDAS}\nEND CATEGORY: Bebidas\n\
         === END SECTION: Products ===\n"
    )
}

async fn knowledge() -> Arc<KnowledgeStore> {
    let source = Arc::new(StaticSource::new("e2e", knowledge_text()));
    Arc::new(KnowledgeStore::load(source, KnowledgeLayout::default()).await)
}

fn new_state() -> ConversationState {
    ConversationState::new(ConversationId::from("573009998877"))
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_step_jump_then_category_request() {
    let provider = Arc::new(RecordingProvider::new(&[
        "¡Hola! Bienvenido a Café Aurora.",
        "🧩STEP_2🧩",
        "🧩bebidas🧩",
    ]));
    let agent = ConversationAgent::new(provider.clone(), knowledge().await);
    let mut events = agent.events().subscribe();
    let mut state = new_state();

    // Turn 1: plain reply, step untouched
    let reply = agent
        .handle_turn(&mut state, "hola", &ComposeOptions::default())
        .await;
    assert_eq!(reply.text.as_deref(), Some("¡Hola! Bienvenido a Café Aurora."));
    assert_eq!(state.current_step_index, 0);
    assert_eq!(provider.prompts()[0], format!("{INTRO}\n\n{STEP_1}"));

    // Turn 2: a pure step directive is answered from the step text
    let reply = agent
        .handle_turn(&mut state, "quiero pedir algo", &ComposeOptions::default())
        .await;
    assert_eq!(reply.phase, LoopPhase::Finalized);
    assert_eq!(reply.text.as_deref(), Some(STEP_2));
    assert_eq!(state.current_step_index, 1);
    assert!(state.active_sections().is_empty());

    // Turn 3: the host asks for the category, the model asks for it too
    let options = ComposeOptions::default().with_products("bebidas");
    let reply = agent
        .handle_turn(&mut state, "quiero ver bebidas", &options)
        .await;
    assert_eq!(reply.text.as_deref(), Some(BEBIDAS));
    assert_eq!(state.current_step_index, 1);
    assert!(state.active_sections().iter().any(|k| k == "bebidas"));

    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 3);
    let third = &prompts[2];
    assert!(third.starts_with(INTRO));
    assert_eq!(third.matches(INTRO).count(), 1);
    assert!(third.contains(STEP_2));
    assert!(third.contains(BEBIDAS));
    assert!(!third.contains(STEP_1));

    let mut step_changes = Vec::new();
    let mut activated = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event.as_ref() {
            DomainEvent::StepChanged { from, to, .. } => step_changes.push((*from, *to)),
            DomainEvent::SectionActivated { key, .. } => activated.push(key.clone()),
            _ => {}
        }
    }
    assert_eq!(step_changes, [(0, 1)]);
    assert_eq!(activated, ["bebidas"]);
}

#[tokio::test]
async fn e2e_reprompt_uses_post_directive_state() {
    let provider = Arc::new(RecordingProvider::new(&[
        "Claro, te muestro 🧩bebidas🧩",
        "Tenemos café filtrado y té chai.",
    ]));
    let agent = ConversationAgent::new(provider.clone(), knowledge().await);
    let mut state = new_state();

    let reply = agent
        .handle_turn(&mut state, "¿qué bebidas hay?", &ComposeOptions::default())
        .await;
    assert_eq!(reply.text.as_deref(), Some("Tenemos café filtrado y té chai."));
    assert_eq!(reply.completions, 2);

    let prompts = provider.prompts();
    assert_eq!(prompts[0], format!("{INTRO}\n\n{STEP_1}"));
    assert_eq!(prompts[1], format!("{INTRO}\n\n{BEBIDAS}"));
}

#[tokio::test]
async fn e2e_stubborn_model_is_cut_off_at_budget() {
    let provider = Arc::new(StubbornProvider {
        calls: Mutex::new(0),
    });
    let agent = ConversationAgent::new(provider.clone(), knowledge().await);
    let mut state = new_state();

    for turn in 1..=2 {
        let before = *provider.calls.lock().unwrap();
        let reply = agent
            .handle_turn(&mut state, &format!("mensaje {turn}"), &ComposeOptions::default())
            .await;
        let used = *provider.calls.lock().unwrap() - before;
        assert!(used <= 3, "turn {turn} used {used} completions");
        assert_eq!(reply.phase, LoopPhase::Aborted(AbortReason::BudgetExceeded));
        assert!(!reply.text.as_deref().unwrap_or_default().contains("tema_"));
    }
}

#[tokio::test]
async fn e2e_budget_from_config() {
    let provider = Arc::new(StubbornProvider {
        calls: Mutex::new(0),
    });
    let mut config = AppConfig::default();
    config.orchestration.max_completions = 2;
    let agent = ConversationAgent::from_config(provider.clone(), knowledge().await, &config).unwrap();
    let mut state = new_state();

    let reply = agent
        .handle_turn(&mut state, "hola", &ComposeOptions::default())
        .await;
    assert_eq!(*provider.calls.lock().unwrap(), 2);
    assert_eq!(
        reply.text.as_deref(),
        Some(OrchestrationConfig::default().fallback_message.as_str())
    );
}

/// A source whose text can be swapped between turns.
struct EditableSource {
    text: Mutex<String>,
}

#[async_trait::async_trait]
impl KnowledgeSource for EditableSource {
    fn describe(&self) -> String {
        "editable".into()
    }

    async fn fetch(&self) -> Result<String, KnowledgeError> {
        Ok(self.text.lock().unwrap().clone())
    }
}

#[tokio::test]
async fn e2e_reload_applies_to_the_next_turn() {
    let source = Arc::new(EditableSource {
        text: Mutex::new(knowledge_text()),
    });
    let store = Arc::new(KnowledgeStore::load(source.clone(), KnowledgeLayout::default()).await);
    let provider = Arc::new(RecordingProvider::new(&["Hola.", "Hola de nuevo."]));
    let agent = ConversationAgent::new(provider.clone(), Arc::clone(&store));
    let mut state = new_state();

    agent
        .handle_turn(&mut state, "hola", &ComposeOptions::default())
        .await;

    *source.text.lock().unwrap() = knowledge_text().replace(STEP_1, "Saluda con energía.");
    store.reload().await.unwrap();

    agent
        .handle_turn(&mut state, "hola otra vez", &ComposeOptions::default())
        .await;
    let prompts = provider.prompts();
    assert!(prompts[0].contains(STEP_1));
    assert!(prompts[1].contains("Saluda con energía."));
    assert!(!prompts[1].contains(STEP_1));
}

#[tokio::test]
async fn e2e_cart_to_order() {
    let provider = Arc::new(RecordingProvider::new(&[
        "Perfecto, dos cafés filtrados. 🧩ADD_TO_CART🧩",
        r#"```json
{"sku": "BEB-01", "nombre": "Café filtrado", "cantidad": 2, "precio": 4500, "categoria": "bebidas"}
```"#,
    ]));
    let config = AppConfig::default();
    let records = Arc::new(
        InMemoryRecordStore::new().with_key_column(config.store.contacts_table.clone(), "TELEFONO"),
    );
    let queue = WriteQueue::new(RetryPolicy::default());
    let contacts = Arc::new(ContactBook::from_config(records.clone(), queue.clone(), &config.store));
    let orders = OrderBook::from_config(records.clone(), queue, &config.store);

    let agent = ConversationAgent::new(provider.clone(), knowledge().await)
        .with_contacts(Arc::clone(&contacts));
    let mut state = new_state();

    let reply = agent
        .handle_turn(&mut state, "sí, dos cafés por favor", &ComposeOptions::default())
        .await;
    assert_eq!(reply.text.as_deref(), Some("Perfecto, dos cafés filtrados."));
    assert_eq!(state.cart.len(), 1);
    assert_eq!(provider.calls(), 2);

    let phone = state.conversation_id.as_str();
    let contact = contacts.contact(phone).await;
    let placed = orders
        .place_order(phone, &state.cart, contact.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(placed.number, 1);
    assert!((placed.total - 9000.0).abs() < f64::EPSILON);
}
