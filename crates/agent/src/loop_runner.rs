//! The orchestration loop: resolve directives before a reply goes out.
//!
//! ```text
//! AwaitingMarkers ──no markers──────────────────────────▶ Finalized
//!       │ markers: apply
//!       ├──visible text empty: answer from focus text───▶ Finalized
//!       ├──budget spent─────────────────────────────────▶ Aborted(BudgetExceeded)
//!       ▼
//!  Reprompting ──model error────────────────────────────▶ Aborted(ModelUnavailable)
//!       │ new reply
//!       └──────────────▶ AwaitingMarkers
//! ```
//!
//! The budget counts every completion of the turn, the one that produced
//! the initial reply included, so the loop can never call the model more
//! than `max_completions` times.

use std::sync::Arc;

use chrono::Utc;
use flowbot_config::{ModelConfig, OrchestrationConfig};
use flowbot_core::event::{DomainEvent, EventBus};
use flowbot_core::message::{Message, Role};
use flowbot_core::provider::{CompletionProvider, CompletionRequest, CompletionResponse};
use flowbot_core::state::ConversationState;
use flowbot_knowledge::KnowledgeBase;
use tracing::{debug, error, info, warn};

use crate::composer::{ComposeOptions, PromptComposer};
use crate::markers::{MarkerInterpreter, Signals};

/// Why a turn gave up before a proper reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The model kept emitting directives until the budget ran out
    BudgetExceeded,
    /// A completion call failed
    ModelUnavailable,
}

/// Where the loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingMarkers,
    Reprompting,
    Finalized,
    Aborted(AbortReason),
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingMarkers => "awaiting_markers",
            Self::Reprompting => "reprompting",
            Self::Finalized => "finalized",
            Self::Aborted(AbortReason::BudgetExceeded) => "budget_exceeded",
            Self::Aborted(AbortReason::ModelUnavailable) => "model_unavailable",
        }
    }
}

/// How a turn settled.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// `Finalized` or `Aborted(_)`
    pub phase: LoopPhase,
    /// User-visible reply, directives removed
    pub reply: String,
    /// The last model reply as received (empty when none arrived)
    pub raw: String,
    /// Completion calls made for this turn, the initial one included
    pub completions: u32,
    /// Whether the reply was built from knowledge text without the model
    pub synthesized: bool,
    /// Control signals of the finalized raw reply
    pub signals: Signals,
}

impl LoopOutcome {
    pub fn is_finalized(&self) -> bool {
        self.phase == LoopPhase::Finalized
    }
}

/// Runs the detect → apply → re-prompt cycle for one user turn.
pub struct OrchestrationLoop {
    provider: Arc<dyn CompletionProvider>,
    markers: MarkerInterpreter,
    max_completions: u32,
    model: ModelConfig,
    fallback_message: String,
    apology_message: String,
    event_bus: Arc<EventBus>,
}

impl OrchestrationLoop {
    /// Create a loop with the default budget (3) and messages.
    pub fn new(provider: Arc<dyn CompletionProvider>, event_bus: Arc<EventBus>) -> Self {
        let defaults = OrchestrationConfig::default();
        Self {
            provider,
            markers: MarkerInterpreter::default(),
            max_completions: defaults.max_completions,
            model: ModelConfig::default(),
            fallback_message: defaults.fallback_message,
            apology_message: defaults.apology_message,
            event_bus,
        }
    }

    /// Build from configuration; fails only on an unusable directive glyph.
    pub fn from_config(
        provider: Arc<dyn CompletionProvider>,
        event_bus: Arc<EventBus>,
        orchestration: &OrchestrationConfig,
        model: &ModelConfig,
    ) -> Result<Self, flowbot_core::Error> {
        Ok(Self {
            provider,
            markers: MarkerInterpreter::new(&orchestration.directive_glyph)?,
            max_completions: orchestration.max_completions.max(1),
            model: model.clone(),
            fallback_message: orchestration.fallback_message.clone(),
            apology_message: orchestration.apology_message.clone(),
            event_bus,
        })
    }

    /// Set the completion budget per turn.
    pub fn with_max_completions(mut self, max: u32) -> Self {
        self.max_completions = max.max(1);
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.model.history_window = window;
        self
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn markers(&self) -> &MarkerInterpreter {
        &self.markers
    }

    pub fn max_completions(&self) -> u32 {
        self.max_completions
    }

    pub fn apology_message(&self) -> &str {
        &self.apology_message
    }

    /// Ask the model with the recent history of `state`.
    ///
    /// The current user message is sent as `user_text`, not repeated in the
    /// history.
    pub async fn ask(
        &self,
        state: &ConversationState,
        system_prompt: String,
        user_text: &str,
    ) -> Result<CompletionResponse, flowbot_core::ProviderError> {
        let request = CompletionRequest::new(system_prompt, user_text)
            .with_model(&self.model.model, self.model.temperature, self.model.max_tokens)
            .with_history(self.history_for(state, user_text));
        self.provider.complete(request).await
    }

    fn history_for(&self, state: &ConversationState, user_text: &str) -> Vec<Message> {
        let window = self.model.history_window;
        let mut history = state.recent_history(window + 1).to_vec();
        if history
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == user_text)
        {
            history.pop();
        } else if history.len() > window {
            history.remove(0);
        }
        history
    }

    /// Drive one turn from the model's initial reply to a settled outcome.
    ///
    /// `state` is mutated in place: directives move the step or activate
    /// sections, and a finalized reply carrying the advance signal moves to
    /// the next step.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        kb: &KnowledgeBase,
        initial: CompletionResponse,
        user_text: &str,
        options: &ComposeOptions,
    ) -> LoopOutcome {
        let conversation_id = state.conversation_id.to_string();
        let mut phase = LoopPhase::AwaitingMarkers;
        let mut current = initial.text;
        let mut completions: u32 = 1;

        let mut outcome = loop {
            debug!(conversation_id = %conversation_id, iteration = completions, phase = phase.as_str(), "Orchestration step");

            let Some(keys) = self.markers.detect(&current) else {
                let reply = self.markers.strip(&current);
                break self.finalize(current, reply, completions, false);
            };

            let report = self.markers.apply(&keys, state, kb);
            self.markers.publish(&report, &conversation_id, &self.event_bus);

            let visible = self.markers.strip(&current);
            if visible.is_empty() {
                let mut reply = PromptComposer::focus_text(state, kb);
                if reply.is_empty() {
                    reply = self.fallback_message.clone();
                }
                info!(
                    conversation_id = %conversation_id,
                    iteration = completions,
                    chars = reply.chars().count(),
                    "Pure control reply, answering from knowledge text"
                );
                break self.finalize(current, reply, completions, true);
            }

            if completions >= self.max_completions {
                error!(
                    conversation_id = %conversation_id,
                    completions,
                    budget = self.max_completions,
                    keys = ?keys,
                    "Completion budget exhausted with directives still pending"
                );
                break self.abort(AbortReason::BudgetExceeded, current, completions);
            }

            phase = LoopPhase::Reprompting;
            let prompt = PromptComposer::compose(state, kb, options);
            debug!(
                conversation_id = %conversation_id,
                iteration = completions,
                phase = phase.as_str(),
                pieces = ?prompt.audit,
                "Re-asking the model with the updated state"
            );
            match self.ask(state, prompt.text, user_text).await {
                Ok(response) => {
                    completions += 1;
                    current = response.text;
                    phase = LoopPhase::AwaitingMarkers;
                }
                Err(e) => {
                    completions += 1;
                    warn!(conversation_id = %conversation_id, iteration = completions, error = %e, "Model call failed while re-prompting");
                    break self.abort(AbortReason::ModelUnavailable, current, completions);
                }
            }
        };

        if outcome.is_finalized() && outcome.signals.advance_step {
            let from = state.current_step_index;
            state.advance_step();
            info!(conversation_id = %conversation_id, from, to = state.current_step_index, "Advance signal, moving to next step");
            self.event_bus.publish(DomainEvent::StepChanged {
                conversation_id: conversation_id.clone(),
                from,
                to: state.current_step_index,
                timestamp: Utc::now(),
            });
        }

        if outcome.is_finalized() && outcome.reply.is_empty() {
            outcome.reply = PromptComposer::focus_text(state, kb);
            if outcome.reply.is_empty() {
                outcome.reply = self.fallback_message.clone();
            }
            outcome.synthesized = true;
            info!(
                conversation_id = %conversation_id,
                chars = outcome.reply.chars().count(),
                "Signal-only reply, answering from knowledge text"
            );
        }

        self.event_bus.publish(DomainEvent::TurnSettled {
            conversation_id,
            outcome: outcome.phase.as_str().to_string(),
            completions: outcome.completions,
            timestamp: Utc::now(),
        });
        outcome
    }

    /// The outcome for a turn whose first completion already failed.
    pub fn unavailable(&self) -> LoopOutcome {
        self.abort(AbortReason::ModelUnavailable, String::new(), 1)
    }

    fn finalize(&self, raw: String, reply: String, completions: u32, synthesized: bool) -> LoopOutcome {
        LoopOutcome {
            phase: LoopPhase::Finalized,
            signals: self.markers.signals(&raw),
            reply,
            raw,
            completions,
            synthesized,
        }
    }

    fn abort(&self, reason: AbortReason, raw: String, completions: u32) -> LoopOutcome {
        let reply = match reason {
            AbortReason::BudgetExceeded => self.fallback_message.clone(),
            AbortReason::ModelUnavailable => self.apology_message.clone(),
        };
        LoopOutcome {
            phase: LoopPhase::Aborted(reason),
            reply,
            raw,
            completions,
            synthesized: false,
            signals: Signals::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{EndlessDirectiveProvider, ScriptedProvider, make_response};
    use flowbot_core::error::ProviderError;
    use flowbot_core::message::ConversationId;
    use flowbot_knowledge::KnowledgeLayout;

    fn kb() -> KnowledgeBase {
        KnowledgeBase::from_text(
            "BEGIN SECTION: introduction\nIntro\nEND SECTION: introduction\n\
             BEGIN SECTION: steps\n\
             BEGIN STEP: 1\nSaluda\nEND STEP: 1\nBEGIN STEP: 2\nPregunta\nEND STEP: 2\nBEGIN STEP: 3\nCierra\nEND STEP: 3\n\
             END SECTION: steps\n\
             BEGIN SECTION: products\n\
             BEGIN CATEGORY: bebidas\nCafé y té\nEND CATEGORY: bebidas\n\
             END SECTION: products\n\
             BEGIN SECTION: horarios\nDe 8 a 18\nEND SECTION: horarios\n",
            KnowledgeLayout::default(),
        )
    }

    fn state() -> ConversationState {
        let mut s = ConversationState::new(ConversationId::from("c1"));
        s.push_history(Message::user("hola"));
        s
    }

    fn runner(provider: Arc<dyn CompletionProvider>) -> OrchestrationLoop {
        OrchestrationLoop::new(provider, Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn plain_reply_finalizes_without_another_call() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let agent = runner(provider.clone());
        let mut s = state();
        let out = agent
            .run(&mut s, &kb(), make_response("¡Hola! ¿Qué buscas?"), "hola", &ComposeOptions::default())
            .await;
        assert_eq!(out.phase, LoopPhase::Finalized);
        assert_eq!(out.reply, "¡Hola! ¿Qué buscas?");
        assert_eq!(out.completions, 1);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn directive_triggers_reprompt_with_updated_state() {
        let provider = Arc::new(ScriptedProvider::new(["Abrimos de 8 a 18."]));
        let agent = runner(provider.clone());
        let mut s = state();
        let out = agent
            .run(&mut s, &kb(), make_response("Déjame ver 🧩horarios🧩"), "hola", &ComposeOptions::default())
            .await;
        assert_eq!(out.reply, "Abrimos de 8 a 18.");
        assert_eq!(out.completions, 2);
        assert_eq!(s.active_sections(), ["horarios"]);

        let prompts = provider.prompts();
        assert_eq!(prompts, ["Intro\n\nDe 8 a 18"]);
        let sent = provider.requests();
        assert!(sent[0].history.is_empty());
        assert_eq!(sent[0].user_text, "hola");
    }

    #[tokio::test]
    async fn requests_carry_model_settings() {
        let provider = Arc::new(ScriptedProvider::new(["Hola."]));
        let model = ModelConfig {
            model: "gpt-4o".into(),
            temperature: 0.3,
            max_tokens: 512,
            history_window: 4,
        };
        let agent = OrchestrationLoop::from_config(
            provider.clone(),
            Arc::new(EventBus::default()),
            &OrchestrationConfig::default(),
            &model,
        )
        .unwrap();
        agent.ask(&state(), "prompt".into(), "hola").await.unwrap();

        let sent = provider.requests();
        assert_eq!(sent[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(sent[0].temperature, Some(0.3));
        assert_eq!(sent[0].max_tokens, Some(512));
    }

    #[tokio::test]
    async fn pure_control_reply_is_synthesized() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let agent = runner(provider.clone());
        let mut s = state();
        let out = agent
            .run(&mut s, &kb(), make_response("🧩STEP_2🧩"), "sigamos", &ComposeOptions::default())
            .await;
        assert_eq!(out.phase, LoopPhase::Finalized);
        assert!(out.synthesized);
        assert_eq!(out.reply, "Pregunta");
        assert_eq!(s.current_step_index, 1);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn endless_directives_stop_at_the_budget() {
        let provider = Arc::new(EndlessDirectiveProvider::new());
        let agent = runner(provider.clone());
        let mut s = state();

        // the first completion happens outside the loop
        let initial = agent.ask(&s, "prompt".into(), "hola").await.unwrap();
        let out = agent
            .run(&mut s, &kb(), initial, "hola", &ComposeOptions::default())
            .await;

        assert_eq!(out.phase, LoopPhase::Aborted(AbortReason::BudgetExceeded));
        assert_eq!(out.completions, 3);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(out.reply, OrchestrationConfig::default().fallback_message);
    }

    #[tokio::test]
    async fn budget_is_configurable() {
        let provider = Arc::new(EndlessDirectiveProvider::new());
        let agent = runner(provider.clone()).with_max_completions(1);
        let mut s = state();
        let out = agent
            .run(&mut s, &kb(), make_response("Ya 🧩bebidas🧩 te cuento"), "hola", &ComposeOptions::default())
            .await;
        assert_eq!(out.phase, LoopPhase::Aborted(AbortReason::BudgetExceeded));
        assert_eq!(provider.call_count(), 0);
        // the directive was still applied
        assert_eq!(s.active_sections(), ["bebidas"]);
    }

    #[tokio::test]
    async fn model_failure_while_reprompting_apologizes() {
        let provider = Arc::new(ScriptedProvider::with_script([Err(ProviderError::Timeout(
            "30s".into(),
        ))]));
        let agent = runner(provider.clone());
        let mut s = state();
        let out = agent
            .run(&mut s, &kb(), make_response("Mira 🧩bebidas🧩"), "hola", &ComposeOptions::default())
            .await;
        assert_eq!(out.phase, LoopPhase::Aborted(AbortReason::ModelUnavailable));
        assert_eq!(out.reply, OrchestrationConfig::default().apology_message);
        assert!(!out.reply.contains("30s"));
    }

    #[tokio::test]
    async fn advance_signal_moves_to_next_step_after_finalizing() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let agent = OrchestrationLoop::new(provider, Arc::clone(&bus));
        let mut s = state();
        s.activate_section("horarios");

        let out = agent
            .run(&mut s, &kb(), make_response("Perfecto, seguimos. 🧩ADVANCE_STEP🧩"), "ok", &ComposeOptions::default())
            .await;
        assert_eq!(out.reply, "Perfecto, seguimos.");
        assert!(out.signals.advance_step);
        assert_eq!(s.current_step_index, 1);
        assert!(s.active_sections().is_empty());

        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::StepChanged { from: 0, to: 1, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::TurnSettled { outcome, completions: 1, .. } if outcome == "finalized"
        ));
    }

    #[tokio::test]
    async fn signal_only_reply_answers_from_the_new_step() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let agent = runner(provider.clone());
        let mut s = state();

        let out = agent
            .run(&mut s, &kb(), make_response("🧩ADVANCE_STEP🧩"), "ok", &ComposeOptions::default())
            .await;
        assert_eq!(out.phase, LoopPhase::Finalized);
        assert_eq!(s.current_step_index, 1);
        assert_eq!(out.reply, "Pregunta");
        assert!(out.synthesized);

        let out = agent
            .run(&mut s, &kb(), make_response("🧩ADD_TO_CART🧩"), "sí", &ComposeOptions::default())
            .await;
        assert!(out.signals.add_to_cart);
        assert_eq!(out.reply, "Pregunta");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn signal_only_reply_without_knowledge_uses_fallback() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let agent = runner(provider);
        let mut s = state();
        let empty = KnowledgeBase::empty(KnowledgeLayout::default());
        let out = agent
            .run(&mut s, &empty, make_response("🧩ADD_TO_CART🧩"), "sí", &ComposeOptions::default())
            .await;
        assert_eq!(out.reply, OrchestrationConfig::default().fallback_message);
    }

    #[test]
    fn history_excludes_the_current_user_message() {
        let provider = Arc::new(ScriptedProvider::new(Vec::<String>::new()));
        let agent = runner(provider).with_history_window(2);
        let mut s = ConversationState::new(ConversationId::from("c1"));
        for i in 0..4 {
            s.push_history(Message::user(format!("u{i}")));
            s.push_history(Message::assistant(format!("a{i}")));
        }
        s.push_history(Message::user("ahora"));
        let history = agent.history_for(&s, "ahora");
        let texts: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["u3", "a3"]);

        let history = agent.history_for(&s, "otra cosa");
        let texts: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["a3", "ahora"]);
    }
}
