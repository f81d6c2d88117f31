//! Prompt composition: which knowledge goes into each model request.
//!
//! The prompt is built from up to four pieces, in this order:
//!
//! 1. the introduction block, always first when present;
//! 2. the *focus*: the active sections if any were requested, otherwise
//!    the current step (never both);
//! 3. a product category, when the host asks for one;
//! 4. the testimonials block, when the host asks for it.
//!
//! Composition is read-only: it never mutates the conversation state.

use flowbot_core::normalize_key;
use flowbot_core::state::ConversationState;
use flowbot_knowledge::{BlockOrigin, KnowledgeBase};
use serde::Serialize;
use tracing::{debug, warn};

/// Host-supplied switches for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeOptions {
    pub include_products: bool,
    /// Category name as the host knows it; normalized before lookup
    pub product_category: Option<String>,
    pub include_testimonials: bool,
}

impl ComposeOptions {
    /// Include the given product category.
    pub fn with_products(mut self, category: impl Into<String>) -> Self {
        self.include_products = true;
        self.product_category = Some(category.into());
        self
    }

    pub fn with_testimonials(mut self) -> Self {
        self.include_testimonials = true;
        self
    }
}

/// One piece of a composed prompt, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub name: String,
    pub chars: usize,
}

/// The prompt text plus the record of what went into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub text: String,
    pub audit: Vec<AuditEntry>,
}

impl ComposedPrompt {
    /// Whether a piece with this audit name was included.
    pub fn includes(&self, name: &str) -> bool {
        self.audit.iter().any(|e| e.name == name)
    }
}

struct Piece<'a> {
    name: String,
    text: &'a str,
    /// Knowledge key the piece came from, for category dedup
    key: Option<&'a str>,
}

/// Stateless prompt builder over a knowledge snapshot.
pub struct PromptComposer;

impl PromptComposer {
    /// Build the system prompt for the current state.
    pub fn compose(
        state: &ConversationState,
        kb: &KnowledgeBase,
        options: &ComposeOptions,
    ) -> ComposedPrompt {
        let mut pieces = Vec::new();

        if let Some(intro) = kb.intro() {
            pieces.push(Piece {
                name: "intro".into(),
                text: intro,
                key: Some(kb.layout().intro_key.as_str()),
            });
        }

        pieces.extend(focus_pieces(state, kb));

        if options.include_products {
            match options.product_category.as_deref().map(normalize_key) {
                Some(key) if !key.is_empty() => {
                    let already = pieces.iter().any(|p| p.key == Some(key.as_str()));
                    match kb.categories.iter().find(|b| b.key == key) {
                        Some(_) if already => {
                            debug!(category = %key, "Category already active, not repeated");
                        }
                        Some(block) => pieces.push(Piece {
                            name: format!("category:{}", block.key),
                            text: block.text.as_str(),
                            key: Some(block.key.as_str()),
                        }),
                        None => warn!(category = %key, "Requested product category not found"),
                    }
                }
                _ => debug!("Products requested without a category"),
            }
        }

        if options.include_testimonials {
            match kb.testimonials() {
                Some(text) => pieces.push(Piece {
                    name: "testimonials".into(),
                    text,
                    key: None,
                }),
                None => debug!("Testimonials requested but none loaded"),
            }
        }

        let pieces: Vec<Piece<'_>> = pieces.into_iter().filter(|p| !p.text.trim().is_empty()).collect();
        let text = pieces.iter().map(|p| p.text).collect::<Vec<_>>().join("\n\n");
        let audit: Vec<AuditEntry> = pieces
            .iter()
            .map(|p| AuditEntry {
                name: p.name.clone(),
                chars: p.text.chars().count(),
            })
            .collect();

        debug!(
            conversation_id = %state.conversation_id,
            pieces = ?audit,
            chars = text.chars().count(),
            "Prompt composed"
        );

        ComposedPrompt { text, audit }
    }

    /// The focus content alone: active sections, else the current step.
    ///
    /// Used to answer pure control turns without another model call.
    pub fn focus_text(state: &ConversationState, kb: &KnowledgeBase) -> String {
        focus_pieces(state, kb)
            .iter()
            .map(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn focus_pieces<'a>(state: &ConversationState, kb: &'a KnowledgeBase) -> Vec<Piece<'a>> {
    let intro_key = kb.layout().intro_key.as_str();
    let active = state.active_sections();
    let only_intro = active.iter().all(|k| k == intro_key);

    if !active.is_empty() && !only_intro {
        let mut pieces = Vec::new();
        for key in active.iter().filter(|k| k.as_str() != intro_key) {
            let Some(resolved) = kb.resolve(key) else {
                warn!(
                    conversation_id = %state.conversation_id,
                    key = %key,
                    "Active section not found in knowledge base, skipped"
                );
                continue;
            };
            let blocks = match resolved.origin {
                BlockOrigin::Section => &kb.sections,
                BlockOrigin::Category => &kb.categories,
            };
            if let Some(block) = blocks.iter().find(|b| b.key == resolved.key) {
                pieces.push(Piece {
                    name: format!("section:{}", block.key),
                    text: block.text.as_str(),
                    key: Some(block.key.as_str()),
                });
            }
        }
        return pieces;
    }

    let index = state.current_step_index;
    let (name, text) = match kb.step(index) {
        Some(text) => (format!("step:{}", index + 1), text),
        None => match kb.step(0) {
            Some(text) => {
                warn!(
                    conversation_id = %state.conversation_id,
                    index,
                    steps = kb.steps.len(),
                    "Step index out of range, using the first step"
                );
                ("step:1".to_string(), text)
            }
            None => {
                debug!("No steps loaded");
                return Vec::new();
            }
        },
    };
    vec![Piece { name, text, key: None }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbot_core::message::ConversationId;
    use flowbot_knowledge::KnowledgeLayout;

    fn kb(steps: usize) -> KnowledgeBase {
        let steps: String = (1..=steps)
            .map(|i| format!("BEGIN STEP: {i}\nPaso {i} texto\nEND STEP: {i}\n"))
            .collect();
        let raw = format!(
            "BEGIN SECTION: introduction\nIntro texto\nEND SECTION: introduction\n\
             BEGIN SECTION: steps\n{steps}END SECTION: steps\n\
             BEGIN SECTION: products\n\
             BEGIN CATEGORY: bebidas\nBebidas texto\nEND CATEGORY: bebidas\n\
             BEGIN CATEGORY: postres\nPostres texto\nEND CATEGORY: postres\n\
             END SECTION: products\n\
             BEGIN SECTION: testimonials\nTestimonios texto\nEND SECTION: testimonials\n\
             BEGIN SECTION: horarios\nHorarios texto\nEND SECTION: horarios\n"
        );
        KnowledgeBase::from_text(&raw, KnowledgeLayout::default())
    }

    fn state() -> ConversationState {
        ConversationState::new(ConversationId::from("c1"))
    }

    #[test]
    fn intro_is_first_and_appears_once() {
        let kb = kb(3);
        let mut s = state();
        s.activate_section("introduction");
        s.activate_section("horarios");
        let prompt = PromptComposer::compose(&s, &kb, &ComposeOptions::default().with_testimonials());
        assert!(prompt.text.starts_with("Intro texto"));
        assert_eq!(prompt.text.matches("Intro texto").count(), 1);
        assert_eq!(prompt.audit[0].name, "intro");
    }

    #[test]
    fn current_step_only_when_no_sections() {
        let kb = kb(5);
        let mut s = state();
        s.jump_to_step(2);
        let prompt = PromptComposer::compose(&s, &kb, &ComposeOptions::default());
        assert_eq!(prompt.text, "Intro texto\n\nPaso 3 texto");
        for other in [1, 2, 4, 5] {
            assert!(!prompt.text.contains(&format!("Paso {other} texto")));
        }
        assert!(prompt.includes("step:3"));
    }

    #[test]
    fn out_of_range_step_falls_back_to_first() {
        let kb = kb(2);
        let mut s = state();
        s.jump_to_step(9);
        assert_eq!(PromptComposer::focus_text(&s, &kb), "Paso 1 texto");

        let empty = KnowledgeBase::empty(KnowledgeLayout::default());
        assert_eq!(PromptComposer::focus_text(&s, &empty), "");
        assert_eq!(PromptComposer::compose(&s, &empty, &ComposeOptions::default()).text, "");
    }

    #[test]
    fn active_sections_replace_the_step() {
        let kb = kb(2);
        let mut s = state();
        s.activate_section("horarios");
        s.activate_section("bebidas");
        s.activate_section("desconocida");
        let prompt = PromptComposer::compose(&s, &kb, &ComposeOptions::default());
        assert_eq!(prompt.text, "Intro texto\n\nHorarios texto\n\nBebidas texto");
        assert!(!prompt.text.contains("Paso 1"));
    }

    #[test]
    fn only_intro_active_counts_as_no_sections() {
        let kb = kb(2);
        let mut s = state();
        s.activate_section("introduction");
        let prompt = PromptComposer::compose(&s, &kb, &ComposeOptions::default());
        assert_eq!(prompt.text, "Intro texto\n\nPaso 1 texto");
    }

    #[test]
    fn category_and_testimonials_are_appended() {
        let kb = kb(2);
        let s = state();
        let options = ComposeOptions::default()
            .with_products("Postres")
            .with_testimonials();
        let prompt = PromptComposer::compose(&s, &kb, &options);
        assert_eq!(
            prompt.text,
            "Intro texto\n\nPaso 1 texto\n\nPostres texto\n\nTestimonios texto"
        );
        let names: Vec<_> = prompt.audit.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["intro", "step:1", "category:postres", "testimonials"]);
        assert_eq!(prompt.audit[2].chars, "Postres texto".chars().count());
    }

    #[test]
    fn active_category_is_not_repeated() {
        let kb = kb(2);
        let mut s = state();
        s.activate_section("bebidas");
        let prompt = PromptComposer::compose(&s, &kb, &ComposeOptions::default().with_products("bebidas"));
        assert_eq!(prompt.text.matches("Bebidas texto").count(), 1);
    }

    #[test]
    fn unknown_category_is_skipped() {
        let kb = kb(1);
        let prompt = PromptComposer::compose(&state(), &kb, &ComposeOptions::default().with_products("zapatos"));
        assert_eq!(prompt.text, "Intro texto\n\nPaso 1 texto");
    }
}
