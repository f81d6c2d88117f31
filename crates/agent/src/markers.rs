//! Directive markers in model output.
//!
//! One grammar, one tokenizer:
//!
//! ```text
//! marker = GLYPH ident { "," ident } [ GLYPH ]
//! ident  = [A-Za-z0-9_]+
//! ```
//!
//! Each identifier becomes a [`Directive`]: `step_<n>` jumps to step `n`
//! (1-indexed), `advance_step` and `add_to_cart` are control signals, and
//! anything else asks for a knowledge section.

use std::ops::Range;

use chrono::Utc;
use flowbot_core::event::{DomainEvent, EventBus};
use flowbot_core::normalize_key;
use flowbot_core::state::ConversationState;
use flowbot_knowledge::KnowledgeBase;
use regex_lite::Regex;
use tracing::{debug, info, warn};

/// Default glyph that introduces a directive.
pub const DEFAULT_DIRECTIVE_GLYPH: &str = "🧩";

/// What one identifier in a marker asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Jump to a 1-indexed step
    StepJump(usize),
    /// Pull a knowledge block into context (normalized key)
    SectionRequest(String),
    /// Move to the next step once the reply is final
    AdvanceStep,
    /// Extract the accepted product into the cart
    AddToCart,
}

impl Directive {
    /// Classify a raw identifier.
    pub fn parse(raw_key: &str) -> Self {
        let key = normalize_key(raw_key);
        match key.as_str() {
            "advance_step" | "avanzar_paso" => return Self::AdvanceStep,
            "add_to_cart" | "agregar_carrito" => return Self::AddToCart,
            _ => {}
        }
        let number = key
            .strip_prefix("step_")
            .or_else(|| key.strip_prefix("paso_"))
            .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|n| n.parse().ok());
        match number {
            Some(n) => Self::StepJump(n),
            None => Self::SectionRequest(key),
        }
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, Self::AdvanceStep | Self::AddToCart)
    }
}

/// One directive found in a text, with the span of the marker it came from.
///
/// Identifiers sharing a comma list share the same span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub directive: Directive,
    pub raw: String,
    pub span: Range<usize>,
}

/// Control signals present in a text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub advance_step: bool,
    pub add_to_cart: bool,
}

/// State change made by one `apply` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// `(from, to)` zero-based step indices, when a jump happened
    pub step_change: Option<(usize, usize)>,
    /// Keys newly added to the active sections
    pub activated: Vec<String>,
    /// Raw keys that matched nothing
    pub dropped: Vec<String>,
}

impl ApplyReport {
    pub fn changed_state(&self) -> bool {
        self.step_change.is_some() || !self.activated.is_empty()
    }
}

/// Detects, applies and strips directive markers.
#[derive(Debug, Clone)]
pub struct MarkerInterpreter {
    glyph: String,
    pattern: Regex,
}

impl MarkerInterpreter {
    /// Build an interpreter for `glyph`.
    pub fn new(glyph: &str) -> Result<Self, flowbot_core::Error> {
        if glyph.is_empty()
            || glyph
                .chars()
                .any(|c| c.is_alphanumeric() || c == '_' || c.is_whitespace())
        {
            return Err(flowbot_core::Error::Config {
                message: format!("directive glyph {glyph:?} must be non-empty and contain only symbols"),
            });
        }
        let g = regex_lite::escape(glyph);
        let pattern = Regex::new(&format!(
            r"{g}([A-Za-z0-9_]+(?:[ \t]*,[ \t]*[A-Za-z0-9_]+)*)(?:{g})?"
        ))
        .map_err(|e| flowbot_core::Error::Config {
            message: format!("directive pattern for {glyph:?}: {e}"),
        })?;
        Ok(Self {
            glyph: glyph.to_string(),
            pattern,
        })
    }

    pub fn glyph(&self) -> &str {
        &self.glyph
    }

    /// Every directive in `text`, in order of appearance.
    pub fn tokenize(&self, text: &str) -> Vec<Marker> {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| Some((caps.get(0)?, caps.get(1)?)))
            .flat_map(|(whole, list)| {
                list.as_str()
                    .split(',')
                    .map(str::trim)
                    .filter(|raw| !raw.is_empty())
                    .map(move |raw| Marker {
                        directive: Directive::parse(raw),
                        raw: raw.to_string(),
                        span: whole.range(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Raw keys of the step and section directives in `text`, or `None`.
    pub fn detect(&self, text: &str) -> Option<Vec<String>> {
        let keys: Vec<String> = self
            .tokenize(text)
            .into_iter()
            .filter(|m| !m.directive.is_signal())
            .map(|m| m.raw)
            .collect();
        (!keys.is_empty()).then_some(keys)
    }

    /// Canonical form of a directive key.
    pub fn normalize(raw_key: &str) -> String {
        normalize_key(raw_key)
    }

    /// Control signals in `text`.
    pub fn signals(&self, text: &str) -> Signals {
        self.tokenize(text)
            .iter()
            .fold(Signals::default(), |mut signals, m| {
                match m.directive {
                    Directive::AdvanceStep => signals.advance_step = true,
                    Directive::AddToCart => signals.add_to_cart = true,
                    _ => {}
                }
                signals
            })
    }

    /// Apply detected keys to the state.
    ///
    /// Any step jump wins: the last requested step becomes current and the
    /// active sections are cleared, section requests included. Otherwise
    /// each resolvable section key is added once, in order.
    pub fn apply(
        &self,
        keys: &[String],
        state: &mut ConversationState,
        kb: &KnowledgeBase,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut last_step = None;
        let mut sections = Vec::new();

        for raw in keys {
            match Directive::parse(raw) {
                Directive::StepJump(0) => {
                    warn!(conversation_id = %state.conversation_id, key = %raw, "Step 0 does not exist, directive dropped");
                    report.dropped.push(raw.clone());
                }
                Directive::StepJump(n) => last_step = Some(n),
                Directive::SectionRequest(key) => sections.push((raw, key)),
                Directive::AdvanceStep | Directive::AddToCart => {}
            }
        }

        if let Some(step) = last_step {
            let from = state.current_step_index;
            let to = step - 1;
            if to >= kb.steps.len() && !kb.steps.is_empty() {
                warn!(
                    conversation_id = %state.conversation_id,
                    step,
                    steps = kb.steps.len(),
                    "Jump past the last step, the first step will be used"
                );
            }
            if !sections.is_empty() {
                debug!(
                    conversation_id = %state.conversation_id,
                    ignored = sections.len(),
                    "Section requests ignored in favour of the step jump"
                );
            }
            state.jump_to_step(to);
            info!(conversation_id = %state.conversation_id, from, to, "Step changed by directive");
            report.step_change = Some((from, to));
            return report;
        }

        for (raw, key) in sections {
            match kb.resolve(&key) {
                Some(resolved) => {
                    if state.activate_section(resolved.key.clone()) {
                        info!(
                            conversation_id = %state.conversation_id,
                            key = %resolved.key,
                            origin = ?resolved.origin,
                            "Section activated"
                        );
                        report.activated.push(resolved.key);
                    } else {
                        debug!(conversation_id = %state.conversation_id, key = %resolved.key, "Section already active");
                    }
                }
                None => {
                    warn!(conversation_id = %state.conversation_id, key = %raw, "Directive matches no knowledge block, dropped");
                    report.dropped.push(raw.clone());
                }
            }
        }
        report
    }

    /// Publish the events for an apply pass.
    pub fn publish(&self, report: &ApplyReport, conversation_id: &str, bus: &EventBus) {
        let timestamp = Utc::now();
        if let Some((from, to)) = report.step_change {
            bus.publish(DomainEvent::StepChanged {
                conversation_id: conversation_id.to_string(),
                from,
                to,
                timestamp,
            });
        }
        for key in &report.activated {
            bus.publish(DomainEvent::SectionActivated {
                conversation_id: conversation_id.to_string(),
                key: key.clone(),
                timestamp,
            });
        }
        for raw_key in &report.dropped {
            bus.publish(DomainEvent::DirectiveDropped {
                conversation_id: conversation_id.to_string(),
                raw_key: raw_key.clone(),
                timestamp,
            });
        }
    }

    /// Remove every marker, signals included, and tidy what is left.
    pub fn strip(&self, text: &str) -> String {
        let removed = self.pattern.replace_all(text, "");
        tidy(&removed)
    }
}

impl Default for MarkerInterpreter {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTIVE_GLYPH).expect("default directive glyph is valid")
    }
}

/// Collapse the gaps a removed marker leaves behind.
fn tidy(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        let line = fix_punctuation_spacing(&line);
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }
    let joined = lines.join("\n");
    joined
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '|'))
        .to_string()
}

fn fix_punctuation_spacing(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        if matches!(c, ',' | '.' | ';' | ':' | '!' | '?') && out.ends_with(' ') {
            out.pop();
        }
        out.push(c);
    }
    out.trim_start_matches([',', ';']).trim_start().to_string()
}
