//! The conversation engine of flowbot.
//!
//! A turn follows a **compose → ask → resolve** cycle:
//!
//! 1. **Compose** the system prompt from the knowledge base and the
//!    conversation state (intro, then the current step or active sections)
//! 2. **Ask** the model
//! 3. **If the reply carries directives**: apply them to the state, rebuild
//!    the prompt and ask again
//! 4. **Otherwise**: strip what is left of the markers and deliver
//!
//! The cycle is bounded by a completion budget per turn.

pub mod cart;
pub mod composer;
pub mod loop_runner;
pub mod markers;
pub mod turn;

#[cfg(test)]
mod test_helpers;

pub use cart::{CartExtractor, EXTRACTION_WINDOW, ExtractionError, parse_line_item};
pub use composer::{AuditEntry, ComposeOptions, ComposedPrompt, PromptComposer};
pub use loop_runner::{AbortReason, LoopOutcome, LoopPhase, OrchestrationLoop};
pub use markers::{
    ApplyReport, DEFAULT_DIRECTIVE_GLYPH, Directive, Marker, MarkerInterpreter, Signals,
};
pub use turn::{ConversationAgent, TurnReply};
