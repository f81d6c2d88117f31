//! Knowledge base for the scripted conversation.
//!
//! The raw knowledge text is a plain document with delimiter pairs:
//!
//! ```text
//! === BEGIN SECTION: Introduction ===
//! You are the assistant of ...
//! === END SECTION: Introduction ===
//! ```
//!
//! `KIND` is one of `SECTION`, `STEP` or `CATEGORY`. Sections are split at
//! load time; the steps section is further split into ordered steps and the
//! products section into categories.

pub mod base;
pub mod block;
pub mod segmenter;
pub mod source;

pub use base::{BlockOrigin, KnowledgeBase, KnowledgeLayout, ResolvedBlock};
pub use block::{Blocks, KnowledgeBlock};
pub use segmenter::{
    BlockKind, DEFAULT_STEP_GLYPH, parse_blocks, parse_categories, parse_steps,
    parse_steps_with_glyph,
};
pub use source::{FileSource, KnowledgeSource, KnowledgeStore, StaticSource};
