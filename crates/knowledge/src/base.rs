//! The knowledge base: parsed sections, ordered steps and product categories.

use flowbot_config::KnowledgeConfig;
use flowbot_core::normalize_key;
use tracing::{info, warn};

use crate::block::Blocks;
use crate::segmenter::{parse_blocks, parse_categories, parse_steps_with_glyph};

/// Which blocks play which role in the scripted flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeLayout {
    /// Exact key of the introduction block
    pub intro_key: String,
    /// Key or key fragment of the section split into steps
    pub steps_section: String,
    /// Key or key fragment of the section split into categories
    pub categories_section: String,
    /// Exact key of the testimonials block
    pub testimonials_key: String,
    /// Glyph for the fallback step markers
    pub step_glyph: String,
}

impl Default for KnowledgeLayout {
    fn default() -> Self {
        Self::from(&KnowledgeConfig::default())
    }
}

impl From<&KnowledgeConfig> for KnowledgeLayout {
    fn from(config: &KnowledgeConfig) -> Self {
        Self {
            intro_key: normalize_key(&config.intro_key),
            steps_section: normalize_key(&config.steps_section),
            categories_section: normalize_key(&config.categories_section),
            testimonials_key: normalize_key(&config.testimonials_key),
            step_glyph: config.step_glyph.clone(),
        }
    }
}

/// Where a resolved key lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Section,
    Category,
}

/// A directive key resolved to a concrete block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBlock {
    pub key: String,
    pub origin: BlockOrigin,
}

/// Immutable, explicitly owned knowledge base.
///
/// Built once from the raw text; replaced wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    pub sections: Blocks,
    pub steps: Vec<String>,
    pub categories: Blocks,
    layout: KnowledgeLayout,
}

impl KnowledgeBase {
    /// A base with no blocks; every lookup misses.
    pub fn empty(layout: KnowledgeLayout) -> Self {
        Self {
            sections: Blocks::new(),
            steps: Vec::new(),
            categories: Blocks::new(),
            layout,
        }
    }

    /// Segment the raw knowledge text.
    pub fn from_text(raw: &str, layout: KnowledgeLayout) -> Self {
        let sections = parse_blocks(raw);

        let steps = match sections.find(&layout.steps_section) {
            Some(block) => {
                let steps = parse_steps_with_glyph(&block.text, &layout.step_glyph);
                info!(section = %block.key, count = steps.len(), "Steps section split");
                steps
            }
            None => {
                warn!(fragment = %layout.steps_section, "No steps section found");
                Vec::new()
            }
        };

        let categories = match sections.find(&layout.categories_section) {
            Some(block) => {
                let categories = parse_categories(&block.text);
                info!(
                    section = %block.key,
                    categories = ?categories.keys().collect::<Vec<_>>(),
                    "Products section split"
                );
                categories
            }
            None => {
                warn!(fragment = %layout.categories_section, "No products section found");
                Blocks::new()
            }
        };

        info!(
            sections = sections.len(),
            steps = steps.len(),
            categories = categories.len(),
            "Knowledge base loaded"
        );

        Self {
            sections,
            steps,
            categories,
            layout,
        }
    }

    pub fn layout(&self) -> &KnowledgeLayout {
        &self.layout
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn intro(&self) -> Option<&str> {
        self.sections.get(&self.layout.intro_key)
    }

    pub fn testimonials(&self) -> Option<&str> {
        self.sections.get(&self.layout.testimonials_key)
    }

    pub fn step(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(String::as_str)
    }

    pub fn category(&self, key: &str) -> Option<&str> {
        self.categories.get(key)
    }

    /// Text of a section or category by exact key, sections first.
    pub fn block_text(&self, key: &str) -> Option<&str> {
        self.sections.get(key).or_else(|| self.categories.get(key))
    }

    /// Resolve a normalized directive key: exact match on sections then
    /// categories, else the first key containing it (sections first).
    pub fn resolve(&self, key: &str) -> Option<ResolvedBlock> {
        if key.is_empty() {
            return None;
        }
        let exact = if self.sections.contains_key(key) {
            Some(BlockOrigin::Section)
        } else if self.categories.contains_key(key) {
            Some(BlockOrigin::Category)
        } else {
            None
        };
        if let Some(origin) = exact {
            return Some(ResolvedBlock {
                key: key.to_string(),
                origin,
            });
        }

        self.sections
            .find_containing(key)
            .map(|b| (b, BlockOrigin::Section))
            .or_else(|| {
                self.categories
                    .find_containing(key)
                    .map(|b| (b, BlockOrigin::Category))
            })
            .map(|(block, origin)| ResolvedBlock {
                key: block.key.clone(),
                origin,
            })
    }
}
