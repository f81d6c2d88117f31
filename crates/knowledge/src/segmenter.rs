//! Knowledge segmenter: splits raw reference text into named blocks.
//!
//! Grammar (informal, keywords case-insensitive):
//! ```text
//! open   = [ "="+ ] "BEGIN" KIND ":" name [ "="+ ]
//! close  = [ "="+ ] "END"   KIND ":" name [ "="+ ]
//! KIND   = "SECTION" | "STEP" | "CATEGORY"
//! ```
//!
//! A tag fenced with `=` on both sides may sit anywhere, inline with other
//! text. An unfenced or half-fenced tag must be alone on its line, since
//! only the line end marks where its name stops.
//!
//! A block runs from its open tag to the first close tag of the same kind
//! and name. Unterminated or mismatched blocks are dropped whole and
//! logged; parsing never fails.

use std::sync::LazyLock;

use flowbot_core::normalize_key;
use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::block::Blocks;

/// Glyph that opens a fallback `STEP <n>:` line.
pub const DEFAULT_STEP_GLYPH: &str = "📍";

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)=+[ \t]*(BEGIN|END)[ \t]+(SECTION|STEP|CATEGORY)[ \t]*:[ \t]*([^=\n]*?)[ \t]*=+|^[ \t]*(?:=+[ \t]*)?(BEGIN|END)[ \t]+(SECTION|STEP|CATEGORY)[ \t]*:[ \t]*(.*?)[ \t]*$",
    )
    .expect("tag pattern is valid")
});

/// The kind of a delimiter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Section,
    Step,
    Category,
}

impl BlockKind {
    fn parse(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_uppercase().as_str() {
            "SECTION" => Some(Self::Section),
            "STEP" => Some(Self::Step),
            "CATEGORY" => Some(Self::Category),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Section => "SECTION",
            Self::Step => "STEP",
            Self::Category => "CATEGORY",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Tag<'a> {
    open: bool,
    kind: BlockKind,
    name: &'a str,
    start: usize,
    end: usize,
}

fn scan_tags(text: &str) -> Vec<Tag<'_>> {
    TAG_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            // groups 1-3 for a fenced tag, 4-6 for a tag alone on its line
            let base = if caps.get(1).is_some() { 1 } else { 4 };
            let kind = BlockKind::parse(caps.get(base + 1)?.as_str())?;
            let name = caps.get(base + 2)?.as_str().trim().trim_end_matches('=').trim();
            Some(Tag {
                open: caps.get(base)?.as_str().eq_ignore_ascii_case("BEGIN"),
                kind,
                name,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Every well-formed pair of `kind`, as `(raw name, trimmed body)` in document order.
fn paired(text: &str, kind: BlockKind) -> Vec<(String, String)> {
    let tags = scan_tags(text);
    let mut pairs = Vec::new();
    let mut cursor = 0;

    for (i, open) in tags.iter().enumerate() {
        if !open.open || open.kind != kind || open.start < cursor {
            continue;
        }
        if open.name.is_empty() {
            warn!(kind = %kind, "Block without a name dropped");
            continue;
        }

        let wanted = open.name.to_lowercase();
        let close = tags[i + 1..]
            .iter()
            .find(|t| !t.open && t.kind == kind && t.name.to_lowercase() == wanted);

        match close {
            Some(close) => {
                pairs.push((open.name.to_string(), text[open.end..close.start].trim().to_string()));
                cursor = close.end;
            }
            None => {
                warn!(kind = %kind, name = open.name, "Unterminated or mismatched block dropped");
            }
        }
    }

    pairs
}

fn keyed(text: &str, kind: BlockKind) -> Blocks {
    let mut blocks = Blocks::new();
    for (name, body) in paired(text, kind) {
        let key = normalize_key(&name);
        if key.is_empty() {
            warn!(kind = %kind, name = %name, "Block name normalizes to an empty key, dropped");
            continue;
        }
        debug!(kind = %kind, key = %key, name = %name, chars = body.len(), "Block loaded");
        if blocks.insert(key.clone(), body).is_some() {
            warn!(kind = %kind, key = %key, "Duplicate block key, later block wins");
        }
    }
    blocks
}

fn normalize_newlines(raw: &str) -> std::borrow::Cow<'_, str> {
    if raw.contains('\r') {
        std::borrow::Cow::Owned(raw.replace("\r\n", "\n"))
    } else {
        std::borrow::Cow::Borrowed(raw)
    }
}

/// Split the whole document into `SECTION` blocks keyed by normalized name.
pub fn parse_blocks(raw: &str) -> Blocks {
    let text = normalize_newlines(raw);
    let blocks = keyed(&text, BlockKind::Section);
    if blocks.is_empty() {
        warn!("No sections found in knowledge text; check the BEGIN/END delimiters");
    } else {
        info!(count = blocks.len(), "Knowledge sections parsed");
    }
    blocks
}

/// Split one section's text into `CATEGORY` blocks.
pub fn parse_categories(section_text: &str) -> Blocks {
    let text = normalize_newlines(section_text);
    let categories = keyed(&text, BlockKind::Category);
    if categories.is_empty() {
        warn!("No categories found in products section");
    }
    categories
}

/// Split one section's text into ordered steps using the default glyph.
pub fn parse_steps(section_text: &str) -> Vec<String> {
    parse_steps_with_glyph(section_text, DEFAULT_STEP_GLYPH)
}

/// Split one section's text into ordered steps.
///
/// `BEGIN STEP / END STEP` pairs win. Without them, every line starting
/// with `glyph` + `STEP <n>:` opens a new step; the marker line belongs to
/// the step it opens and any preamble before the first marker is dropped.
pub fn parse_steps_with_glyph(section_text: &str, glyph: &str) -> Vec<String> {
    if section_text.trim().is_empty() {
        return Vec::new();
    }
    let text = normalize_newlines(section_text);

    let steps: Vec<String> = paired(&text, BlockKind::Step)
        .into_iter()
        .map(|(_, body)| body)
        .collect();
    if !steps.is_empty() {
        debug!(count = steps.len(), "Steps parsed from delimiter pairs");
        return steps;
    }

    let pattern = format!(
        r"(?im)^[ \t]*{}[ \t]*STEP[ \t]+[0-9]+[ \t]*:",
        regex_lite::escape(glyph)
    );
    let marker = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(glyph, error = %e, "Invalid step glyph, no steps parsed");
            return Vec::new();
        }
    };

    let starts: Vec<usize> = marker.find_iter(&text).map(|m| m.start()).collect();
    let steps: Vec<String> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(text.len());
            text[start..end].trim().to_string()
        })
        .filter(|s| !s.is_empty())
        .collect();

    if steps.is_empty() {
        warn!("No steps found in steps section; check the STEP delimiters");
    } else {
        debug!(count = steps.len(), "Steps parsed from glyph markers");
    }
    steps
}
