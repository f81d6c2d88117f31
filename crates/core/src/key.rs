//! Identifier normalization shared by the knowledge segmenter and the
//! directive interpreter.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Normalize a raw block name or directive key into a knowledge key.
///
/// Lowercases, strips diacritics, maps anything outside `[a-z0-9_]` to `_`,
/// collapses runs of `_` and trims them from both ends. Idempotent.
///
/// ```
/// use flowbot_core::normalize_key;
/// assert_eq!(normalize_key("Sección 1"), "seccion_1");
/// assert_eq!(normalize_key("__Bebidas  Frías!"), "bebidas_frias");
/// ```
pub fn normalize_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    let mut last_was_sep = true;

    for c in raw.to_lowercase().nfd().filter(|c| !is_combining_mark(*c)) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            key.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            key.push('_');
            last_was_sep = true;
        }
    }

    while key.ends_with('_') {
        key.pop();
    }
    key
}
