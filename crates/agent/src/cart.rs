//! Cart extraction: ask the model which product the customer just accepted.

use std::sync::Arc;

use flowbot_config::ModelConfig;
use flowbot_core::message::Message;
use flowbot_core::provider::{CompletionProvider, CompletionRequest};
use flowbot_core::state::LineItem;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Messages of recent history sent to the extractor.
pub const EXTRACTION_WINDOW: usize = 4;

const EXTRACTION_PROMPT: &str = "\
Eres un sistema experto en extracción de datos. Analiza el siguiente fragmento \
de una conversación y extrae la información del ÚLTIMO producto que el cliente \
confirmó comprar.

REGLAS:
- \"sku\": el código SKU del producto aceptado. Si no se menciona, usa \"N/A\".
- \"nombre\": el nombre completo del producto aceptado.
- \"cantidad\": la cantidad, como NÚMERO. Si no se especifica, asume 1.
- \"precio\": el precio unitario final, como NÚMERO, sin símbolos ni separadores.
- \"categoria\": la categoría del producto. Si no se menciona, infiérela.

Devuelve ÚNICAMENTE el objeto JSON válido.";

/// Why an extraction reply was not turned into a line item.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("reply is not a JSON object: {0}")]
    NotJson(String),

    #[error("field '{0}' is missing or invalid")]
    Invalid(&'static str),
}

/// Turns the tail of a conversation into a cart line item.
pub struct CartExtractor {
    provider: Arc<dyn CompletionProvider>,
    window: usize,
    model: ModelConfig,
}

impl CartExtractor {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            window: EXTRACTION_WINDOW,
            model: ModelConfig::default(),
        }
    }

    /// Model settings sent with the extraction request.
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Extract the last accepted product from `history`.
    ///
    /// Every failure is logged and yields `None`; the turn goes on.
    pub async fn extract(&self, conversation_id: &str, history: &[Message]) -> Option<LineItem> {
        let start = history.len().saturating_sub(self.window);
        let excerpt = history[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        if excerpt.is_empty() {
            warn!(conversation_id, "No history to extract a cart item from");
            return None;
        }

        let request = CompletionRequest::new(
            EXTRACTION_PROMPT,
            format!("Fragmento de conversación a analizar:\n---\n{excerpt}\n---"),
        )
        .with_model(&self.model.model, self.model.temperature, self.model.max_tokens);
        let reply = match self.provider.complete(request).await {
            Ok(response) => response.text,
            Err(e) => {
                warn!(conversation_id, error = %e, "Cart extraction call failed");
                return None;
            }
        };

        match parse_line_item(&reply) {
            Ok(item) => {
                info!(conversation_id, sku = %item.sku, quantity = item.quantity, "Cart item extracted");
                Some(item)
            }
            Err(e) => {
                warn!(conversation_id, error = %e, reply = %reply, "Cart extraction reply rejected");
                None
            }
        }
    }
}

/// Parse the extractor's reply, tolerating markdown code fences.
///
/// Accepts English or Spanish field names; numbers may arrive as strings.
pub fn parse_line_item(reply: &str) -> Result<LineItem, ExtractionError> {
    let cleaned = strip_fences(reply);
    let value: Value =
        serde_json::from_str(cleaned).map_err(|e| ExtractionError::NotJson(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ExtractionError::NotJson("top-level value is not an object".into()))?;

    let field = |names: &[&str]| names.iter().find_map(|n| object.get(*n));
    let text = |names: &[&str], label: &'static str| -> Result<String, ExtractionError> {
        field(names)
            .and_then(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .ok_or(ExtractionError::Invalid(label))
    };
    let number = |names: &[&str], label: &'static str| -> Result<f64, ExtractionError> {
        field(names)
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => parse_amount(s),
                _ => None,
            })
            .filter(|n: &f64| n.is_finite() && *n > 0.0)
            .ok_or(ExtractionError::Invalid(label))
    };

    let quantity = number(&["quantity", "cantidad"], "quantity")?;
    if quantity.fract() != 0.0 || quantity > f64::from(u32::MAX) {
        return Err(ExtractionError::Invalid("quantity"));
    }

    let item = LineItem {
        sku: text(&["sku", "SKU"], "sku")?,
        name: text(&["name", "nombre"], "name")?,
        quantity: quantity as u32,
        unit_price: number(&["price", "precio"], "price")?,
        category: text(&["category", "categoria"], "category")?,
    };
    debug!(?item, "Line item parsed");
    Ok(item)
}

/// A number written by a person: `"18.000"`, `"$4,500"`, `"2"` or `"3.5"`.
fn parse_amount(raw: &str) -> Option<f64> {
    let s = raw.trim().trim_start_matches('$').trim();
    let groups: Vec<&str> = s.split(['.', ',']).collect();
    let thousands = groups.len() > 1
        && groups[1..].iter().all(|g| g.len() == 3)
        && groups
            .iter()
            .all(|g| !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()));
    if thousands {
        groups.concat().parse().ok()
    } else {
        s.replace(',', ".").parse().ok()
    }
}

fn strip_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
