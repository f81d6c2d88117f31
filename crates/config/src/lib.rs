//! Configuration loading, validation, and management for flowbot.
//!
//! Loads configuration from `~/.flowbot/config.toml` with environment
//! variable overrides. Validates all settings at startup.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.flowbot/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Knowledge source and layout
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Model request settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Orchestration loop settings
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Write queue retry policy
    #[serde(default)]
    pub write_queue: WriteQueueConfig,

    /// External record store tables
    #[serde(default)]
    pub store: StoreConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the knowledge text lives and how it is laid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Path of the knowledge text file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,

    /// Key of the introduction block, always sent first
    #[serde(default = "default_intro_key")]
    pub intro_key: String,

    /// Key (or key fragment) of the section holding the scripted steps
    #[serde(default = "default_steps_section")]
    pub steps_section: String,

    /// Key (or key fragment) of the section holding product categories
    #[serde(default = "default_categories_section")]
    pub categories_section: String,

    /// Key of the testimonials / FAQ block
    #[serde(default = "default_testimonials_key")]
    pub testimonials_key: String,

    /// Glyph that opens a fallback `STEP <n>:` line
    #[serde(default = "default_step_glyph")]
    pub step_glyph: String,
}

fn default_intro_key() -> String {
    "introduction".into()
}
fn default_steps_section() -> String {
    "steps".into()
}
fn default_categories_section() -> String {
    "products".into()
}
fn default_testimonials_key() -> String {
    "testimonials".into()
}
fn default_step_glyph() -> String {
    "📍".into()
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            source_path: None,
            intro_key: default_intro_key(),
            steps_section: default_steps_section(),
            categories_section: default_categories_section(),
            testimonials_key: default_testimonials_key(),
            step_glyph: default_step_glyph(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// How many history messages accompany each completion request
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_history_window() -> usize {
    10
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            history_window: default_history_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Completion calls allowed per user turn, the first one included
    #[serde(default = "default_max_completions")]
    pub max_completions: u32,

    /// Glyph that introduces a directive in model output
    #[serde(default = "default_directive_glyph")]
    pub directive_glyph: String,

    /// Reply when the loop does not converge within budget
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Reply when the model cannot be reached
    #[serde(default = "default_apology_message")]
    pub apology_message: String,

    /// Whether the add-to-cart signal triggers line item extraction
    #[serde(default = "default_true")]
    pub cart_extraction: bool,
}

fn default_max_completions() -> u32 {
    3
}
fn default_directive_glyph() -> String {
    "🧩".into()
}
fn default_fallback_message() -> String {
    "Estoy teniendo problemas para procesar tu mensaje. Por favor intenta de nuevo en unos minutos."
        .into()
}
fn default_apology_message() -> String {
    "No pude procesar tu solicitud, por favor intenta más tarde.".into()
}
fn default_true() -> bool {
    true
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_completions: default_max_completions(),
            directive_glyph: default_directive_glyph(),
            fallback_message: default_fallback_message(),
            apology_message: default_apology_message(),
            cart_extraction: true,
        }
    }
}

/// Delay growth between write attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles after every failed attempt
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffKind,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    1000
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: BackoffKind::Fixed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_contacts_table")]
    pub contacts_table: String,

    #[serde(default = "default_orders_table")]
    pub orders_table: String,

    #[serde(default = "default_order_details_table")]
    pub order_details_table: String,
}

fn default_contacts_table() -> String {
    "CONTACTOS".into()
}
fn default_orders_table() -> String {
    "PEDIDOS".into()
}
fn default_order_details_table() -> String {
    "PEDIDOS_DETALLES".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            contacts_table: default_contacts_table(),
            orders_table: default_orders_table(),
            order_details_table: default_order_details_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.flowbot/config.toml).
    ///
    /// Environment overrides:
    /// - `FLOWBOT_KNOWLEDGE_PATH`
    /// - `FLOWBOT_MODEL`
    /// - `FLOWBOT_LOG_LEVEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(path) = std::env::var("FLOWBOT_KNOWLEDGE_PATH") {
            config.knowledge.source_path = Some(PathBuf::from(path));
        }

        if let Ok(model) = std::env::var("FLOWBOT_MODEL") {
            config.model.model = model;
        }

        if let Ok(level) = std::env::var("FLOWBOT_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".flowbot")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestration.max_completions == 0 {
            return Err(ConfigError::ValidationError(
                "orchestration.max_completions must be at least 1".into(),
            ));
        }

        if self.write_queue.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "write_queue.max_attempts must be at least 1".into(),
            ));
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let glyphs = [
            ("orchestration.directive_glyph", &self.orchestration.directive_glyph),
            ("knowledge.step_glyph", &self.knowledge.step_glyph),
        ];
        for (name, glyph) in glyphs {
            if glyph.trim().is_empty() || glyph.chars().any(|c| c.is_alphanumeric() || c == '_') {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be a non-empty, non-alphanumeric glyph"
                )));
            }
        }

        let tables = [
            &self.store.contacts_table,
            &self.store.orders_table,
            &self.store.order_details_table,
        ];
        if tables.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "store table names must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
