//! Knowledge sources and the reloadable knowledge store.
//!
//! The store is an explicitly owned value created at startup and handed to
//! whoever composes prompts. Reloading swaps in a new `Arc<KnowledgeBase>`;
//! turns already holding a snapshot keep using it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flowbot_config::KnowledgeConfig;
use flowbot_core::error::KnowledgeError;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::base::{KnowledgeBase, KnowledgeLayout};

/// Where the raw knowledge text comes from.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Human-readable origin for logs (path, URL, ...).
    fn describe(&self) -> String;

    /// Fetch the full raw text.
    async fn fetch(&self) -> Result<String, KnowledgeError>;
}

/// Reads the knowledge text from a local file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KnowledgeSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<String, KnowledgeError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| KnowledgeError::FetchFailed {
                source_name: self.describe(),
                reason: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Err(KnowledgeError::Empty(self.describe()));
        }
        Ok(text)
    }
}

/// A fixed in-memory text; handy for tests and embedded knowledge.
pub struct StaticSource {
    name: String,
    text: String,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
impl KnowledgeSource for StaticSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn fetch(&self) -> Result<String, KnowledgeError> {
        if self.text.trim().is_empty() {
            return Err(KnowledgeError::Empty(self.name.clone()));
        }
        Ok(self.text.clone())
    }
}

/// Owns the current knowledge base and knows how to rebuild it.
pub struct KnowledgeStore {
    source: Arc<dyn KnowledgeSource>,
    layout: KnowledgeLayout,
    current: RwLock<Arc<KnowledgeBase>>,
}

impl KnowledgeStore {
    /// Fetch and segment the knowledge once at startup.
    ///
    /// A failed fetch leaves an empty base in place (logged) so the agent
    /// still starts; call [`reload`](Self::reload) once the source is back.
    pub async fn load(source: Arc<dyn KnowledgeSource>, layout: KnowledgeLayout) -> Self {
        info!(source = %source.describe(), "Loading knowledge base");
        let base = match source.fetch().await {
            Ok(raw) => KnowledgeBase::from_text(&raw, layout.clone()),
            Err(e) => {
                error!(source = %source.describe(), error = %e, "Knowledge fetch failed, starting empty");
                KnowledgeBase::empty(layout.clone())
            }
        };
        Self {
            source,
            layout,
            current: RwLock::new(Arc::new(base)),
        }
    }

    /// Load from the file named by `knowledge.source_path`, with the
    /// configured layout.
    pub async fn from_config(config: &KnowledgeConfig) -> Result<Self, KnowledgeError> {
        let path = config.source_path.as_ref().ok_or(KnowledgeError::NotConfigured)?;
        let source = Arc::new(FileSource::new(path.clone()));
        Ok(Self::load(source, KnowledgeLayout::from(config)).await)
    }

    /// Wrap an already built base (no source fetch).
    pub fn from_base(source: Arc<dyn KnowledgeSource>, base: KnowledgeBase) -> Self {
        Self {
            source,
            layout: base.layout().clone(),
            current: RwLock::new(Arc::new(base)),
        }
    }

    /// Fetch again and swap in the new base. On failure the previous base
    /// stays in place and the error is returned.
    pub async fn reload(&self) -> Result<Arc<KnowledgeBase>, KnowledgeError> {
        let raw = self.source.fetch().await.inspect_err(|e| {
            warn!(source = %self.source.describe(), error = %e, "Knowledge reload failed, keeping previous base");
        })?;
        let base = Arc::new(KnowledgeBase::from_text(&raw, self.layout.clone()));
        *self.current.write().await = Arc::clone(&base);
        info!(source = %self.source.describe(), "Knowledge base reloaded");
        Ok(base)
    }

    /// The base to use for one turn.
    pub async fn snapshot(&self) -> Arc<KnowledgeBase> {
        Arc::clone(&*self.current.read().await)
    }
}
