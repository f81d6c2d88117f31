//! Named knowledge blocks in document order.

/// A named chunk of reference text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeBlock {
    /// Normalized key (`[a-z0-9_]+`)
    pub key: String,
    pub text: String,
}

/// Key → text map that remembers document order.
///
/// Order matters for substring resolution: the first block whose key
/// contains a fragment wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocks {
    entries: Vec<KnowledgeBlock>,
}

impl Blocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a block. A replaced block keeps its position.
    /// Returns the previous text, if any.
    pub fn insert(&mut self, key: impl Into<String>, text: impl Into<String>) -> Option<String> {
        let key = key.into();
        let text = text.into();
        match self.entries.iter_mut().find(|b| b.key == key) {
            Some(existing) => Some(std::mem::replace(&mut existing.text, text)),
            None => {
                self.entries.push(KnowledgeBlock { key, text });
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|b| b.key == key)
            .map(|b| b.text.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|b| b.key == key)
    }

    /// Exact key match, else the first block whose key contains `fragment`.
    pub fn find(&self, fragment: &str) -> Option<&KnowledgeBlock> {
        if fragment.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|b| b.key == fragment)
            .or_else(|| self.find_containing(fragment))
    }

    /// The first block whose key contains `fragment`.
    pub fn find_containing(&self, fragment: &str) -> Option<&KnowledgeBlock> {
        if fragment.is_empty() {
            return None;
        }
        self.entries.iter().find(|b| b.key.contains(fragment))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|b| b.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnowledgeBlock> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
