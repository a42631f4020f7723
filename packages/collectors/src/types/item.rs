//! Item types flowing from source adapters to storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// An item exactly as a source adapter produced it.
///
/// Nothing here has been validated yet. Adapters that know a native
/// identifier (a post id, a message id) set it with [`RawItem::with_id`];
/// otherwise the id is derived from the item's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub source: String,
    pub content: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub raw: Value,
}

impl RawItem {
    /// Create an item with a content-derived id.
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        let source = source.into();
        let content = content.into();
        Self {
            id: derive_item_id(&source, None, &content),
            source,
            content,
            author: None,
            url: None,
            created_at: None,
            metadata: Map::new(),
            raw: Value::Null,
        }
    }

    /// Use a native identifier instead of the derived one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the origin URL. A derived id is recomputed to include it.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if self.id == derive_item_id(&self.source, self.url.as_deref(), &self.content) {
            self.id = derive_item_id(&self.source, Some(&url), &self.content);
        }
        self.url = Some(url);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }
}

/// An item that passed validation and cleaning.
///
/// Immutable once saved: storages never update an existing id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedItem {
    pub id: String,
    pub source: String,
    pub content: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub raw: Value,
    /// Set by the storage when the item is committed
    pub saved_at: Option<DateTime<Utc>>,
}

impl CollectedItem {
    /// Build from a raw item, replacing its content with the cleaned text.
    pub fn from_raw(raw: RawItem, content: String) -> Self {
        Self {
            id: raw.id,
            source: raw.source,
            content,
            author: raw.author,
            url: raw.url,
            created_at: raw.created_at,
            metadata: raw.metadata,
            raw: raw.raw,
            saved_at: None,
        }
    }

    /// Copy of this item stamped with the save time.
    pub fn saved(&self, at: DateTime<Utc>) -> Self {
        Self {
            saved_at: Some(at),
            ..self.clone()
        }
    }
}

/// Derive a stable item id from where it came from and what it says.
///
/// SHA-256 over the source name, URL and content, hex encoded.
pub fn derive_item_id(source: &str, url: Option<&str>, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(url.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
