//! In-memory storage implementation for testing and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::traits::StorageAdapter;
use crate::types::{CollectedItem, ItemFilter};

#[derive(Default)]
struct Items {
    order: Vec<String>,
    by_id: HashMap<String, CollectedItem>,
}

/// In-memory item storage.
///
/// Useful for testing and development. Not suitable for production
/// as data is lost on restart.
#[derive(Default)]
pub struct MemoryStorage {
    items: RwLock<Items>,
    saves: RwLock<usize>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Create a new empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    pub async fn len(&self) -> usize {
        self.items.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of `save` calls that committed.
    pub async fn save_count(&self) -> usize {
        *self.saves.read().await
    }

    /// Look up one item by id.
    pub async fn get(&self, id: &str) -> Option<CollectedItem> {
        self.items.read().await.by_id.get(id).cloned()
    }

    /// All stored items in insertion order.
    pub async fn all(&self) -> Vec<CollectedItem> {
        let items = self.items.read().await;
        items
            .order
            .iter()
            .filter_map(|id| items.by_id.get(id).cloned())
            .collect()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed(self.name().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, batch: &[CollectedItem]) -> StorageResult<usize> {
        self.ensure_open()?;
        let now = Utc::now();

        // One write lock for the whole batch keeps it atomic to readers.
        let mut items = self.items.write().await;
        let mut stored = 0;
        for item in batch {
            if items.by_id.contains_key(&item.id) {
                continue;
            }
            items.order.push(item.id.clone());
            items.by_id.insert(item.id.clone(), item.saved(now));
            stored += 1;
        }
        drop(items);

        *self.saves.write().await += 1;
        Ok(stored)
    }

    async fn query(&self, filter: &ItemFilter) -> StorageResult<Vec<CollectedItem>> {
        self.ensure_open()?;
        let items = self.items.read().await;
        let matches = items
            .order
            .iter()
            .filter_map(|id| items.by_id.get(id))
            .filter(|item| filter.matches(item))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawItem;

    fn item(id: &str, content: &str) -> CollectedItem {
        CollectedItem::from_raw(RawItem::new("demo", content).with_id(id), content.into())
    }

    #[tokio::test]
    async fn save_and_query_in_order() {
        let storage = MemoryStorage::new();
        let saved = storage
            .save(&[item("a", "first item"), item("b", "second item")])
            .await
            .unwrap();
        assert_eq!(saved, 2);

        let all = storage.query(&ItemFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(all.iter().all(|i| i.saved_at.is_some()));
    }

    #[tokio::test]
    async fn existing_ids_are_never_overwritten() {
        let storage = MemoryStorage::new();
        storage.save(&[item("a", "original")]).await.unwrap();
        let saved = storage.save(&[item("a", "replacement")]).await.unwrap();

        assert_eq!(saved, 0);
        assert_eq!(storage.get("a").await.unwrap().content, "original");
        assert_eq!(storage.len().await, 1);
        assert_eq!(storage.save_count().await, 2);
    }

    #[tokio::test]
    async fn query_respects_limit() {
        let storage = MemoryStorage::new();
        storage
            .save(&[item("a", "one"), item("b", "two"), item("c", "three")])
            .await
            .unwrap();
        let two = storage
            .query(&ItemFilter::default().with_limit(2))
            .await
            .unwrap();
        assert_eq!(two.len(), 2);
    }

    #[tokio::test]
    async fn closed_storage_rejects_saves() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        let err = storage.save(&[item("a", "one")]).await.unwrap_err();
        assert!(matches!(err, StorageError::Closed(_)));
    }
}
