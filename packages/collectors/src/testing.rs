//! Test doubles for code that drives storage adapters.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::traits::StorageAdapter;
use crate::types::{CollectedItem, ItemFilter};

/// Storage whose saves always fail and which never holds anything.
#[derive(Default)]
pub struct FailingStorage {
    attempts: AtomicUsize,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls received.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageAdapter for FailingStorage {
    fn name(&self) -> &str {
        "failing"
    }

    async fn save(&self, _items: &[CollectedItem]) -> StorageResult<usize> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Save("disk full".into()))
    }

    async fn query(&self, _filter: &ItemFilter) -> StorageResult<Vec<CollectedItem>> {
        Ok(Vec::new())
    }
}
