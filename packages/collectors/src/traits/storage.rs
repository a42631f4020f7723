//! Storage adapter trait.
//!
//! Storages receive whole batches. A batch is committed atomically: either
//! every new item in it becomes visible or none does. Items already present
//! (same id) are left untouched.

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::{CollectedItem, ItemFilter};

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Registry name of this storage (e.g. "json").
    fn name(&self) -> &str;

    /// Commit a batch. Returns the number of newly stored items.
    async fn save(&self, items: &[CollectedItem]) -> StorageResult<usize>;

    /// Read items back, oldest first.
    async fn query(&self, filter: &ItemFilter) -> StorageResult<Vec<CollectedItem>>;

    /// Release resources. Later calls may fail with `StorageError::Closed`.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
