//! Data pipeline: validate → clean → deduplicate → persist.
//!
//! Rejected items are dropped and counted, never surfaced as job errors.
//! Persistence hands the whole surviving batch to one storage adapter in a
//! single `save` call; if that call fails the job fails.

use std::collections::HashSet;

use collectors::{CollectedItem, RawItem, StorageAdapter, StorageError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Why an item was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("item has no id")]
    MissingId,
    #[error("item has no source")]
    MissingSource,
    #[error("item has no content")]
    MissingContent,
    #[error("content is {length} characters, minimum is {minimum}")]
    TooShort { length: usize, minimum: usize },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage adapter not found: {0}")]
    StorageNotFound(String),

    #[error("failed to persist batch: {0}")]
    Persist(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePolicy {
    /// Minimum trimmed content length, in characters
    pub min_content_length: usize,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            min_content_length: 10,
        }
    }
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: usize,
    pub rejected: usize,
    /// Content that cleaned down to nothing
    pub emptied: usize,
    pub duplicates: usize,
    /// Survivors handed to storage
    pub kept: usize,
    /// Newly stored, as reported by the storage
    pub persisted: usize,
}

/// Items that survived validation, cleaning and dedup.
#[derive(Debug, Clone, Default)]
pub struct ProcessedBatch {
    pub items: Vec<CollectedItem>,
    pub stats: PipelineStats,
}

#[derive(Debug, Clone, Default)]
pub struct DataPipeline {
    policy: PipelinePolicy,
}

impl DataPipeline {
    pub fn new(policy: PipelinePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    pub fn validate(&self, item: &RawItem) -> Result<(), ValidationError> {
        if item.id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        if item.source.trim().is_empty() {
            return Err(ValidationError::MissingSource);
        }
        let content = item.content.trim();
        if content.is_empty() {
            return Err(ValidationError::MissingContent);
        }
        let length = content.chars().count();
        if length < self.policy.min_content_length {
            return Err(ValidationError::TooShort {
                length,
                minimum: self.policy.min_content_length,
            });
        }
        Ok(())
    }

    /// Collapse whitespace runs to single spaces. `None` if nothing is left.
    pub fn clean(&self, item: RawItem) -> Option<CollectedItem> {
        let content = normalize_whitespace(&item.content);
        if content.is_empty() {
            return None;
        }
        Some(CollectedItem::from_raw(item, content))
    }

    /// Drop repeated ids within the batch, keeping the first occurrence.
    pub fn deduplicate(&self, items: Vec<CollectedItem>) -> (Vec<CollectedItem>, usize) {
        let mut seen = HashSet::with_capacity(items.len());
        let before = items.len();
        let unique: Vec<CollectedItem> = items
            .into_iter()
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        let dropped = before - unique.len();
        (unique, dropped)
    }

    /// Run validation, cleaning and dedup, and stamp the producing job into
    /// each item's metadata.
    pub fn process(&self, raw: Vec<RawItem>, job_id: &str, keywords: &[String]) -> ProcessedBatch {
        let mut stats = PipelineStats {
            received: raw.len(),
            ..Default::default()
        };

        let mut cleaned = Vec::with_capacity(raw.len());
        for item in raw {
            if let Err(reason) = self.validate(&item) {
                debug!(job_id, item_id = %item.id, %reason, "item rejected");
                stats.rejected += 1;
                continue;
            }
            match self.clean(item) {
                Some(mut item) => {
                    item.metadata
                        .insert("job_id".into(), Value::String(job_id.to_string()));
                    item.metadata.insert(
                        "keywords".into(),
                        Value::Array(keywords.iter().cloned().map(Value::String).collect()),
                    );
                    cleaned.push(item);
                }
                None => stats.emptied += 1,
            }
        }

        let (items, duplicates) = self.deduplicate(cleaned);
        stats.duplicates = duplicates;
        stats.kept = items.len();

        ProcessedBatch { items, stats }
    }

    /// Save the batch through `storage`. An empty batch is not sent.
    pub async fn persist(
        &self,
        storage: &dyn StorageAdapter,
        batch: &mut ProcessedBatch,
    ) -> Result<usize, PipelineError> {
        if batch.items.is_empty() {
            return Ok(0);
        }
        let stored = storage.save(&batch.items).await?;
        batch.stats.persisted = stored;
        info!(
            storage = storage.name(),
            received = batch.stats.received,
            rejected = batch.stats.rejected,
            duplicates = batch.stats.duplicates,
            kept = batch.stats.kept,
            persisted = stored,
            "batch persisted"
        );
        Ok(stored)
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
