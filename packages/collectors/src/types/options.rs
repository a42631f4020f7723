//! Options passed to adapters and filters used when reading storage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::item::CollectedItem;

/// Credentials for one collaborator, as plain key/value pairs.
pub type Credentials = HashMap<String, String>;

/// Parameters for a search or monitor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum number of items the adapter should yield
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort_by: Option<String>,
    /// Adapter-specific filters, passed through untouched
    #[serde(default)]
    pub filters: Map<String, Value>,
}

fn default_limit() -> usize {
    100
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            since: None,
            until: None,
            sort_by: None,
            filters: Map::new(),
        }
    }
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Snapshot of an adapter's rate limit budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    /// Whether the adapter can make another request right now.
    pub fn has_budget(&self) -> bool {
        self.remaining > 0
    }
}

/// Filter for [`crate::StorageAdapter::query`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemFilter {
    pub source: Option<String>,
    pub author: Option<String>,
    /// Matches the `job_id` metadata key
    pub job_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    /// Filter for items from a single source.
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    /// Filter for items written by a single job.
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an item passes every set field of the filter.
    pub fn matches(&self, item: &CollectedItem) -> bool {
        if let Some(source) = &self.source {
            if &item.source != source {
                return false;
            }
        }
        if let Some(author) = &self.author {
            if item.author.as_ref() != Some(author) {
                return false;
            }
        }
        if let Some(job_id) = &self.job_id {
            if item.metadata.get("job_id").and_then(Value::as_str) != Some(job_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            match item.saved_at {
                Some(saved_at) if saved_at >= since => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::item::RawItem;

    fn item(source: &str, job: &str) -> CollectedItem {
        let raw = RawItem::new(source, "some content").with_metadata("job_id", job);
        CollectedItem::from_raw(raw, "some content".into())
    }

    #[test]
    fn search_options_default_limit_is_100() {
        assert_eq!(SearchOptions::default().limit, 100);
        let parsed: SearchOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.limit, 100);
    }

    #[test]
    fn filter_by_source_and_job() {
        let a = item("alpha", "job-1");
        let b = item("beta", "job-1");

        assert!(ItemFilter::for_source("alpha").matches(&a));
        assert!(!ItemFilter::for_source("alpha").matches(&b));
        assert!(ItemFilter::for_job("job-1").matches(&b));
        assert!(!ItemFilter::for_job("job-2").matches(&b));
    }

    #[test]
    fn since_filter_excludes_unsaved_items() {
        let filter = ItemFilter {
            since: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!filter.matches(&item("alpha", "job-1")));
    }
}
