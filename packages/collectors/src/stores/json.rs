//! JSON file storage.
//!
//! Each saved batch is split by source and written as
//! `<dir>/<source>_<timestamp>_<suffix>.json`, one JSON array per file.
//! Files are written under a temporary name first and renamed into place
//! only once every file of the batch was written.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::traits::StorageAdapter;
use crate::types::{CollectedItem, ItemFilter};

pub struct JsonFileStorage {
    dir: PathBuf,
    /// Ids already on disk, loaded on first use
    known_ids: Mutex<Option<HashSet<String>>>,
}

impl JsonFileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            known_ids: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn data_files(&self) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_all(&self) -> StorageResult<Vec<CollectedItem>> {
        let mut items = Vec::new();
        for path in self.data_files().await? {
            let bytes = fs::read(&path).await?;
            let batch: Vec<CollectedItem> = serde_json::from_slice(&bytes)?;
            items.extend(batch);
        }
        Ok(items)
    }

    async fn write_batch(&self, groups: BTreeMap<String, Vec<CollectedItem>>) -> StorageResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let suffix = Uuid::new_v4().simple().to_string();

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(groups.len());
        for (source, items) in &groups {
            let file = format!("{}_{}_{}.json", file_safe(source), stamp, &suffix[..8]);
            let target = self.dir.join(file);
            let tmp = target.with_extension("json.tmp");
            let body = serde_json::to_vec_pretty(items)?;
            if let Err(e) = fs::write(&tmp, body).await {
                let mut leftovers = staged_paths(&staged);
                leftovers.push(tmp);
                remove_quietly(leftovers).await;
                return Err(e.into());
            }
            staged.push((tmp, target));
        }

        let mut published: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (tmp, target) in &staged {
            if let Err(e) = fs::rename(tmp, target).await {
                warn!(path = %target.display(), error = %e, "rolling back partially written batch");
                remove_quietly(published).await;
                remove_quietly(staged_paths(&staged)).await;
                return Err(e.into());
            }
            published.push(target.clone());
        }

        debug!(files = published.len(), dir = %self.dir.display(), "batch written");
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for JsonFileStorage {
    fn name(&self) -> &str {
        "json"
    }

    async fn save(&self, batch: &[CollectedItem]) -> StorageResult<usize> {
        let mut known = self.known_ids.lock().await;
        if known.is_none() {
            let ids = self.read_all().await?.into_iter().map(|i| i.id).collect();
            *known = Some(ids);
        }
        let ids = known.get_or_insert_with(HashSet::new);

        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut groups: BTreeMap<String, Vec<CollectedItem>> = BTreeMap::new();
        for item in batch {
            if ids.contains(&item.id) || !seen.insert(item.id.clone()) {
                continue;
            }
            groups
                .entry(item.source.clone())
                .or_default()
                .push(item.saved(now));
        }

        if groups.is_empty() {
            return Ok(0);
        }

        self.write_batch(groups).await?;
        let stored = seen.len();
        ids.extend(seen);
        Ok(stored)
    }

    async fn query(&self, filter: &ItemFilter) -> StorageResult<Vec<CollectedItem>> {
        let items = self.read_all().await?;
        Ok(items
            .into_iter()
            .filter(|item| filter.matches(item))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn staged_paths(staged: &[(PathBuf, PathBuf)]) -> Vec<PathBuf> {
    staged.iter().map(|(tmp, _)| tmp.clone()).collect()
}

async fn remove_quietly(paths: Vec<PathBuf>) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}
