//! Adapter registry for resolving collaborators by name.
//!
//! Jobs name their source adapter (`collaborator`) and their storage
//! (`storage_config.type`). The registry maps those names to:
//! - factories that build a fresh source adapter for each job
//! - shared storage instances
//! - per-collaborator credentials
//!
//! # Example
//!
//! ```ignore
//! let mut registry = AdapterRegistry::new("memory");
//! registry.register_source("demo", || Box::new(MockSource::new("demo")));
//! registry.register_storage("memory", Arc::new(MemoryStorage::new()));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use collectors::{Credentials, SourceAdapter, StorageAdapter};
use tracing::warn;

type SourceFactory = Arc<dyn Fn() -> Box<dyn SourceAdapter> + Send + Sync>;

pub struct AdapterRegistry {
    sources: HashMap<String, SourceFactory>,
    storages: HashMap<String, Arc<dyn StorageAdapter>>,
    credentials: HashMap<String, Credentials>,
    default_storage: String,
}

impl AdapterRegistry {
    /// Create an empty registry. Jobs without a storage type use
    /// `default_storage`.
    pub fn new(default_storage: impl Into<String>) -> Self {
        Self {
            sources: HashMap::new(),
            storages: HashMap::new(),
            credentials: HashMap::new(),
            default_storage: default_storage.into(),
        }
    }

    /// Register a source adapter factory. Called once per job.
    pub fn register_source<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    {
        self.sources.insert(name.into(), Arc::new(factory));
    }

    pub fn register_storage(&mut self, name: impl Into<String>, storage: Arc<dyn StorageAdapter>) {
        self.storages.insert(name.into(), storage);
    }

    pub fn set_credentials(&mut self, name: impl Into<String>, credentials: Credentials) {
        self.credentials.insert(name.into(), credentials);
    }

    /// Build a fresh adapter for the named collaborator.
    pub fn source(&self, name: &str) -> Option<Box<dyn SourceAdapter>> {
        self.sources.get(name).map(|factory| factory())
    }

    /// Resolve a storage by type, falling back to the default storage when
    /// the job names none.
    pub fn storage(&self, storage_type: Option<&str>) -> Option<Arc<dyn StorageAdapter>> {
        let name = storage_type.unwrap_or(&self.default_storage);
        self.storages.get(name).cloned()
    }

    /// Credentials for a collaborator. Empty when none were configured.
    pub fn credentials(&self, name: &str) -> Credentials {
        self.credentials.get(name).cloned().unwrap_or_default()
    }

    pub fn default_storage(&self) -> &str {
        &self.default_storage
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Registered source names, sorted.
    pub fn registered_sources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered storage names, sorted.
    pub fn registered_storages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.storages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Close every registered storage, logging failures.
    pub async fn close_storages(&self) {
        for (name, storage) in &self.storages {
            if let Err(e) = storage.close().await {
                warn!(storage = %name, error = %e, "failed to close storage");
            }
        }
    }
}
