//! Collaborator contracts for HotStream collection jobs.
//!
//! The job engine never talks to a platform or a database of collected
//! items directly. It goes through two narrow traits:
//!
//! - [`SourceAdapter`] authenticates against a platform and streams
//!   [`RawItem`]s for a keyword search or an account list.
//! - [`StorageAdapter`] commits batches of [`CollectedItem`]s and reads
//!   them back.
//!
//! # Usage
//!
//! ```rust,ignore
//! use collectors::{MemoryStorage, StorageAdapter, ItemFilter};
//! use collectors::sources::MockSource;
//!
//! let storage = MemoryStorage::new();
//! storage.save(&items).await?;
//! let mine = storage.query(&ItemFilter::for_job("job-1")).await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Source and storage capability traits
//! - [`types`] - Items, search options, rate limits, filters
//! - [`stores`] - Storage implementations (memory, JSON files, PostgreSQL)
//! - [`sources`] - Mock source adapter
//! - [`testing`] - Failing storage for error-path tests

pub mod error;
pub mod sources;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

pub use error::{SourceError, SourceResult, StorageError, StorageResult};
pub use stores::{JsonFileStorage, MemoryStorage};
pub use traits::{ItemStream, SourceAdapter, StorageAdapter};
pub use types::{
    derive_item_id, CollectedItem, Credentials, ItemFilter, RateLimitInfo, RawItem, SearchOptions,
};

#[cfg(feature = "postgres")]
pub use stores::PostgresStorage;
