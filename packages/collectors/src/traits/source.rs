//! Source adapter trait for pluggable data collection.
//!
//! A source adapter wraps one external platform. The job engine creates a
//! fresh adapter per job, authenticates it, drains one item stream from it
//! and then calls [`SourceAdapter::cleanup`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use collectors::{SearchOptions, SourceAdapter};
//! use futures::StreamExt;
//!
//! adapter.authenticate(&credentials).await?;
//! let mut items = adapter.search(vec!["rust".into()], SearchOptions::default());
//! while let Some(item) = items.next().await {
//!     let item = item?;
//! }
//! ```

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{SourceError, SourceResult};
use crate::types::{Credentials, RateLimitInfo, RawItem, SearchOptions};

/// A finite, non-restartable stream of raw items.
pub type ItemStream<'a> = BoxStream<'a, SourceResult<RawItem>>;

/// Capability interface every collaborator platform implements.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry name of this adapter (e.g. "twitter").
    fn name(&self) -> &str;

    /// Authenticate with the platform. Returns `false` when the credentials
    /// were understood but rejected.
    async fn authenticate(&mut self, credentials: &Credentials) -> SourceResult<bool>;

    /// Stream items matching any of the keywords.
    fn search(&self, keywords: Vec<String>, options: SearchOptions) -> ItemStream<'_>;

    /// Stream recent items from the given accounts.
    ///
    /// Adapters without account monitoring keep this default, which yields a
    /// single `Unsupported` error.
    fn monitor(&self, accounts: Vec<String>, options: SearchOptions) -> ItemStream<'_> {
        let _ = (accounts, options);
        let err = SourceError::Unsupported {
            source_name: self.name().to_string(),
            operation: "account monitoring",
        };
        stream::once(async move { Err(err) }).boxed()
    }

    /// Current rate limit budget.
    async fn rate_limit(&self) -> SourceResult<RateLimitInfo> {
        Ok(RateLimitInfo::default())
    }

    /// Release connections or sessions. Called once per job, success or not.
    async fn cleanup(&mut self) -> SourceResult<()> {
        Ok(())
    }
}
