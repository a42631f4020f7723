//! Mock source adapter for testing.
//!
//! Provides a configurable implementation of the SourceAdapter trait with
//! canned items and call tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{SourceError, SourceResult};
use crate::traits::{ItemStream, SourceAdapter};
use crate::types::{Credentials, RateLimitInfo, RawItem, SearchOptions};

/// Calls recorded by every clone of one [`MockSource`].
#[derive(Default)]
pub struct MockCalls {
    authenticate: AtomicUsize,
    cleanup: AtomicUsize,
    yielded: AtomicUsize,
    searches: Mutex<Vec<Vec<String>>>,
    monitors: Mutex<Vec<Vec<String>>>,
}

/// Mock source adapter.
///
/// Clones share their call log, so a test can keep one clone and hand
/// another to the adapter registry.
///
/// # Example
///
/// ```rust
/// use collectors::sources::MockSource;
/// use collectors::RawItem;
///
/// let mock = MockSource::new("demo")
///     .with_item(RawItem::new("demo", "first item with enough text"));
/// assert_eq!(mock.search_call_count(), 0);
/// ```
#[derive(Clone)]
pub struct MockSource {
    name: String,
    items: Vec<RawItem>,
    accept_credentials: bool,
    fail_after: Option<usize>,
    item_delay: Option<Duration>,
    calls: Arc<MockCalls>,
}

impl MockSource {
    /// Create a mock with no items that accepts any credentials.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            accept_credentials: true,
            fail_after: None,
            item_delay: None,
            calls: Arc::new(MockCalls::default()),
        }
    }

    pub fn with_item(mut self, item: RawItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_items(mut self, items: impl IntoIterator<Item = RawItem>) -> Self {
        self.items.extend(items);
        self
    }

    /// Make `authenticate` return `false`.
    pub fn rejecting_credentials(mut self) -> Self {
        self.accept_credentials = false;
        self
    }

    /// Yield a collection error after `n` items.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Sleep before each item.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    pub fn authenticate_call_count(&self) -> usize {
        self.calls.authenticate.load(Ordering::SeqCst)
    }

    pub fn cleanup_call_count(&self) -> usize {
        self.calls.cleanup.load(Ordering::SeqCst)
    }

    /// Items handed out across all streams.
    pub fn yielded_count(&self) -> usize {
        self.calls.yielded.load(Ordering::SeqCst)
    }

    pub fn search_call_count(&self) -> usize {
        self.search_calls().len()
    }

    /// Keyword lists passed to `search`.
    pub fn search_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .searches
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Account lists passed to `monitor`.
    pub fn monitor_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .monitors
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn stream_items(&self, limit: usize) -> ItemStream<'_> {
        let items: Vec<RawItem> = self.items.iter().take(limit).cloned().collect();
        let fail_after = self.fail_after;
        let delay = self.item_delay;
        let calls = Arc::clone(&self.calls);

        stream! {
            for (i, item) in items.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(SourceError::collection(format!("mock failure after {i} items")));
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                calls.yielded.fetch_add(1, Ordering::SeqCst);
                yield Ok(item);
            }
        }
        .boxed()
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&mut self, _credentials: &Credentials) -> SourceResult<bool> {
        self.calls.authenticate.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept_credentials)
    }

    fn search(&self, keywords: Vec<String>, options: SearchOptions) -> ItemStream<'_> {
        if let Ok(mut calls) = self.calls.searches.lock() {
            calls.push(keywords);
        }
        self.stream_items(options.limit)
    }

    fn monitor(&self, accounts: Vec<String>, options: SearchOptions) -> ItemStream<'_> {
        if let Ok(mut calls) = self.calls.monitors.lock() {
            calls.push(accounts);
        }
        self.stream_items(options.limit)
    }

    async fn rate_limit(&self) -> SourceResult<RateLimitInfo> {
        Ok(RateLimitInfo {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            remaining: 1000,
            reset_at: None,
        })
    }

    async fn cleanup(&mut self) -> SourceResult<()> {
        self.calls.cleanup.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn items(n: usize) -> Vec<RawItem> {
        (0..n)
            .map(|i| RawItem::new("demo", format!("item number {i}")))
            .collect()
    }

    #[tokio::test]
    async fn search_respects_limit_and_records_keywords() {
        let mock = MockSource::new("demo").with_items(items(5));
        let got: Vec<RawItem> = mock
            .search(vec!["rust".into()], SearchOptions::default().with_limit(3))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(got.len(), 3);
        assert_eq!(mock.search_calls(), vec![vec!["rust".to_string()]]);
        assert_eq!(mock.yielded_count(), 3);
    }

    #[tokio::test]
    async fn failing_after_yields_error() {
        let mock = MockSource::new("demo").with_items(items(5)).failing_after(2);
        let mut stream = mock.search(vec![], SearchOptions::default());

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(SourceError::Collection(_))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn clones_share_call_log() {
        let mock = MockSource::new("demo").rejecting_credentials();
        let mut adapter = mock.clone();

        assert!(!adapter.authenticate(&Credentials::new()).await.unwrap());
        adapter.cleanup().await.unwrap();

        assert_eq!(mock.authenticate_call_count(), 1);
        assert_eq!(mock.cleanup_call_count(), 1);
    }
}
