//! Executor: runs one claimed job end to end.
//!
//! ```text
//! Executor::run
//!     ├─► resolve source adapter + storage (registry)
//!     ├─► authenticate, stream items          progress 20% → 60%
//!     │       └─► heartbeat every N items
//!     ├─► validate / clean / dedup            progress 60% → 80%
//!     ├─► persist batch                       progress 80% → 90%
//!     └─► finish(completed | failed)          progress 100% on success
//! ```
//!
//! Heartbeats double as cancellation checks: when the store reports the job
//! cancelled or owned by someone else, the executor stops without calling
//! `finish`.

use std::sync::Arc;

use collectors::{RawItem, SourceAdapter, SourceError};
use futures::StreamExt;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{FinishOutcome, Job, JobKind};
use super::pipeline::{DataPipeline, PipelineError, PipelinePolicy};
use super::registry::AdapterRegistry;
use super::store::{HeartbeatOutcome, JobOutcome, JobStore};

const COLLECT_START: f64 = 0.2;
const COLLECT_END: f64 = 0.6;
const PROCESSED: f64 = 0.8;
const PERSISTED: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("source adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("authentication rejected by {0}")]
    Authentication(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("job exceeded its timeout of {0}s")]
    Timeout(u64),

    #[error("worker shutting down")]
    Interrupted,

    #[error("job was cancelled")]
    Cancelled,

    #[error("job is no longer owned by this worker")]
    OwnershipLost,

    #[error("job store error: {0:#}")]
    Store(anyhow::Error),
}

impl ExecutionError {
    /// The record is already terminal or owned elsewhere; do not finish it.
    pub fn is_abort(&self) -> bool {
        matches!(self, ExecutionError::Cancelled | ExecutionError::OwnershipLost)
    }
}

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Items between heartbeats while collecting
    pub heartbeat_every: usize,
    pub pipeline: PipelinePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            heartbeat_every: 10,
            pipeline: PipelinePolicy::default(),
        }
    }
}

pub struct Executor {
    store: Arc<dyn JobStore>,
    registry: Arc<AdapterRegistry>,
    pipeline: DataPipeline,
    config: ExecutorConfig,
    worker_id: String,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<AdapterRegistry>,
        worker_id: impl Into<String>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pipeline: DataPipeline::new(config.pipeline),
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run a job this worker has claimed and record how it ended.
    ///
    /// Returns the store transition, or the abort reason when the job was
    /// cancelled or taken over mid-run.
    pub async fn run(
        &self,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<FinishOutcome, ExecutionError> {
        info!(
            job_id = %job.job_id,
            collaborator = %job.collaborator,
            kind = ?job.kind,
            attempt = job.current_retry + 1,
            "executing job"
        );

        let outcome = match self.execute(&job, &cancel).await {
            Ok(result_count) => JobOutcome::Completed { result_count },
            Err(e) if e.is_abort() => {
                warn!(job_id = %job.job_id, reason = %e, "job aborted");
                return Err(e);
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "job failed");
                JobOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let finished = self
            .store
            .finish(&job.job_id, &self.worker_id, outcome)
            .await
            .map_err(ExecutionError::Store)?;

        match &finished {
            FinishOutcome::Completed => info!(job_id = %job.job_id, "job completed"),
            FinishOutcome::Rescheduled { next_run_at } => {
                info!(job_id = %job.job_id, next_run_at = %next_run_at, "job completed, rescheduled")
            }
            FinishOutcome::Retrying { attempt, retry_at } => warn!(
                job_id = %job.job_id,
                retry = attempt,
                max_retry = job.max_retry,
                retry_at = %retry_at,
                "job will be retried"
            ),
            FinishOutcome::Failed => warn!(
                job_id = %job.job_id,
                max_retry = job.max_retry,
                "job failed after all retries"
            ),
            FinishOutcome::OwnershipLost => return Err(ExecutionError::OwnershipLost),
        }
        Ok(finished)
    }

    /// Everything up to (not including) `finish`. Returns the result count.
    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Result<i32, ExecutionError> {
        let mut adapter = self
            .registry
            .source(&job.collaborator)
            .ok_or_else(|| ExecutionError::AdapterNotFound(job.collaborator.clone()))?;
        let storage_name = job
            .storage_type()
            .unwrap_or(self.registry.default_storage())
            .to_string();
        let storage = self
            .registry
            .storage(job.storage_type())
            .ok_or(PipelineError::StorageNotFound(storage_name))?;

        let deadline = Instant::now() + job.timeout();
        let timed_out = || ExecutionError::Timeout(job.timeout().as_secs());

        let collected = timeout_at(deadline, self.collect(job, adapter.as_mut(), cancel)).await;
        if let Err(e) = adapter.cleanup().await {
            warn!(job_id = %job.job_id, error = %e, "adapter cleanup failed");
        }
        let raw = collected.map_err(|_| timed_out())??;

        self.beat(job, COLLECT_END).await?;
        let mut batch = self.pipeline.process(raw, &job.job_id, &job.keywords);
        self.beat(job, PROCESSED).await?;
        check_interrupted(cancel)?;

        timeout_at(deadline, self.pipeline.persist(storage.as_ref(), &mut batch))
            .await
            .map_err(|_| timed_out())??;
        self.beat(job, PERSISTED).await?;

        Ok(batch.items.len() as i32)
    }

    async fn collect(
        &self,
        job: &Job,
        adapter: &mut dyn SourceAdapter,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, ExecutionError> {
        let credentials = self.registry.credentials(&job.collaborator);
        if !adapter.authenticate(&credentials).await? {
            return Err(ExecutionError::Authentication(job.collaborator.clone()));
        }
        self.beat(job, COLLECT_START).await?;

        let options = job.search_options();
        let limit = options.limit;
        let adapter: &dyn SourceAdapter = adapter;
        let mut stream = match job.kind {
            JobKind::Search if job.keywords.is_empty() => {
                return Err(ExecutionError::InvalidJob("search job has no keywords".into()))
            }
            JobKind::Monitor if job.accounts.is_empty() => {
                return Err(ExecutionError::InvalidJob("monitor job has no accounts".into()))
            }
            JobKind::Search => adapter.search(job.keywords.clone(), options),
            JobKind::Monitor => adapter.monitor(job.accounts.clone(), options),
        };

        let every = self.config.heartbeat_every.max(1);
        let mut items = Vec::with_capacity(limit.min(1024));
        while items.len() < limit {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutionError::Interrupted),
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            items.push(item?);

            if items.len() % every == 0 {
                self.beat(job, collect_progress(items.len(), limit)).await?;
            }
        }

        debug!(job_id = %job.job_id, collected = items.len(), limit, "collection finished");
        Ok(items)
    }

    /// Heartbeat with progress; doubles as the cancellation check.
    async fn beat(&self, job: &Job, progress: f64) -> Result<(), ExecutionError> {
        match self
            .store
            .heartbeat(&job.job_id, &self.worker_id, progress)
            .await
        {
            Ok(HeartbeatOutcome::Alive) => Ok(()),
            Ok(HeartbeatOutcome::Cancelled) => Err(ExecutionError::Cancelled),
            Ok(HeartbeatOutcome::OwnershipLost) => Err(ExecutionError::OwnershipLost),
            Err(e) => {
                // Store hiccup: keep working, the next beat will tell.
                warn!(job_id = %job.job_id, error = %e, "heartbeat failed");
                Ok(())
            }
        }
    }
}

/// 20% at the first item, 60% once `limit` items are in.
fn collect_progress(collected: usize, limit: usize) -> f64 {
    if limit == 0 {
        return COLLECT_END;
    }
    let fraction = (collected as f64 / limit as f64).min(1.0);
    COLLECT_START + fraction * (COLLECT_END - COLLECT_START)
}

fn check_interrupted(cancel: &CancellationToken) -> Result<(), ExecutionError> {
    if cancel.is_cancelled() {
        return Err(ExecutionError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use collectors::sources::MockSource;
    use collectors::testing::FailingStorage;
    use collectors::{ItemFilter, MemoryStorage, StorageAdapter};
    use serde_json::json;

    use super::super::job::{ClaimLane, JobStatus, RetryPolicy};
    use super::super::memory_store::MemoryJobStore;
    use super::super::store::{JobStats, ReapedJob};
    use super::*;

    /// Memory store that remembers every progress value it was sent.
    struct RecordingStore {
        inner: MemoryJobStore,
        beats: Mutex<Vec<f64>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                inner: MemoryJobStore::with_retry_policy(RetryPolicy::immediate()),
                beats: Mutex::new(Vec::new()),
            }
        }

        fn beats(&self) -> Vec<f64> {
            self.beats.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobStore for RecordingStore {
        async fn insert(&self, job: Job) -> Result<Job> {
            self.inner.insert(job).await
        }
        async fn get(&self, job_id: &str) -> Result<Option<Job>> {
            self.inner.get(job_id).await
        }
        async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
            self.inner.list(status, limit).await
        }
        async fn claim_next(&self, worker_id: &str, lane: ClaimLane) -> Result<Option<Job>> {
            self.inner.claim_next(worker_id, lane).await
        }
        async fn heartbeat(
            &self,
            job_id: &str,
            worker_id: &str,
            progress: f64,
        ) -> Result<HeartbeatOutcome> {
            self.beats.lock().unwrap().push(progress);
            self.inner.heartbeat(job_id, worker_id, progress).await
        }
        async fn finish(
            &self,
            job_id: &str,
            worker_id: &str,
            outcome: JobOutcome,
        ) -> Result<FinishOutcome> {
            self.inner.finish(job_id, worker_id, outcome).await
        }
        async fn reap_zombies(&self, max_silence: Duration) -> Result<Vec<ReapedJob>> {
            self.inner.reap_zombies(max_silence).await
        }
        async fn cancel(&self, job_id: &str) -> Result<bool> {
            self.inner.cancel(job_id).await
        }
        async fn stats(&self) -> Result<JobStats> {
            self.inner.stats().await
        }
    }

    struct Harness {
        store: Arc<RecordingStore>,
        storage: Arc<MemoryStorage>,
        executor: Executor,
    }

    fn harness(mock: MockSource, heartbeat_every: usize) -> Harness {
        let store = Arc::new(RecordingStore::new());
        let storage = Arc::new(MemoryStorage::new());

        let mut registry = AdapterRegistry::new("memory");
        registry.register_source("demo", move || Box::new(mock.clone()));
        registry.register_storage("memory", storage.clone());
        registry.register_storage("broken", Arc::new(FailingStorage::new()));

        let config = ExecutorConfig {
            heartbeat_every,
            ..Default::default()
        };
        let executor = Executor::new(store.clone(), Arc::new(registry), "worker-1", config);
        Harness {
            store,
            storage,
            executor,
        }
    }

    fn items(n: usize) -> Vec<RawItem> {
        (0..n)
            .map(|i| {
                RawItem::new("demo", format!("collected item number {i}")).with_id(format!("item-{i}"))
            })
            .collect()
    }

    fn search_job() -> Job {
        Job::builder()
            .name("rust search")
            .collaborator("demo")
            .keywords(vec!["rust".to_string()])
            .build()
    }

    async fn claim(h: &Harness, job: Job) -> Job {
        h.store.insert(job).await.unwrap();
        h.store
            .claim_next("worker-1", ClaimLane::Normal)
            .await
            .unwrap()
            .expect("job should be claimable")
    }

    #[tokio::test]
    async fn successful_run_reports_progress_and_persists() {
        let mock = MockSource::new("demo")
            .with_items(items(25))
            .with_item(RawItem::new("demo", "tiny").with_id("short"));
        let h = harness(mock.clone(), 10);
        let job = claim(&h, search_job()).await;

        let outcome = h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, FinishOutcome::Completed);

        let beats = h.store.beats();
        assert_eq!(beats.len(), 6);
        assert!((beats[0] - 0.2).abs() < 1e-9);
        assert!((beats[1] - 0.24).abs() < 1e-9);
        assert!((beats[2] - 0.28).abs() < 1e-9);
        assert_eq!(&beats[3..], &[0.6, 0.8, 0.9]);

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_count, 25);
        assert_eq!(stored.progress, 1.0);

        let saved = h.storage.query(&ItemFilter::for_job(&job.job_id)).await.unwrap();
        assert_eq!(saved.len(), 25);
        assert_eq!(mock.search_calls(), vec![vec!["rust".to_string()]]);
        assert_eq!(mock.cleanup_call_count(), 1);
    }

    #[tokio::test]
    async fn result_limit_caps_collection() {
        let mock = MockSource::new("demo").with_items(items(30));
        let h = harness(mock, 10);
        let mut job = search_job();
        job.result_limit = 5;
        let job = claim(&h, job).await;

        h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.result_count, 5);
    }

    #[tokio::test]
    async fn monitor_jobs_watch_accounts() {
        let mock = MockSource::new("demo").with_items(items(3));
        let h = harness(mock.clone(), 10);
        let job = Job::builder()
            .name("watch")
            .collaborator("demo")
            .kind(JobKind::Monitor)
            .accounts(vec!["@rustlang".to_string()])
            .build();
        let job = claim(&h, job).await;

        h.executor.run(job, CancellationToken::new()).await.unwrap();

        assert_eq!(mock.monitor_calls(), vec![vec!["@rustlang".to_string()]]);
        assert_eq!(mock.search_call_count(), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_job_and_clean_up() {
        let mock = MockSource::new("demo").rejecting_credentials();
        let h = harness(mock.clone(), 10);
        let job = claim(&h, search_job()).await;

        let outcome = h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, FinishOutcome::Retrying { attempt: 1, .. }));

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("authentication"));
        assert_eq!(mock.cleanup_call_count(), 1);
        assert!(h.store.beats().is_empty());
    }

    #[tokio::test]
    async fn unknown_collaborator_fails_fast() {
        let h = harness(MockSource::new("demo"), 10);
        let mut job = search_job();
        job.collaborator = "nowhere".into();
        job.max_retry = 0;
        let job = claim(&h, job).await;

        let outcome = h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, FinishOutcome::Failed);

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn source_error_mid_stream_fails_the_run() {
        let mock = MockSource::new("demo").with_items(items(10)).failing_after(3);
        let h = harness(mock.clone(), 10);
        let job = claim(&h, search_job()).await;

        let outcome = h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, FinishOutcome::Retrying { .. }));
        assert_eq!(mock.cleanup_call_count(), 1);
        assert!(h.storage.is_empty().await);
    }

    #[tokio::test]
    async fn storage_failure_fails_the_run() {
        let mock = MockSource::new("demo").with_items(items(3));
        let h = harness(mock, 10);
        let mut job = search_job();
        job.storage_config = json!({ "type": "broken" });
        let job = claim(&h, job).await;

        h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.error_message.unwrap().contains("persist"));
    }

    #[tokio::test]
    async fn cancelled_job_aborts_without_finishing() {
        let mock = MockSource::new("demo").with_items(items(3));
        let h = harness(mock.clone(), 10);
        let job = claim(&h, search_job()).await;
        assert!(h.store.cancel(&job.job_id).await.unwrap());

        let err = h
            .executor
            .run(job.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(mock.cleanup_call_count(), 1);
        assert!(h.storage.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_interrupts_collection_as_a_retryable_failure() {
        let mock = MockSource::new("demo").with_items(items(20));
        let h = harness(mock.clone(), 10);
        let job = claim(&h, search_job()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.executor.run(job.clone(), cancel).await.unwrap();
        assert!(matches!(outcome, FinishOutcome::Retrying { .. }));
        assert_eq!(mock.yielded_count(), 0);

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("worker shutting down"));
    }

    #[tokio::test]
    async fn slow_source_hits_the_job_timeout() {
        let mock = MockSource::new("demo")
            .with_items(items(2))
            .with_item_delay(Duration::from_secs(30));
        let h = harness(mock.clone(), 10);
        let mut job = search_job();
        job.timeout_seconds = 1;
        let job = claim(&h, job).await;

        h.executor.run(job.clone(), CancellationToken::new()).await.unwrap();

        let stored = h.store.get(&job.job_id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("timeout of 1s"));
        assert_eq!(mock.cleanup_call_count(), 1);
    }

    #[test]
    fn collect_progress_spans_twenty_to_sixty_percent() {
        assert!((collect_progress(0, 100) - 0.2).abs() < 1e-9);
        assert!((collect_progress(50, 100) - 0.4).abs() < 1e-9);
        assert!((collect_progress(100, 100) - 0.6).abs() < 1e-9);
        assert!((collect_progress(500, 100) - 0.6).abs() < 1e-9);
        assert!((collect_progress(3, 0) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn only_cancellation_and_takeover_abort() {
        assert!(ExecutionError::Cancelled.is_abort());
        assert!(ExecutionError::OwnershipLost.is_abort());
        assert!(!ExecutionError::Interrupted.is_abort());
        assert!(!ExecutionError::Timeout(5).is_abort());
        assert!(!ExecutionError::AdapterNotFound("x".into()).is_abort());
    }
}
