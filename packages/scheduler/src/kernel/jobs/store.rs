//! Job store gateway.
//!
//! The only way the engine reads or changes job records. Every operation that
//! changes ownership (claim, heartbeat, finish, reap, cancel) is a single
//! conditional update, so concurrent workers in different processes can
//! race on the same row and at most one of them wins.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::{
    ClaimLane, FinishOutcome, Job, JobStatus, HIGHEST_PRIORITY, LOWEST_PRIORITY,
};
use super::schedule::parse_schedule;

/// What a worker reports when it lets go of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { result_count: i32 },
    Failed { error: String },
}

/// Answer to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Still owned by the caller; timestamp and progress updated
    Alive,
    /// The job was cancelled; the caller should stop
    Cancelled,
    /// Someone else owns the job or it already finished
    OwnershipLost,
}

/// A running job the reaper finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapedJob {
    pub job_id: String,
    /// Worker that stopped heartbeating
    pub worker_id: Option<String>,
    pub outcome: FinishOutcome,
}

/// Job counts for dashboards and the worker's startup log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub by_status: BTreeMap<String, i64>,
    pub by_collaborator: BTreeMap<String, i64>,
}

impl JobStats {
    pub fn total(&self) -> i64 {
        self.by_status.values().sum()
    }

    pub fn count(&self, status: JobStatus) -> i64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Standard error message for jobs taken back by the reaper.
pub fn zombie_message(silent_for: Duration) -> String {
    format!(
        "zombie job reclaimed: no heartbeat for {}s",
        silent_for.as_secs()
    )
}

/// Check a client-built job and reset its lifecycle fields for insertion.
pub(crate) fn prepare_insert(mut job: Job, now: DateTime<Utc>) -> Result<Job> {
    ensure!(!job.job_id.trim().is_empty(), "job id must not be empty");
    ensure!(
        (HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&job.priority),
        "priority {} outside {}..={}",
        job.priority,
        HIGHEST_PRIORITY,
        LOWEST_PRIORITY
    );
    ensure!(job.result_limit > 0, "result limit must be positive");
    ensure!(job.max_retry >= 0, "max retry must not be negative");
    ensure!(job.timeout_seconds > 0, "timeout must be positive");
    if let Some(schedule) = job.schedule.as_deref() {
        parse_schedule(schedule)?;
    }

    job.status = JobStatus::Pending;
    job.worker_id = None;
    job.current_retry = 0;
    job.progress = 0.0;
    job.result_count = 0;
    job.error_message = None;
    job.retry_at = None;
    job.started_at = None;
    job.completed_at = None;
    job.last_heartbeat = None;
    job.created_at = now;
    job.updated_at = now;
    job.next_run_at = job.initial_run_at(now);
    Ok(job)
}

/// Trait for job store operations.
///
/// Implementations: [`super::PostgresJobStore`] for production and
/// [`super::MemoryJobStore`] for tests and single-process runs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job. Computes `next_run_at` for scheduled jobs.
    async fn insert(&self, job: Job) -> Result<Job>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Most recently created first.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;

    /// Atomically claim the best-ranked due job in the lane.
    ///
    /// Ranking: lowest priority value, then immediate first, then oldest.
    async fn claim_next(&self, worker_id: &str, lane: ClaimLane) -> Result<Option<Job>>;

    /// Refresh the heartbeat and raise progress (never lowers it).
    async fn heartbeat(&self, job_id: &str, worker_id: &str, progress: f64)
        -> Result<HeartbeatOutcome>;

    /// Record the end of a run owned by `worker_id`.
    async fn finish(&self, job_id: &str, worker_id: &str, outcome: JobOutcome)
        -> Result<FinishOutcome>;

    /// Fail running jobs silent for longer than `min(max_silence, job timeout)`.
    async fn reap_zombies(&self, max_silence: Duration) -> Result<Vec<ReapedJob>>;

    /// Cancel a pending or running job. Returns false for any other state.
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    async fn stats(&self) -> Result<JobStats>;
}
