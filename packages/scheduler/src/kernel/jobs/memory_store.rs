//! In-memory job store for tests and single-process runs.
//!
//! Every operation takes the one mutex for its whole duration, which gives
//! the same at-most-one-winner guarantee as the conditional updates in
//! PostgreSQL.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::job::{ClaimLane, FinishOutcome, Job, JobStatus, RetryPolicy};
use super::store::{
    prepare_insert, zombie_message, HeartbeatOutcome, JobOutcome, JobStats, JobStore, ReapedJob,
};

pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    retry: RetryPolicy,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Move a running job's last heartbeat `age` into the past.
    ///
    /// Lets tests produce zombies without waiting. Returns false if the job
    /// does not exist.
    pub async fn age_heartbeat(&self, job_id: &str, age: Duration) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };
        let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let at = Utc::now() - age;
        job.last_heartbeat = Some(at);
        if job.started_at.map_or(false, |started| started > at) {
            job.started_at = Some(at);
        }
        true
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let job = prepare_insert(job, Utc::now())?;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.job_id) {
            bail!("job {} already exists", job.job_id);
        }
        jobs.insert(job.job_id.clone(), job.clone());
        debug!(job_id = %job.job_id, priority = job.priority, "job inserted");
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn claim_next(&self, worker_id: &str, lane: ClaimLane) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let best = jobs
            .values()
            .filter(|job| job.is_due(now) && lane.admits(job))
            .min_by_key(|job| (job.priority, !job.immediate, job.created_at))
            .map(|job| job.job_id.clone());

        let Some(job_id) = best else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.last_heartbeat = Some(now);
        job.updated_at = now;
        job.progress = 0.0;

        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        job_id: &str,
        worker_id: &str,
        progress: f64,
    ) -> Result<HeartbeatOutcome> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            warn!(job_id, worker_id, "heartbeat for unknown job");
            return Ok(HeartbeatOutcome::OwnershipLost);
        };

        if job.status == JobStatus::Running && job.worker_id.as_deref() == Some(worker_id) {
            let now = Utc::now();
            job.last_heartbeat = Some(now);
            job.updated_at = now;
            job.progress = job.progress.max(progress.clamp(0.0, 1.0));
            return Ok(HeartbeatOutcome::Alive);
        }

        if job.status == JobStatus::Cancelled {
            return Ok(HeartbeatOutcome::Cancelled);
        }

        warn!(job_id, worker_id, status = %job.status, "heartbeat from non-owner ignored");
        Ok(HeartbeatOutcome::OwnershipLost)
    }

    async fn finish(
        &self,
        job_id: &str,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<FinishOutcome> {
        let mut jobs = self.jobs.lock().await;
        let owned = jobs.get_mut(job_id).filter(|job| {
            job.status == JobStatus::Running && job.worker_id.as_deref() == Some(worker_id)
        });
        let Some(job) = owned else {
            warn!(job_id, worker_id, "finish from non-owner ignored");
            return Ok(FinishOutcome::OwnershipLost);
        };

        let now = Utc::now();
        Ok(match outcome {
            JobOutcome::Completed { result_count } => job.complete(result_count, now),
            JobOutcome::Failed { error } => job.fail(error, &self.retry, now),
        })
    }

    async fn reap_zombies(&self, max_silence: Duration) -> Result<Vec<ReapedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let mut reaped = Vec::new();

        for job in jobs.values_mut() {
            if job.status != JobStatus::Running {
                continue;
            }
            let last_seen = job
                .last_heartbeat
                .or(job.started_at)
                .unwrap_or(job.updated_at);
            let silent_for = (now - last_seen).to_std().unwrap_or_default();
            if silent_for <= job.silence_threshold(max_silence) {
                continue;
            }

            let worker_id = job.worker_id.clone();
            let outcome = job.fail(zombie_message(silent_for), &self.retry, now);
            info!(
                job_id = %job.job_id,
                worker_id = ?worker_id,
                silent_secs = silent_for.as_secs(),
                "reclaimed zombie job"
            );
            reaped.push(ReapedJob {
                job_id: job.job_id.clone(),
                worker_id,
                outcome,
            });
        }

        Ok(reaped)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Cancelled;
        job.worker_id = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn stats(&self) -> Result<JobStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            *stats
                .by_status
                .entry(job.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_collaborator
                .entry(job.collaborator.clone())
                .or_default() += 1;
        }
        Ok(stats)
    }
}
