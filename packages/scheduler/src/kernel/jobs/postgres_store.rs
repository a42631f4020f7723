//! PostgreSQL-backed job store.
//!
//! Status codes in SQL: 0 pending, 1 running, 2 completed, 3 failed,
//! 4 cancelled. Ownership is enforced in the `WHERE` clause of each update
//! (`worker_id = $2 AND status = 1`), and claiming selects its row with
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers never block each other.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info, warn};

use super::job::{
    ClaimLane, FinishOutcome, Job, JobStatus, RetryPolicy, URGENT_PRIORITY_THRESHOLD,
};
use super::schedule::next_run_after;
use super::store::{
    prepare_insert, HeartbeatOutcome, JobOutcome, JobStats, JobStore, ReapedJob,
};

const JOB_COLUMNS: &str = "job_id, name, collaborator, kind, keywords, accounts, result_limit, \
    options, storage_config, schedule, next_run_at, retry_at, priority, immediate, status, \
    worker_id, current_retry, max_retry, timeout_seconds, progress, result_count, error_message, \
    created_at, updated_at, started_at, completed_at, last_heartbeat";

/// Failure transition shared by `finish` and `reap_zombies`.
///
/// `base` and `max` are the placeholders carrying the retry delay bounds in
/// milliseconds.
fn failure_set(base: &str, max: &str) -> String {
    format!(
        r#"
        status = CASE WHEN current_retry < max_retry THEN 0 ELSE 3 END,
        retry_at = CASE WHEN current_retry < max_retry
            THEN NOW() + LEAST({base}::float8 * POWER(2, current_retry), {max}::float8) * INTERVAL '1 millisecond'
            ELSE NULL END,
        progress = CASE WHEN current_retry < max_retry THEN 0 ELSE progress END,
        completed_at = CASE WHEN current_retry < max_retry THEN NULL ELSE NOW() END,
        current_retry = CASE WHEN current_retry < max_retry THEN current_retry + 1 ELSE current_retry END,
        worker_id = NULL,
        updated_at = NOW()
        "#
    )
}

#[derive(FromRow)]
struct TransitionRow {
    status: JobStatus,
    current_retry: i32,
    retry_at: Option<DateTime<Utc>>,
}

impl TransitionRow {
    fn outcome(&self) -> FinishOutcome {
        match (self.status, self.retry_at) {
            (JobStatus::Pending, Some(retry_at)) => FinishOutcome::Retrying {
                attempt: self.current_retry,
                retry_at,
            },
            _ => FinishOutcome::Failed,
        }
    }
}

#[derive(FromRow)]
struct ReapRow {
    job_id: String,
    previous_worker: Option<String>,
    silent_secs: i64,
    #[sqlx(flatten)]
    transition: TransitionRow,
}

/// PostgreSQL job store.
pub struct PostgresJobStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn delay_bounds_ms(&self) -> (f64, f64) {
        (
            self.retry.base_delay.as_millis() as f64,
            self.retry.max_delay.as_millis() as f64,
        )
    }

    async fn fail(&self, job_id: &str, worker_id: &str, error: &str) -> Result<FinishOutcome> {
        let (base_ms, max_ms) = self.delay_bounds_ms();
        let row = sqlx::query_as::<_, TransitionRow>(&format!(
            r#"
            UPDATE jobs SET {}, error_message = $3
            WHERE job_id = $1 AND worker_id = $2 AND status = 1
            RETURNING status, current_retry, retry_at
            "#,
            failure_set("$4", "$5")
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .bind(base_ms)
        .bind(max_ms)
        .fetch_optional(&self.pool)
        .await
        .context("failed to record job failure")?;

        Ok(match row {
            Some(row) => row.outcome(),
            None => {
                warn!(job_id, worker_id, "finish from non-owner ignored");
                FinishOutcome::OwnershipLost
            }
        })
    }

    async fn complete(&self, job_id: &str, worker_id: &str, result_count: i32) -> Result<FinishOutcome> {
        let schedule: Option<Option<String>> =
            sqlx::query_scalar("SELECT schedule FROM jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to load job schedule")?;

        let next_run_at = schedule.flatten().and_then(|s| match next_run_after(&s, Utc::now()) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(job_id, schedule = %s, error = %e, "invalid schedule, not re-arming");
                None
            }
        });

        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                status = CASE WHEN $4::timestamptz IS NULL THEN 2 ELSE 0 END,
                next_run_at = COALESCE($4, next_run_at),
                current_retry = CASE WHEN $4::timestamptz IS NULL THEN current_retry ELSE 0 END,
                immediate = CASE WHEN $4::timestamptz IS NULL THEN immediate ELSE FALSE END,
                result_count = $3,
                progress = 1.0,
                completed_at = NOW(),
                updated_at = NOW(),
                retry_at = NULL,
                error_message = NULL,
                worker_id = NULL
            WHERE job_id = $1 AND worker_id = $2 AND status = 1
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(result_count)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .context("failed to record job completion")?;

        if updated.rows_affected() == 0 {
            warn!(job_id, worker_id, "finish from non-owner ignored");
            return Ok(FinishOutcome::OwnershipLost);
        }

        Ok(match next_run_at {
            Some(next_run_at) => FinishOutcome::Rescheduled { next_run_at },
            None => FinishOutcome::Completed,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let job = prepare_insert(job, Utc::now())?;
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                job_id, name, collaborator, kind, keywords, accounts, result_limit,
                options, storage_config, schedule, next_run_at, priority, immediate,
                max_retry, timeout_seconds, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job.job_id)
        .bind(&job.name)
        .bind(&job.collaborator)
        .bind(job.kind)
        .bind(&job.keywords)
        .bind(&job.accounts)
        .bind(job.result_limit)
        .bind(&job.options)
        .bind(&job.storage_config)
        .bind(&job.schedule)
        .bind(job.next_run_at)
        .bind(job.priority)
        .bind(job.immediate)
        .bind(job.max_retry)
        .bind(job.timeout_seconds)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to insert job")?;

        match inserted {
            Some(job) => {
                debug!(job_id = %job.job_id, priority = job.priority, "job inserted");
                Ok(job)
            }
            None => bail!("job {} already exists", job.job_id),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load job")
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::smallint IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(status)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .context("failed to list jobs")
    }

    async fn claim_next(&self, worker_id: &str, lane: ClaimLane) -> Result<Option<Job>> {
        let claimed = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs SET
                status = 1,
                worker_id = $1,
                started_at = NOW(),
                last_heartbeat = NOW(),
                updated_at = NOW(),
                progress = 0
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE status = 0
                  AND (retry_at IS NULL OR retry_at <= NOW())
                  AND (immediate OR next_run_at IS NULL OR next_run_at <= NOW())
                  AND CASE WHEN $2 THEN (priority <= $3 OR immediate) ELSE priority > $3 END
                ORDER BY priority ASC, immediate DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 0
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(lane == ClaimLane::Urgent)
        .bind(URGENT_PRIORITY_THRESHOLD)
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim job")?;

        if let Some(job) = &claimed {
            debug!(job_id = %job.job_id, worker_id, lane = lane.as_str(), "job claimed");
        }
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        job_id: &str,
        worker_id: &str,
        progress: f64,
    ) -> Result<HeartbeatOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                last_heartbeat = NOW(),
                updated_at = NOW(),
                progress = GREATEST(progress, $3)
            WHERE job_id = $1 AND worker_id = $2 AND status = 1
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(progress.clamp(0.0, 1.0))
        .execute(&self.pool)
        .await
        .context("failed to record heartbeat")?;

        if updated.rows_affected() == 1 {
            return Ok(HeartbeatOutcome::Alive);
        }

        let status: Option<JobStatus> = sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load job status")?;

        if status == Some(JobStatus::Cancelled) {
            return Ok(HeartbeatOutcome::Cancelled);
        }
        warn!(job_id, worker_id, status = ?status, "heartbeat from non-owner ignored");
        Ok(HeartbeatOutcome::OwnershipLost)
    }

    async fn finish(
        &self,
        job_id: &str,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<FinishOutcome> {
        match outcome {
            JobOutcome::Completed { result_count } => {
                self.complete(job_id, worker_id, result_count).await
            }
            JobOutcome::Failed { error } => self.fail(job_id, worker_id, &error).await,
        }
    }

    async fn reap_zombies(&self, max_silence: Duration) -> Result<Vec<ReapedJob>> {
        let (base_ms, max_ms) = self.delay_bounds_ms();
        let rows = sqlx::query_as::<_, ReapRow>(&format!(
            r#"
            WITH stale AS (
                SELECT job_id, worker_id AS previous_worker,
                       EXTRACT(EPOCH FROM NOW() - COALESCE(last_heartbeat, started_at, updated_at))::bigint
                           AS silent_secs
                FROM jobs
                WHERE status = 1
                  AND COALESCE(last_heartbeat, started_at, updated_at)
                      < NOW() - LEAST($1::bigint, timeout_seconds::bigint) * INTERVAL '1 second'
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs SET {},
                error_message = 'zombie job reclaimed: no heartbeat for ' || stale.silent_secs || 's'
            FROM stale
            WHERE jobs.job_id = stale.job_id AND jobs.status = 1
            RETURNING jobs.job_id, stale.previous_worker, stale.silent_secs,
                      jobs.status, jobs.current_retry, jobs.retry_at
            "#,
            failure_set("$2", "$3")
        ))
        .bind(max_silence.as_secs() as i64)
        .bind(base_ms)
        .bind(max_ms)
        .fetch_all(&self.pool)
        .await
        .context("failed to reap zombie jobs")?;

        let reaped = rows
            .into_iter()
            .map(|row| {
                info!(
                    job_id = %row.job_id,
                    worker_id = ?row.previous_worker,
                    silent_secs = row.silent_secs,
                    "reclaimed zombie job"
                );
                ReapedJob {
                    outcome: row.transition.outcome(),
                    job_id: row.job_id,
                    worker_id: row.previous_worker,
                }
            })
            .collect();
        Ok(reaped)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 4,
                worker_id = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND status IN (0, 1)
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to cancel job")?;

        Ok(updated.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<JobStats> {
        let by_status: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("failed to count jobs by status")?;

        let by_collaborator: Vec<(String, i64)> =
            sqlx::query_as("SELECT collaborator, COUNT(*) FROM jobs GROUP BY collaborator")
                .fetch_all(&self.pool)
                .await
                .context("failed to count jobs by collaborator")?;

        Ok(JobStats {
            by_status: by_status
                .into_iter()
                .map(|(status, n)| (status.as_str().to_string(), n))
                .collect(),
            by_collaborator: by_collaborator.into_iter().collect(),
        })
    }
}
