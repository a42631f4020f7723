//! Job model for scheduled data collection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use collectors::SearchOptions;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::FromRow;
use tracing::warn;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::schedule::next_run_after;

/// Priorities at or below this value are served by the priority loop.
pub const URGENT_PRIORITY_THRESHOLD: i16 = 3;
pub const HIGHEST_PRIORITY: i16 = 1;
pub const LOWEST_PRIORITY: i16 = 10;

// ============================================================================
// Enums
// ============================================================================

/// Persisted as SMALLINT 0..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum JobStatus {
    #[default]
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No further transition will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Keyword search across the platform
    #[default]
    Search,
    /// Recent activity of a list of accounts
    Monitor,
}

/// Which polling loop is claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimLane {
    /// priority > 3
    Normal,
    /// priority <= 3, or the immediate flag is set
    Urgent,
}

impl ClaimLane {
    pub fn admits(&self, job: &Job) -> bool {
        match self {
            ClaimLane::Normal => job.priority > URGENT_PRIORITY_THRESHOLD,
            ClaimLane::Urgent => job.is_urgent(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimLane::Normal => "normal",
            ClaimLane::Urgent => "urgent",
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4().to_string())]
    pub job_id: String,

    // Descriptor
    pub name: String,
    /// Registry name of the source adapter
    pub collaborator: String,
    #[builder(default)]
    pub kind: JobKind,
    #[builder(default)]
    pub keywords: Vec<String>,
    #[builder(default)]
    pub accounts: Vec<String>,
    #[builder(default = 100)]
    pub result_limit: i32,
    /// Passed through to the adapter as `SearchOptions`
    #[builder(default = json!({}))]
    pub options: Value,
    /// `{"type": "<storage name>", ...}`
    #[builder(default = json!({}))]
    pub storage_config: Value,

    // Scheduling
    #[builder(default, setter(strip_option))]
    pub schedule: Option<String>,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub retry_at: Option<DateTime<Utc>>,
    #[builder(default = 5)]
    pub priority: i16,
    #[builder(default = false)]
    pub immediate: bool,

    // Lifecycle
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default = 0)]
    pub current_retry: i32,
    #[builder(default = 3)]
    pub max_retry: i32,
    #[builder(default = 1800)]
    pub timeout_seconds: i32,

    // Telemetry
    #[builder(default = 0.0)]
    pub progress: f64,
    #[builder(default = 0)]
    pub result_count: i32,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Transition recorded by a finish or reap.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    /// Terminal success
    Completed,
    /// Recurring job finished a run and is pending its next occurrence
    Rescheduled { next_run_at: DateTime<Utc> },
    /// Failed with retries left; pending again once `retry_at` passes
    Retrying {
        attempt: i32,
        retry_at: DateTime<Utc>,
    },
    /// Terminal failure, retries exhausted
    Failed,
    /// The caller no longer owns the job; nothing changed
    OwnershipLost,
}

/// Delay between a failure and the next claim of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Retry as soon as a loop polls again.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `min(base * 2^retries_so_far, max)`
    pub fn delay_for(&self, retries_so_far: i32) -> Duration {
        let factor = 2u32.checked_pow(retries_so_far.max(0) as u32).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Job {
    /// Claimable right now: pending, schedule due (or immediate), backoff over.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && (self.immediate || self.next_run_at.map_or(true, |at| at <= now))
            && self.retry_at.map_or(true, |at| at <= now)
    }

    pub fn is_urgent(&self) -> bool {
        self.priority <= URGENT_PRIORITY_THRESHOLD || self.immediate
    }

    pub fn has_retries_left(&self) -> bool {
        self.current_retry < self.max_retry
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }

    /// Heartbeat silence after which the reaper takes the job back.
    pub fn silence_threshold(&self, max_silence: Duration) -> Duration {
        max_silence.min(self.timeout())
    }

    /// Storage adapter named by `storage_config.type`, if any.
    pub fn storage_type(&self) -> Option<&str> {
        self.storage_config.get("type").and_then(Value::as_str)
    }

    /// Adapter options from the job, with the job's result limit applied.
    pub fn search_options(&self) -> SearchOptions {
        let options = match serde_json::from_value::<SearchOptions>(self.options.clone()) {
            Ok(options) => options,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "ignoring malformed job options");
                SearchOptions::default()
            }
        };
        options.with_limit(self.result_limit.max(0) as usize)
    }

    /// First occurrence for a freshly inserted job.
    pub fn initial_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.next_run_at.is_some() || self.immediate {
            return self.next_run_at;
        }
        let schedule = self.schedule.as_deref()?;
        match next_run_after(schedule, now) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(job_id = %self.job_id, schedule, error = %e, "invalid schedule, running once");
                None
            }
        }
    }

    /// Record a successful run.
    pub fn complete(&mut self, result_count: i32, now: DateTime<Utc>) -> FinishOutcome {
        self.worker_id = None;
        self.result_count = result_count;
        self.progress = 1.0;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.error_message = None;
        self.retry_at = None;

        let next = self.schedule.as_deref().and_then(|s| match next_run_after(s, now) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(job_id = %self.job_id, schedule = s, error = %e, "invalid schedule, not re-arming");
                None
            }
        });

        match next {
            Some(next_run_at) => {
                self.status = JobStatus::Pending;
                self.current_retry = 0;
                // Later occurrences follow the schedule
                self.immediate = false;
                self.next_run_at = Some(next_run_at);
                FinishOutcome::Rescheduled { next_run_at }
            }
            None => {
                self.status = JobStatus::Completed;
                FinishOutcome::Completed
            }
        }
    }

    /// Record a failed run, re-queueing if retries remain.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FinishOutcome {
        self.worker_id = None;
        self.error_message = Some(error.into());
        self.updated_at = now;

        if self.has_retries_left() {
            let delay = policy.delay_for(self.current_retry);
            let retry_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.current_retry += 1;
            self.status = JobStatus::Pending;
            self.progress = 0.0;
            self.retry_at = Some(retry_at);
            self.completed_at = None;
            FinishOutcome::Retrying {
                attempt: self.current_retry,
                retry_at,
            }
        } else {
            self.status = JobStatus::Failed;
            self.retry_at = None;
            self.completed_at = Some(now);
            FinishOutcome::Failed
        }
    }
}
