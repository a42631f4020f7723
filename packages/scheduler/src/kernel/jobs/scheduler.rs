//! Scheduler: three polling loops sharing one concurrency budget.
//!
//! ```text
//! Scheduler::run
//!     ├─► priority loop  (3s)   claim Urgent lane ──┐
//!     ├─► normal loop    (10s)  claim Normal lane ──┼─► slots (semaphore) ─► Executor
//!     └─► maintenance    (30s)  reap_zombies        │
//!                                                   └─ skip the tick when no slot is free
//! ```
//!
//! A slot is taken with `try_acquire` *before* `claim_next`, so a claimed job
//! always has somewhere to run. The permit moves into the spawned executor
//! task and is released when the task ends.
//!
//! Executor tokens are not children of the shutdown token. Shutdown stops the
//! loops first and lets in-flight jobs finish within the drain timeout; only
//! the ones still running after that are interrupted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{ExecutionError, Executor, ExecutorConfig};
use super::job::{ClaimLane, FinishOutcome, Job};
use super::registry::AdapterRegistry;
use super::store::JobStore;

/// How long interrupted executors get to record their outcome.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Normal lane poll period
    pub normal_interval: Duration,
    /// Urgent lane poll period
    pub priority_interval: Duration,
    /// Zombie reaper period
    pub maintenance_interval: Duration,
    /// Executors allowed in flight at once
    pub max_concurrent_jobs: usize,
    /// Heartbeat silence after which a running job is reclaimed
    pub zombie_timeout: Duration,
    /// How long shutdown waits for in-flight executors
    pub drain_timeout: Duration,
    pub worker_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            normal_interval: Duration::from_secs(10),
            priority_interval: Duration::from_secs(3),
            maintenance_interval: Duration::from_secs(30),
            max_concurrent_jobs: 5,
            zombie_timeout: Duration::from_secs(3600),
            drain_timeout: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl SchedulerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    /// Track running jobs for cancellation
    running_jobs: Arc<RwLock<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<AdapterRegistry>,
        config: SchedulerConfig,
        executor_config: ExecutorConfig,
    ) -> Self {
        let executor = Executor::new(
            store.clone(),
            registry,
            config.worker_id.clone(),
            executor_config,
        );
        Self {
            store,
            executor: Arc::new(executor),
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Token that stops the loops when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Executors currently running.
    pub async fn in_flight(&self) -> usize {
        self.running_jobs.read().await.len()
    }

    /// Free slots in the concurrency budget.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// One tick of the normal loop.
    pub async fn poll_normal(&self) -> Result<usize> {
        self.poll_lane(ClaimLane::Normal).await
    }

    /// One tick of the priority loop.
    pub async fn poll_priority(&self) -> Result<usize> {
        self.poll_lane(ClaimLane::Urgent).await
    }

    /// Claim and dispatch jobs from `lane` until it is empty or the budget is
    /// spent. Returns how many jobs were dispatched.
    pub async fn poll_lane(&self, lane: ClaimLane) -> Result<usize> {
        let mut dispatched = 0;
        while !self.shutdown.is_cancelled() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                debug!(lane = lane.as_str(), "no free slots, skipping");
                break;
            };
            match self.store.claim_next(&self.config.worker_id, lane).await? {
                Some(job) => {
                    self.dispatch(job, permit).await;
                    dispatched += 1;
                }
                None => break,
            }
        }
        if dispatched > 0 {
            debug!(lane = lane.as_str(), count = dispatched, "dispatched jobs");
        }
        Ok(dispatched)
    }

    /// One tick of the maintenance loop. Returns how many zombies were reaped.
    pub async fn run_maintenance(&self) -> Result<usize> {
        let reaped = self.store.reap_zombies(self.config.zombie_timeout).await?;
        for zombie in &reaped {
            warn!(
                job_id = %zombie.job_id,
                worker_id = zombie.worker_id.as_deref().unwrap_or("-"),
                outcome = ?zombie.outcome,
                "reclaimed zombie job"
            );
        }
        Ok(reaped.len())
    }

    /// Hand a claimed job to an executor task that owns `permit`.
    async fn dispatch(&self, job: Job, permit: OwnedSemaphorePermit) {
        let job_id = job.job_id.clone();
        let cancel = CancellationToken::new();
        self.running_jobs
            .write()
            .await
            .insert(job_id.clone(), cancel.clone());

        info!(
            job_id = %job_id,
            worker_id = %self.config.worker_id,
            priority = job.priority,
            immediate = job.immediate,
            "job claimed"
        );

        let executor = self.executor.clone();
        let running = self.running_jobs.clone();
        tokio::spawn(async move {
            match executor.run(job, cancel).await {
                Ok(FinishOutcome::Completed | FinishOutcome::Rescheduled { .. }) => {
                    debug!(job_id = %job_id, "executor finished")
                }
                Ok(outcome) => debug!(job_id = %job_id, ?outcome, "executor finished with failure"),
                Err(e @ (ExecutionError::Cancelled | ExecutionError::OwnershipLost)) => {
                    info!(job_id = %job_id, reason = %e, "executor stopped")
                }
                Err(e) => error!(job_id = %job_id, error = %e, "failed to record job outcome"),
            }
            drop(permit);
            running.write().await.remove(&job_id);
        });
    }

    /// Run the three loops until [`Scheduler::shutdown`], then drain.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "scheduler starting"
        );

        // Urgent work takes the first slots
        if let Err(e) = self.poll_lane(ClaimLane::Urgent).await {
            error!(lane = "urgent", error = %e, "failed to claim jobs");
        }

        tokio::join!(
            self.lane_loop(ClaimLane::Urgent, self.config.priority_interval),
            self.lane_loop(ClaimLane::Normal, self.config.normal_interval),
            self.maintenance_loop(),
        );

        self.drain().await;
        info!(worker_id = %self.config.worker_id, "scheduler stopped");
        Ok(())
    }

    async fn lane_loop(&self, lane: ClaimLane, period: Duration) {
        debug!(lane = lane.as_str(), period_ms = period.as_millis() as u64, "loop started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_lane(lane).await {
                        error!(lane = lane.as_str(), error = %e, "failed to claim jobs");
                    }
                }
            }
        }
        debug!(lane = lane.as_str(), "loop stopped");
    }

    async fn maintenance_loop(&self) {
        let mut ticker = interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        error!(error = %e, "failed to reap zombie jobs");
                    }
                }
            }
        }
    }

    /// Wait for in-flight executors up to the drain timeout, then interrupt
    /// whatever is left.
    async fn drain(&self) {
        let running_count = self.in_flight().await;
        if running_count == 0 {
            return;
        }
        info!(count = running_count, "waiting for running jobs to complete");

        if self.wait_idle(self.config.drain_timeout).await {
            return;
        }

        let remaining = {
            let running = self.running_jobs.read().await;
            for token in running.values() {
                token.cancel();
            }
            running.len()
        };
        warn!(
            count = remaining,
            "drain timeout elapsed, interrupting running jobs"
        );

        if !self.wait_idle(INTERRUPT_GRACE).await {
            let stuck = self.in_flight().await;
            warn!(count = stuck, "jobs still running after interrupt");
        }
    }

    /// Wait until no executor is running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while !self.running_jobs.read().await.is_empty() {
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }
}
