//! Job engine: store gateway, scheduler, executor and data pipeline.
//!
//! - [`JobStore`] - the only path to job records ([`PostgresJobStore`],
//!   [`MemoryJobStore`])
//! - [`Scheduler`] - normal, priority and maintenance loops under one
//!   concurrency budget
//! - [`Executor`] - runs one claimed job through its source adapter
//! - [`DataPipeline`] - validate, clean, dedup and persist collected items
//! - [`AdapterRegistry`] - source/storage lookup by name
//!
//! # Architecture
//!
//! ```text
//! Scheduler loops
//!     │
//!     ├─► JobStore.claim_next(worker, lane)
//!     ├─► Executor.run(job)
//!     │       ├─► SourceAdapter.search / monitor
//!     │       ├─► DataPipeline.process → StorageAdapter.save
//!     │       └─► JobStore.heartbeat (progress, cancellation)
//!     └─► JobStore.finish(completed | failed)
//! ```

mod executor;
mod job;
mod memory_store;
mod pipeline;
mod postgres_store;
mod registry;
mod schedule;
mod scheduler;
mod store;

pub use executor::{ExecutionError, Executor, ExecutorConfig};
pub use job::{
    ClaimLane, FinishOutcome, Job, JobKind, JobStatus, RetryPolicy, HIGHEST_PRIORITY,
    LOWEST_PRIORITY, URGENT_PRIORITY_THRESHOLD,
};
pub use memory_store::MemoryJobStore;
pub use pipeline::{
    DataPipeline, PipelineError, PipelinePolicy, PipelineStats, ProcessedBatch, ValidationError,
};
pub use postgres_store::PostgresJobStore;
pub use registry::AdapterRegistry;
pub use schedule::{next_run_after, parse_schedule};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{zombie_message, HeartbeatOutcome, JobOutcome, JobStats, JobStore, ReapedJob};
