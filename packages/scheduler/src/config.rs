use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use collectors::Credentials;
use dotenvy::dotenv;
use uuid::Uuid;

use crate::kernel::jobs::{ExecutorConfig, PipelinePolicy, RetryPolicy, SchedulerConfig};

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub worker_id: String,
    pub max_concurrent_jobs: usize,
    pub normal_interval: Duration,
    pub priority_interval: Duration,
    pub maintenance_interval: Duration,
    pub zombie_timeout: Duration,
    pub drain_timeout: Duration,
    pub heartbeat_every: usize,
    pub min_content_length: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub default_storage: String,
    pub json_output_dir: String,
    /// Collaborator name → credential map
    pub source_credentials: HashMap<String, Credentials>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str, default: u64| -> Result<Duration> {
            parse_or(&lookup, key, default).map(Duration::from_secs)
        };

        let source_credentials = match lookup("SOURCE_CREDENTIALS") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("SOURCE_CREDENTIALS must be a JSON object of string maps")?,
            _ => HashMap::new(),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            worker_id: lookup("WORKER_ID")
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
            max_concurrent_jobs: parse_or(&lookup, "SCHEDULER_MAX_CONCURRENT_JOBS", 5)?,
            normal_interval: secs("SCHEDULER_NORMAL_INTERVAL_SECS", 10)?,
            priority_interval: secs("SCHEDULER_PRIORITY_INTERVAL_SECS", 3)?,
            maintenance_interval: secs("SCHEDULER_MAINTENANCE_INTERVAL_SECS", 30)?,
            zombie_timeout: secs("SCHEDULER_ZOMBIE_TIMEOUT_SECS", 3600)?,
            drain_timeout: secs("SCHEDULER_DRAIN_TIMEOUT_SECS", 30)?,
            heartbeat_every: parse_or(&lookup, "EXECUTOR_HEARTBEAT_EVERY", 10)?,
            min_content_length: parse_or(&lookup, "PIPELINE_MIN_CONTENT_LENGTH", 10)?,
            retry_base_delay: secs("RETRY_BASE_DELAY_SECS", 60)?,
            retry_max_delay: secs("RETRY_MAX_DELAY_SECS", 300)?,
            default_storage: lookup("DEFAULT_STORAGE").unwrap_or_else(|| "postgres".to_string()),
            json_output_dir: lookup("JSON_OUTPUT_DIR").unwrap_or_else(|| "output".to_string()),
            source_credentials,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            normal_interval: self.normal_interval,
            priority_interval: self.priority_interval,
            maintenance_interval: self.maintenance_interval,
            max_concurrent_jobs: self.max_concurrent_jobs,
            zombie_timeout: self.zombie_timeout,
            drain_timeout: self.drain_timeout,
            worker_id: self.worker_id.clone(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            heartbeat_every: self.heartbeat_every,
            pipeline: self.pipeline_policy(),
        }
    }

    pub fn pipeline_policy(&self) -> PipelinePolicy {
        PipelinePolicy {
            min_content_length: self.min_content_length,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        None => Ok(default),
    }
}
