//! HotStream worker.
//!
//! Connects to PostgreSQL, runs migrations and starts the scheduler loops
//! until Ctrl-C. Also exposes a couple of operator commands against the same
//! job store.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collectors::sources::MockSource;
use collectors::{JsonFileStorage, MemoryStorage, PostgresStorage, RawItem};
use scheduler_core::config::Config;
use scheduler_core::kernel::jobs::{
    AdapterRegistry, JobStatus, JobStore, PostgresJobStore, Scheduler,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "worker")]
#[command(about = "HotStream job worker")]
struct Cli {
    /// Override WORKER_ID
    #[arg(long)]
    worker_id: Option<String>,

    /// Override SCHEDULER_MAX_CONCURRENT_JOBS
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Register a canned "demo" source adapter
    #[arg(long)]
    demo_source: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loops (default)
    Run,

    /// Print job counts by status and collaborator
    Stats,

    /// List recent jobs
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Cancel a pending or running job
    Cancel { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(worker_id) = cli.worker_id {
        config.worker_id = worker_id;
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.max_concurrent_jobs = max_concurrent;
    }
    tracing::info!(worker_id = %config.worker_id, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(config.require_database_url()?)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let store = Arc::new(PostgresJobStore::with_retry_policy(
        pool.clone(),
        config.retry_policy(),
    ));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, pool, store, cli.demo_source).await,
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::List { status, limit } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            for job in store.list(status, limit).await? {
                println!(
                    "{}  {:<9}  p{:<2}  {:>3.0}%  {}  {}",
                    job.job_id,
                    job.status.as_str(),
                    job.priority,
                    job.progress * 100.0,
                    job.collaborator,
                    job.name
                );
            }
            Ok(())
        }
        Commands::Cancel { job_id } => {
            if store.cancel(&job_id).await? {
                println!("cancelled {job_id}");
            } else {
                println!("{job_id} is not pending or running");
            }
            Ok(())
        }
    }
}

async fn run(
    config: Config,
    pool: PgPool,
    store: Arc<PostgresJobStore>,
    demo_source: bool,
) -> Result<()> {
    let registry = build_registry(&config, pool, demo_source).await?;
    tracing::info!(
        sources = ?registry.registered_sources(),
        storages = ?registry.registered_storages(),
        default_storage = registry.default_storage(),
        "Adapters registered"
    );
    let registry = Arc::new(registry);

    match store.stats().await {
        Ok(stats) => tracing::info!(
            pending = stats.count(JobStatus::Pending),
            running = stats.count(JobStatus::Running),
            total = stats.total(),
            "Job store ready"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to read job stats"),
    }

    let scheduler = Scheduler::new(
        store,
        registry.clone(),
        config.scheduler_config(),
        config.executor_config(),
    );

    let shutdown = scheduler.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    scheduler.run().await?;
    registry.close_storages().await;
    Ok(())
}

async fn build_registry(config: &Config, pool: PgPool, demo_source: bool) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new(config.default_storage.clone());

    registry.register_storage("memory", Arc::new(MemoryStorage::new()));
    registry.register_storage(
        "json",
        Arc::new(JsonFileStorage::new(config.json_output_dir.clone())),
    );
    let postgres = PostgresStorage::from_pool(pool)
        .await
        .context("Failed to prepare collected_items table")?;
    registry.register_storage("postgres", Arc::new(postgres));

    if demo_source {
        let demo = MockSource::new("demo").with_items((0..25).map(|i| {
            RawItem::new("demo", format!("demo item {i} from the canned source"))
        }));
        registry.register_source("demo", move || Box::new(demo.clone()));
    }

    for (name, credentials) in &config.source_credentials {
        registry.set_credentials(name.clone(), credentials.clone());
    }

    Ok(registry)
}

fn parse_status(raw: &str) -> Result<JobStatus> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .with_context(|| format!("unknown job status: {raw}"))
}
