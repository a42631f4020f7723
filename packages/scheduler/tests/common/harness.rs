//! Test harness with testcontainers for PostgreSQL integration tests.
//!
//! One Postgres container is started for the whole test run. Each test gets
//! its own freshly migrated database inside it, so tests that claim jobs
//! never see each other's rows.

use anyhow::{Context, Result};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    host: String,
    port: u16,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?.to_string();
        let port = postgres.get_host_port_ipv4(5432).await?;

        Ok(Self {
            host,
            port,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }

    fn url(&self, database: &str) -> String {
        format!(
            "postgresql://postgres:postgres@{}:{}/{}",
            self.host, self.port, database
        )
    }
}

/// Per-test database with migrations applied.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let store = PostgresJobStore::new(ctx.db_pool.clone());
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub db_url: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let admin = PgPool::connect(&infra.url("postgres"))
            .await
            .context("Failed to connect to test server")?;
        let database = format!("test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE {database}"))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let db_url = infra.url(&database);
        let db_pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { db_pool, db_url })
    }
}
