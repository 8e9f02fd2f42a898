//! Shared PostgreSQL harness for kiln integration tests.
//!
//! One PostgreSQL server is shared per test binary; every test gets its own
//! database inside it, with migrations applied. Two modes:
//!
//! - **`KILN_TEST_PG_URL` set**: use that server directly (e.g. a CI
//!   service container). No per-process container startup cost.
//! - **Unset**: start a disposable container through `testcontainers`,
//!   held alive for the lifetime of the binary.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use kiln_db::pool;

struct SharedPg {
    /// Server-root URL, no database name appended.
    base_url: String,
    /// Held to keep the container alive; `None` with an external server.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("KILN_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("17")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedPg {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

async fn base_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

async fn maintenance_pool() -> PgPool {
    let url = format!("{}/postgres", base_url().await);
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .expect("failed to connect to maintenance database")
}

/// A uniquely-named migrated database inside the shared server.
///
/// Call [`TestDb::drop`] at the end of the test; leaked databases only
/// live as long as the disposable container, but external servers
/// (`KILN_TEST_PG_URL`) accumulate them otherwise.
pub struct TestDb {
    pub pool: PgPool,
    pub name: String,
}

impl TestDb {
    /// Create a fresh database and apply all migrations.
    pub async fn create() -> Self {
        let base = base_url().await;
        let name = format!("kiln_test_{}", Uuid::new_v4().simple());

        let maint = maintenance_pool().await;
        let stmt = format!("CREATE DATABASE {name}");
        maint
            .execute(stmt.as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create temp database {name}: {e}"));
        maint.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{base}/{name}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to temp database {name}: {e}"));

        pool::run_migrations(&pool)
            .await
            .expect("migrations should succeed");

        Self { pool, name }
    }

    /// Close the pool and drop the database. Safe to call when the
    /// database is already gone.
    pub async fn drop(self) {
        self.pool.close().await;

        let maint = maintenance_pool().await;
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = maint.execute(terminate.as_str()).await;

        let stmt = format!("DROP DATABASE IF EXISTS {}", self.name);
        let _ = maint.execute(stmt.as_str()).await;
        maint.close().await;
    }
}
