//! `kiln` binary: API server, retry worker, and database tooling.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kiln_core::agent::MockAgentExecutor;
use kiln_core::billing::{BillingClient, HttpBillingClient, HttpBillingConfig, MemoryBillingClient};
use kiln_core::retry::{RetryWorker, RetryWorkerConfig};
use kiln_core::token::{self, TokenConfig};
use kiln_db::config::DbConfig;
use kiln_db::pool;

use kiln_server::routes::build_router;
use kiln_server::state::{AppState, StoragePaths};

#[derive(Parser)]
#[command(name = "kiln", about = "Multi-tenant AI code-generation pipeline engine")]
struct Cli {
    /// Database URL (overrides KILN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket API with the embedded retry worker
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Billing service base URL (in-memory ledger when omitted)
        #[arg(long)]
        billing_url: Option<String>,
        /// Directory for artifact content files
        #[arg(long, default_value = "./data/artifacts")]
        artifacts_dir: std::path::PathBuf,
        /// Directory for export bundles
        #[arg(long, default_value = "./data/exports")]
        exports_dir: std::path::PathBuf,
        /// Retry worker poll interval in seconds
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,
    },
    /// Run only the retry worker (for a separate worker process)
    Worker {
        /// Billing service base URL (in-memory ledger when omitted)
        #[arg(long)]
        billing_url: Option<String>,
        /// Directory for artifact content files
        #[arg(long, default_value = "./data/artifacts")]
        artifacts_dir: std::path::PathBuf,
        /// Retry worker poll interval in seconds
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,
    },
    /// Create the database (if needed) and apply migrations
    DbInit,
    /// Mint an access token, or generate a fresh signing secret
    Token {
        /// Tenant to scope the token to
        #[arg(long, required_unless_present = "init_secret")]
        tenant_id: Option<Uuid>,
        /// User the token identifies
        #[arg(long, required_unless_present = "init_secret")]
        user_id: Option<Uuid>,
        /// Role embedded in the token
        #[arg(long, default_value = "member")]
        role: String,
        /// Print a new hex secret for KILN_TOKEN_SECRET instead
        #[arg(long)]
        init_secret: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let db_config = match &cli.database_url {
        Some(url) => DbConfig::new(url.clone()),
        None => DbConfig::from_env(),
    };

    match cli.command {
        Commands::Serve {
            bind,
            port,
            billing_url,
            artifacts_dir,
            exports_dir,
            poll_interval,
        } => {
            let pg = pool::create_pool(&db_config).await?;
            let state = assemble_state(
                pg,
                billing_url,
                StoragePaths {
                    artifacts_dir,
                    exports_dir,
                },
            )?;

            // Embedded retry worker; a dedicated deployment runs
            // `kiln worker` instead.
            let worker_cancel = CancellationToken::new();
            let worker = RetryWorker::new(
                state.executor.clone(),
                RetryWorkerConfig {
                    poll_interval: std::time::Duration::from_secs(poll_interval),
                    ..Default::default()
                },
            );
            let worker_token = worker_cancel.clone();
            let worker_handle = tokio::spawn(async move { worker.run(worker_token).await });

            let app = build_router(state);
            let addr: SocketAddr = format!("{bind}:{port}")
                .parse()
                .with_context(|| format!("invalid bind address {bind}:{port}"))?;
            tracing::info!("kiln serving on http://{addr}");

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            worker_cancel.cancel();
            let _ = worker_handle.await;
            tracing::info!("kiln shut down");
        }

        Commands::Worker {
            billing_url,
            artifacts_dir,
            poll_interval,
        } => {
            let pg = pool::create_pool(&db_config).await?;
            let state = assemble_state(
                pg,
                billing_url,
                StoragePaths {
                    exports_dir: artifacts_dir.join("exports"),
                    artifacts_dir,
                },
            )?;

            let cancel = CancellationToken::new();
            let worker = RetryWorker::new(
                state.executor.clone(),
                RetryWorkerConfig {
                    poll_interval: std::time::Duration::from_secs(poll_interval),
                    ..Default::default()
                },
            );

            let token = cancel.clone();
            tokio::select! {
                _ = worker.run(token) => {}
                _ = shutdown_signal() => cancel.cancel(),
            }
        }

        Commands::DbInit => {
            pool::ensure_database_exists(&db_config).await?;
            let pg = pool::create_pool(&db_config).await?;
            pool::run_migrations(&pg).await?;
            println!("database initialized at {}", db_config.database_url);
        }

        Commands::Token {
            tenant_id,
            user_id,
            role,
            init_secret,
        } => {
            if init_secret {
                println!("{}", TokenConfig::generate_secret_hex());
                return Ok(());
            }

            let config = TokenConfig::from_env()
                .context("set KILN_TOKEN_SECRET (try `kiln token --init-secret`)")?;
            let token = token::generate_token(
                &config,
                tenant_id.expect("clap enforces tenant-id"),
                user_id.expect("clap enforces user-id"),
                &role,
            );
            println!("{token}");
        }
    }

    Ok(())
}

fn assemble_state(
    pg: sqlx::PgPool,
    billing_url: Option<String>,
    storage: StoragePaths,
) -> Result<AppState> {
    let billing: Arc<dyn BillingClient> = match billing_url {
        Some(url) => Arc::new(
            HttpBillingClient::new(HttpBillingConfig::new(url))
                .map_err(|e| anyhow::anyhow!("billing client: {e}"))?,
        ),
        None => {
            tracing::warn!("no billing URL configured, using in-memory ledger");
            Arc::new(MemoryBillingClient::new())
        }
    };

    let token_config =
        TokenConfig::from_env().context("set KILN_TOKEN_SECRET (try `kiln token --init-secret`)")?;

    Ok(AppState::assemble(
        pg,
        billing,
        Arc::new(MockAgentExecutor::new()),
        token_config,
        storage,
        CancellationToken::new(),
    ))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
