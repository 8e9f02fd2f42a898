//! Shared application state handed to every handler.

use std::sync::Arc;

use sqlx::PgPool;

use kiln_core::audit::AuditSink;
use kiln_core::billing::BillingClient;
use kiln_core::dispatcher::Dispatcher;
use kiln_core::events::EventHub;
use kiln_core::executor::PipelineExecutor;
use kiln_core::jobs::{ExportSink, GitPusher};
use kiln_core::token::TokenConfig;

/// Everything the API layer needs. Cheap to clone; all fields shared.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<dyn BillingClient>,
    pub audit: Arc<dyn AuditSink>,
    pub hub: Arc<EventHub>,
    pub dispatcher: Dispatcher,
    pub executor: PipelineExecutor,
    pub token_config: Arc<TokenConfig>,
    pub export_sink: Arc<dyn ExportSink>,
    pub git_pusher: Arc<dyn GitPusher>,
}

/// Filesystem locations for the built-in sinks.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub artifacts_dir: std::path::PathBuf,
    pub exports_dir: std::path::PathBuf,
}

impl AppState {
    /// Wire up the full engine around a pool and a billing client.
    ///
    /// Spawns the background dispatcher; the returned state is ready for
    /// the router, the retry worker, or both.
    pub fn assemble(
        pool: PgPool,
        billing: Arc<dyn BillingClient>,
        agents: Arc<dyn kiln_core::agent::AgentExecutor>,
        token_config: TokenConfig,
        storage: StoragePaths,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        let audit: Arc<dyn AuditSink> = Arc::new(kiln_core::audit::PgAuditSink::new(pool.clone()));
        let hub = Arc::new(EventHub::new());
        let artifacts = kiln_core::artifacts::ArtifactService::new(
            pool.clone(),
            Arc::new(kiln_core::artifacts::LocalContentStore::new(
                storage.artifacts_dir,
            )),
        );

        let executor = PipelineExecutor {
            pool: pool.clone(),
            agents,
            billing: billing.clone(),
            artifacts,
            audit: audit.clone(),
            hub: hub.clone(),
        };

        let dispatcher = Dispatcher::spawn(executor.clone(), 4, 256, cancel);

        Self {
            pool,
            billing,
            audit,
            hub,
            dispatcher,
            executor,
            token_config: Arc::new(token_config),
            export_sink: Arc::new(kiln_core::jobs::FsExportSink::new(storage.exports_dir)),
            git_pusher: Arc::new(kiln_core::jobs::HashingGitPusher),
        }
    }
}
