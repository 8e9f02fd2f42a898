//! Route table.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub mod artifacts;
pub mod jobs;
pub mod pipeline;
pub mod projects;
pub mod tasks;
pub mod ws;

/// Build the full API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/projects", post(projects::create).get(projects::list))
        .route(
            "/projects/{id}",
            get(projects::get_by_id).patch(projects::update),
        )
        .route(
            "/projects/{id}/tasks",
            post(projects::create_task).get(projects::list_tasks),
        )
        .route("/tasks/{id}", get(tasks::get_by_id))
        .route("/tasks/{id}/queue", post(tasks::queue))
        .route("/pipeline/tasks/{id}/validate", post(pipeline::validate))
        .route("/pipeline/tasks/{id}/run", post(pipeline::run))
        // Listing must precede the `{run_id}` matcher in spirit; axum
        // routes literals before captures, so both coexist.
        .route("/pipeline/pipelines", get(pipeline::list))
        .route("/pipeline/{run_id}", get(pipeline::status))
        .route("/pipeline/{run_id}/cancel", post(pipeline::cancel))
        .route("/pipeline/{run_id}/resume", post(pipeline::resume))
        .route("/pipeline/{run_id}/replay", post(pipeline::replay))
        .route(
            "/pipeline/{run_id}/steps/{step_id}",
            get(pipeline::step_details),
        )
        .route("/billing/compensate", post(pipeline::compensate))
        .route("/dead-letters", get(pipeline::list_dead_letters))
        .route(
            "/dead-letters/{id}/resolve",
            post(pipeline::resolve_dead_letter),
        )
        .route("/artifacts/{id}", get(artifacts::get_by_id))
        .route("/artifacts/{id}/approve", post(artifacts::approve))
        .route("/artifacts/{id}/reject", post(artifacts::reject))
        .route("/artifacts/{id}/archive", post(artifacts::archive))
        .route("/exports", post(jobs::create_export))
        .route("/exports/{id}", get(jobs::export_status))
        .route("/git-sync", post(jobs::create_git_sync))
        .route("/git-sync/{id}", get(jobs::git_sync_status))
        .route("/ws", get(ws::handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
