//! Application setup and router configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

use crate::kernel::audit::AuditStore;
use crate::kernel::file_explorer_client::BaseFileExplorer;
use crate::kernel::jobs::JobQueue;
use crate::server::routes::{
    create_job_handler, get_job_handler, get_run_handler, health_handler, list_jobs_handler,
};

/// Shared state for the read API: thin views over the audit store and
/// the queue.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AuditStore>,
    pub queue: Arc<dyn JobQueue>,
    pub file_explorer: Arc<dyn BaseFileExplorer>,
}

pub fn build_app(
    store: Arc<AuditStore>,
    queue: Arc<dyn JobQueue>,
    file_explorer: Arc<dyn BaseFileExplorer>,
) -> Router {
    let state = AppState {
        store,
        queue,
        file_explorer,
    };

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(create_job_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/runs/:id", get(get_run_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}
