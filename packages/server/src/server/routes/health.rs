use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::kernel::jobs::JobQueue;
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: ComponentHealth,
    queue: QueueHealth,
    #[serde(rename = "fileExplorer")]
    file_explorer: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Checks:
/// - Audit store connectivity
/// - Queue (Redis) connectivity and depth
/// - File explorer liveness (reported only; sampling falls back to the
///   local checkout when the explorer is down)
///
/// Returns 200 OK if the store and queue are healthy, 503 Service
/// Unavailable otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.store.ping(),
    )
    .await
    {
        Ok(Ok(())) => ComponentHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => ComponentHealth {
            status: "error".to_string(),
            error: Some(e.to_string()),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            error: Some("ping timeout (>5s)".to_string()),
        },
    };

    let queue = match state.queue.depth().await {
        Ok(depth) => QueueHealth {
            status: "ok".to_string(),
            depth: Some(depth),
            error: None,
        },
        Err(e) => QueueHealth {
            status: "error".to_string(),
            depth: None,
            error: Some(e.to_string()),
        },
    };

    let file_explorer = match state.file_explorer.health().await {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            error: None,
        },
        Err(e) => ComponentHealth {
            status: "error".to_string(),
            error: Some(e.to_string()),
        },
    };

    let is_healthy = database.status == "ok" && queue.status == "ok";
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            database,
            queue,
            file_explorer,
        }),
    )
}
