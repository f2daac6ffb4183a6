//! Read API over the audit store, plus the manual trigger.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::kernel::audit::{JobRecord, JobRunRecord, TagAssignmentRecord};
use crate::kernel::jobs::{JobQueue, JobTrigger, TagJobPayload};
use crate::server::app::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn internal_error(err: anyhow::Error) -> Response {
    error!(error = %err, "read API query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal error".to_string(),
        }),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} not found"),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobListResponse {
    jobs: Vec<JobRecord>,
    total: i64,
}

pub async fn list_jobs_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let jobs = match state.store.list_recent_jobs(limit).await {
        Ok(jobs) => jobs,
        Err(err) => return internal_error(err),
    };
    let total = match state.store.count_jobs().await {
        Ok(total) => total,
        Err(err) => return internal_error(err),
    };

    Json(JobListResponse { jobs, total }).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    repository_id: String,
    reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobResponse {
    job_id: String,
    created: bool,
}

/// Manually trigger tagging for a repository. Bypasses the recency gate;
/// queue deduplication still applies.
pub async fn create_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Response {
    if request.repository_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "repositoryId is required".to_string(),
            }),
        )
            .into_response();
    }

    let mut payload = TagJobPayload::new(request.repository_id, JobTrigger::Manual);
    if let Some(reason) = request.reason {
        payload = payload.with_reason(reason);
    }

    match state.queue.enqueue(payload).await {
        Ok(result) => (
            StatusCode::ACCEPTED,
            Json(CreateJobResponse {
                job_id: result.job_id().to_string(),
                created: result.is_created(),
            }),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobDetailResponse {
    #[serde(flatten)]
    job: JobRecord,
    job_runs: Vec<JobRunRecord>,
}

pub async fn get_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<i64>,
) -> Response {
    let job = match state.store.get_job_by_id(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found("job"),
        Err(err) => return internal_error(err),
    };
    let job_runs = match state.store.list_runs_for_job(job_id).await {
        Ok(runs) => runs,
        Err(err) => return internal_error(err),
    };

    Json(JobDetailResponse { job, job_runs }).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunDetailResponse {
    #[serde(flatten)]
    run: JobRunRecord,
    tag_assignments: Vec<TagAssignmentRecord>,
}

pub async fn get_run_handler(
    Extension(state): Extension<AppState>,
    Path(run_id): Path<i64>,
) -> Response {
    let run = match state.store.get_run_by_id(run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => return not_found("run"),
        Err(err) => return internal_error(err),
    };
    let tag_assignments = match state.store.get_assignments_for_run(run_id).await {
        Ok(assignments) => assignments,
        Err(err) => return internal_error(err),
    };

    Json(RunDetailResponse {
        run,
        tag_assignments,
    })
    .into_response()
}
