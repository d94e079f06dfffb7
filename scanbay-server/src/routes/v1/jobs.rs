//! Job queue monitoring and cancellation of jobs that have not started.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use scanbay_core::{JobId, JobStatus};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::job::{JobListQuery, JobResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_jobs, get_job, cancel_job), components(schemas(JobResponse)))]
pub struct JobsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    tag = "jobs",
    params(JobListQuery),
    responses(
        (status = 200, description = "Jobs, newest first; in dequeue order when filtered by status", body = [JobResponse]),
        (status = 400, description = "Unknown status filter"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobListQuery>,
) -> Result<Json<Vec<JobResponse>>, ServerError> {
    let status = q
        .status
        .as_deref()
        .map(|s| {
            JobStatus::from_str(s)
                .map_err(|_| ServerError::BadRequest(format!("unknown job status '{s}'")))
        })
        .transpose()?;
    let jobs = state.runtime.queue.list(status).await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(
        ("id" = i64, Path, description = "Job id")
    ),
    responses(
        (status = 200, description = "Job retrieved", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>, ServerError> {
    let job = state
        .runtime
        .queue
        .get(JobId(id))
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job.into()))
}

#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(
        ("id" = i64, Path, description = "Job id")
    ),
    responses(
        (status = 204, description = "Pending job removed"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job already claimed by the worker"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ServerError> {
    let id = JobId(id);
    if state.runtime.queue.cancel_pending(id).await? {
        info!(job_id = %id, "pending job cancelled via API");
        return Ok(StatusCode::NO_CONTENT);
    }
    match state.runtime.queue.get(id).await? {
        Some(job) => Err(ServerError::Conflict(format!(
            "job {id} is {}; only pending jobs can be cancelled",
            job.status
        ))),
        None => Err(ServerError::NotFound(format!("job {id} not found"))),
    }
}
