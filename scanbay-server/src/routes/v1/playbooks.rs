//! Playbook catalog and playbook runs.
//!
//! Running a playbook queues a `playbook` job; the trigger scans and the
//! derived tasks happen on the worker.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use scanbay_core::JobPayload;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::job::JobAccepted;
use crate::schemas::v1::playbook::{PlaybookResponse, RunPlaybookRequest};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_playbooks, run_playbook),
    components(schemas(PlaybookResponse, RunPlaybookRequest, JobAccepted))
)]
pub struct PlaybooksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/playbooks", get(list_playbooks))
        .route("/playbooks/{id}/run", post(run_playbook))
}

#[utoipa::path(
    get,
    path = "/v1/playbooks",
    tag = "playbooks",
    responses(
        (status = 200, description = "Playbooks in catalog order", body = [PlaybookResponse]),
    )
)]
pub async fn list_playbooks(State(state): State<Arc<AppState>>) -> Json<Vec<PlaybookResponse>> {
    Json(state.runtime.playbooks.all().iter().map(Into::into).collect())
}

#[utoipa::path(
    post,
    path = "/v1/playbooks/{id}/run",
    tag = "playbooks",
    params(
        ("id" = String, Path, description = "Playbook id")
    ),
    request_body = RunPlaybookRequest,
    responses(
        (status = 202, description = "Playbook job queued", body = JobAccepted),
        (status = 400, description = "Invalid priority"),
        (status = 404, description = "Playbook not defined"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn run_playbook(
    State(state): State<Arc<AppState>>,
    Path(playbook_id): Path<String>,
    Json(req): Json<RunPlaybookRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ServerError> {
    if state.runtime.playbooks.get(&playbook_id).is_none() {
        return Err(ServerError::NotFound(format!(
            "playbook '{playbook_id}' is not defined"
        )));
    }

    let payload = JobPayload::Playbook {
        playbook_id: playbook_id.clone(),
        project_id: req.project_id,
    };
    let job_id = state
        .runtime
        .queue
        .enqueue(&payload, req.priority, Some(req.project_id))
        .await?;
    info!(job_id = %job_id, playbook_id = %playbook_id, project_id = req.project_id, "playbook queued via API");
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id: job_id.0 })))
}
