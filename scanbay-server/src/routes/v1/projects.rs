//! Queue one tool against every target of a project.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::task::{ProjectScanRequest, ProjectScanResponse, SkippedTargetResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(scan_project),
    components(schemas(ProjectScanRequest, ProjectScanResponse, SkippedTargetResponse))
)]
pub struct ProjectsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/projects/{id}/scan", post(scan_project))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{id}/scan",
    tag = "projects",
    params(
        ("id" = i64, Path, description = "Project id")
    ),
    request_body = ProjectScanRequest,
    responses(
        (status = 202, description = "One task queued per valid target", body = ProjectScanResponse),
        (status = 400, description = "Invalid tool, options or priority"),
        (status = 500, description = "Store error"),
    )
)]
pub async fn scan_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
    Json(req): Json<ProjectScanRequest>,
) -> Result<(StatusCode, Json<ProjectScanResponse>), ServerError> {
    let scan = state
        .runtime
        .factory
        .enqueue_project_scan(&req.tool_id, &req.options, project_id, req.priority)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(scan.into())))
}
