pub mod jobs;
pub mod playbooks;
pub mod projects;
pub mod tasks;
pub mod tools;

use crate::state::AppState;
use utoipa::OpenApi;

use axum::Router;
use std::sync::Arc;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(tools::router())
        .merge(tasks::router())
        .merge(projects::router())
        .merge(playbooks::router())
        .merge(jobs::router())
}

#[derive(OpenApi)]
#[openapi()]
pub struct V1Api;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = V1Api::openapi();
    doc.merge(tools::ToolsApi::openapi());
    doc.merge(tasks::TasksApi::openapi());
    doc.merge(projects::ProjectsApi::openapi());
    doc.merge(playbooks::PlaybooksApi::openapi());
    doc.merge(jobs::JobsApi::openapi());

    doc
}
