//! Read-only view of the tool catalog.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::schemas::v1::tool::ToolResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_tools), components(schemas(ToolResponse)))]
pub struct ToolsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/tools", get(list_tools))
}

#[utoipa::path(
    get,
    path = "/v1/tools",
    tag = "tools",
    responses(
        (status = 200, description = "Catalog tools, sorted by id", body = [ToolResponse]),
    )
)]
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolResponse>> {
    Json(
        state
            .runtime
            .tools
            .iter()
            .map(|(id, tool)| ToolResponse::new(id, tool))
            .collect(),
    )
}
