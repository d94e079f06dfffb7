//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - the per-request trace-id middleware
//! - the OpenAPI document (disable with `SCANBAY_ENABLE_OPENAPI=false`)
//! - the health route and the `/v1` API

pub mod doc;
mod health;
mod v1;

use axum::routing::get;
use axum::{Json, Router, middleware};
use crate::middleware::trace;
use crate::state::AppState;
use std::sync::Arc;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .merge(health::router())
        .nest("/v1", v1::router());

    if state.config.enable_openapi {
        let api_doc = doc::get_docs();
        app = app.route(
            "/api-docs/openapi.json",
            get(move || {
                let api_doc = api_doc.clone();
                async move { Json(api_doc) }
            }),
        );
    }

    app.layer(middleware::from_fn_with_state(
        state.clone(),
        trace::trace_middleware,
    ))
    .with_state(state)
}


#[cfg(test)]
mod test {
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::testing::get;
    use crate::middleware::trace::X_TRACE_ID;
    use crate::state::testing::app_state;

    #[tokio::test]
    async fn openapi_document_lists_v1_paths() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let (status, doc) = get(&state, "/api-docs/openapi.json").await;
        assert_eq!(status, 200);
        assert!(doc["paths"]["/v1/tasks"].is_object());
        assert!(doc["paths"]["/v1/jobs/{id}"]["delete"].is_object());
        assert!(doc["paths"]["/health"].is_object());
    }

    #[tokio::test]
    async fn trace_id_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;
        let trace_id = "6f9619ff-8b86-d011-b42d-00c04fc964ff";

        let request = Request::builder()
            .method(Method::GET)
            .uri("/health")
            .header(X_TRACE_ID, trace_id)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = super::build(state).oneshot(request).await.unwrap();
        assert_eq!(response.headers()[X_TRACE_ID], trace_id);
    }

    #[tokio::test]
    async fn tool_catalog_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path()).await;

        let (_, tools) = get(&state, "/v1/tools").await;
        let ids: Vec<_> = tools.as_array().unwrap().iter().map(|t| t["id"].clone()).collect();
        assert_eq!(ids, ["curl", "nmap"]);
        assert_eq!(tools[1]["structured_output"], true);
        assert_eq!(tools[0]["structured_output"], false);
    }
}
