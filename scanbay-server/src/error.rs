//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body
//! `{"error": "..."}` with an appropriate status code.
//!
//! Store and other internal failures are logged in full; callers only see a
//! generic message so that file paths and SQL never leak.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scanbay_core::{QueueError, StopError, TaskCreateError, ValidationError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the SQLite store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The resource exists but is not in a state that allows the request.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<ValidationError> for ServerError {
    fn from(e: ValidationError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl From<QueueError> for ServerError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::InvalidPriority(_) | QueueError::Payload(_) => {
                ServerError::BadRequest(e.to_string())
            }
            QueueError::Store(e) => ServerError::Database(e),
        }
    }
}

impl From<TaskCreateError> for ServerError {
    fn from(e: TaskCreateError) -> Self {
        match e {
            TaskCreateError::Invalid(e) => e.into(),
            TaskCreateError::Queue(e) => e.into(),
            TaskCreateError::Store(e) => ServerError::Database(e),
        }
    }
}

impl From<StopError> for ServerError {
    fn from(e: StopError) -> Self {
        match e {
            StopError::NotFound(_) => ServerError::NotFound(e.to_string()),
            StopError::NotRunning(_) => ServerError::Conflict(e.to_string()),
            StopError::Store(e) => ServerError::Database(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use scanbay_core::TaskId;

    #[test]
    fn stop_errors_map_to_client_statuses() {
        let not_found = ServerError::from(StopError::NotFound(TaskId(7)));
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let not_running = ServerError::from(StopError::NotRunning(TaskId(7)));
        assert_eq!(not_running.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let err = ServerError::from(TaskCreateError::Invalid(ValidationError::EmptyTarget));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = ServerError::from(QueueError::InvalidPriority(500));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ServerError::Internal("/secret/path exploded".into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
