//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use stagecraft_core::controller::ControllerError;
use stagecraft_core::definition::DefinitionError;
use stagecraft_types::error::RepositoryError;
use uuid::Uuid;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Controller(ControllerError),
    Definition(DefinitionError),
    Repository(RepositoryError),
    RunNotFound(Uuid),
    /// The run exists but is not being driven by this process.
    RunNotActive(Uuid),
    Validation(String),
}

impl From<ControllerError> for AppError {
    fn from(e: ControllerError) -> Self {
        AppError::Controller(e)
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Definition(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Repository(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Controller(e @ (ControllerError::Graph(_) | ControllerError::Registry(_))) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            AppError::Controller(ControllerError::RunNotFound(id)) | AppError::RunNotFound(id) => (
                StatusCode::NOT_FOUND,
                "RUN_NOT_FOUND",
                format!("Run {id} not found"),
            ),
            AppError::Controller(e @ ControllerError::AlreadyActive(_)) => {
                (StatusCode::CONFLICT, "RUN_ACTIVE", e.to_string())
            }
            AppError::Controller(e @ ControllerError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", e.to_string())
            }
            AppError::Controller(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR", e.to_string())
            }
            AppError::Definition(DefinitionError::Io(e)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string())
            }
            AppError::Definition(e) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
            AppError::Repository(RepositoryError::NotFound) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "Entity not found".to_string())
            }
            AppError::Repository(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string())
            }
            AppError::RunNotActive(id) => (
                StatusCode::CONFLICT,
                "RUN_NOT_ACTIVE",
                format!("Run {id} is not active in this server"),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, %message, "request failed");
        }
        ApiResponse::error(status, code, &message).into_response()
    }
}
