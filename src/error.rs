//! Errors surfaced to callers of the registry and the HTTP gateway.

use crate::catalog::WidgetKind;
use crate::executor::ExecutorError;
use crate::ids::IdError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Malformed(#[from] IdError),
    #[error("page {0} not found")]
    PageNotFound(String),
    #[error("page {0} is not interactive")]
    NotInteractive(String),
    #[error("page {url} has no widget {index}")]
    UnknownWidget { url: String, index: usize },
    #[error("widget {index} is a {actual} widget, expected {expected}")]
    WrongWidgetType {
        index: usize,
        expected: WidgetKind,
        actual: WidgetKind,
    },
    #[error("button {0} is already running")]
    AlreadyRunning(usize),
    #[error("no active session for {0}")]
    SessionNotActive(String),
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(#[source] ExecutorError),
}

impl RegistryError {
    /// Stable machine-readable name, used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Malformed(_) => "malformedInput",
            RegistryError::PageNotFound(_) | RegistryError::UnknownWidget { .. } => "notFound",
            RegistryError::NotInteractive(_) => "notInteractive",
            RegistryError::WrongWidgetType { .. } => "wrongWidgetType",
            RegistryError::AlreadyRunning(_) => "alreadyRunning",
            RegistryError::SessionNotActive(_) => "sessionNotActive",
            RegistryError::SandboxUnavailable(_) => "sandboxUnavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RegistryError::Malformed(_)
            | RegistryError::NotInteractive(_)
            | RegistryError::WrongWidgetType { .. }
            | RegistryError::SessionNotActive(_) => StatusCode::BAD_REQUEST,
            RegistryError::PageNotFound(_) | RegistryError::UnknownWidget { .. } => {
                StatusCode::NOT_FOUND
            }
            RegistryError::AlreadyRunning(_) => StatusCode::CONFLICT,
            RegistryError::SandboxUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no route for {0}")]
    NoRoute(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!("Request rejected: {}", self);
        let (status, error) = match &self {
            ApiError::Registry(err) => (err.status(), err.kind()),
            ApiError::NoRoute(_) => (StatusCode::NOT_FOUND, "notFound"),
        };
        let body = ErrorBody {
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<IdError> for ApiError {
    fn from(err: IdError) -> Self {
        ApiError::Registry(RegistryError::Malformed(err))
    }
}
