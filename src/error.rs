//! Top-level agent error taxonomy (spec §7).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::registry::RegistryError;
use crate::runtime::RuntimeError;
use crate::updater::UpdateError;

/// Discriminated error kind surfaced at every boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RuntimeUnavailable,
    NotFound,
    Conflict,
    RegistryUnreachable,
    AuthRequired,
    ConfigNotReplicable,
    Timeout,
    InvalidConfig,
    Internal,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("configuration not replicable: {0}")]
    ConfigNotReplicable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::Conflict(_) => ErrorKind::Conflict,
            AgentError::RegistryUnreachable(_) => ErrorKind::RegistryUnreachable,
            AgentError::AuthRequired => ErrorKind::AuthRequired,
            AgentError::ConfigNotReplicable(_) => ErrorKind::ConfigNotReplicable,
            AgentError::Timeout(_) => ErrorKind::Timeout,
            AgentError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            AgentError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may usefully retry this exact error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AgentError::RuntimeUnavailable(_) | AgentError::RegistryUnreachable(_) | AgentError::Timeout(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorKind::InvalidConfig => StatusCode::BAD_REQUEST,
            ErrorKind::ConfigNotReplicable => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::RuntimeUnavailable | ErrorKind::RegistryUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RuntimeError> for AgentError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(msg) => AgentError::RuntimeUnavailable(msg),
            RuntimeError::NotFound(msg) => AgentError::NotFound(msg),
            RuntimeError::RegistryUnreachable(msg) => AgentError::RegistryUnreachable(msg),
            RuntimeError::AuthRequired => AgentError::AuthRequired,
            RuntimeError::Other(msg) => AgentError::Internal(msg),
        }
    }
}

impl From<RegistryError> for AgentError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => AgentError::NotFound(format!("container {id}")),
            RegistryError::InvalidTransition(msg) => AgentError::Conflict(msg),
        }
    }
}

impl From<UpdateError> for AgentError {
    fn from(e: UpdateError) -> Self {
        match e {
            UpdateError::NotFound(id) => AgentError::NotFound(format!("container {id}")),
            UpdateError::Conflict(msg) => AgentError::Conflict(msg),
            UpdateError::ConfigNotReplicable(msg) => AgentError::ConfigNotReplicable(msg),
            UpdateError::Timeout(msg) => AgentError::Timeout(msg),
            UpdateError::Runtime(e) => e.into(),
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let retryable = self.retryable();
        let message = self.to_string();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %message, "internal error");
        }

        let body = Json(json!({
            "error": true,
            "kind": kind,
            "message": message,
            "retryable": retryable,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
