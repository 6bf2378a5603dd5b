use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// The error taxonomy the engine uses at its boundaries (HTTP handlers,
/// task terminal state). Internal plumbing still propagates `anyhow::Error`
/// with `.context(...)`; this enum is what that plumbing gets converted
/// into once it reaches a point that has to report a stable kind.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("webhook signature invalid")]
    SignatureInvalid,

    #[error("git authentication required: {0}")]
    AuthRequired(String),

    #[error("repository unreachable: {0}")]
    RepoUnreachable(String),

    #[error("Dockerfile missing: {0}")]
    DockerfileMissing(String),

    #[error("Dockerfile malformed: {0}")]
    DockerfileMalformed(String),

    #[error("template render failed: {0}")]
    TemplateRenderError(String),

    #[error("invalid resource package path: {0}")]
    InvalidResourcePath(String),

    #[error("build failed running `{command}`: {tail}")]
    BuildFailed { command: String, tail: String },

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("remote command failed (exit {exit_status}): {message}")]
    RemoteExecFailed { exit_status: i32, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            EngineError::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            EngineError::RepoUnreachable(_)
            | EngineError::DockerfileMissing(_)
            | EngineError::DockerfileMalformed(_)
            | EngineError::TemplateRenderError(_)
            | EngineError::InvalidResourcePath(_)
            | EngineError::BuildFailed { .. }
            | EngineError::PushFailed(_)
            | EngineError::HostNotFound(_)
            | EngineError::RemoteExecFailed { .. }
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.to_string();
        tracing::debug!(%status, %detail, "request failed");
        (status, axum::Json(ErrorBody { detail })).into_response()
    }
}

/// Converts a worker-side `anyhow::Error` into the text stored on a
/// terminal task. No implicit retries happen anywhere in the core (spec
/// §7) — this just renders a stable, loggable string.
pub fn worker_error_text(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
