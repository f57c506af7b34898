//! Typed errors for the request-handling boundary.
//!
//! Internal plumbing (setup, configuration, background tasks) propagates
//! `anyhow::Result`; anything that crosses an HTTP handler boundary is
//! translated into one of the kinds below so every handler maps errors to
//! status codes the same way instead of matching ad hoc per route.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error kinds a request handler can produce.
#[derive(Debug, Error)]
pub enum AppError {
    /// Missing required option, bad port, running as root — fatal at startup,
    /// never returned from a request handler, but shares the enum so
    /// `main` and handlers can report through one `Display` impl.
    #[error("configuration error: {0}")]
    Config(String),

    /// `WorkerPool::acquire` timed out.
    #[error("no worker became available in time")]
    WorkerUnavailable,

    /// Malformed multipart body, missing form field, path-injection attempt.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Download path resolves to a missing file.
    #[error("not found: {0}")]
    NotFound(String),

    /// The supervisor process exited; detected by the maintenance loop.
    #[error("supervisor process died")]
    SupervisorDied,

    /// The peer closed the connection normally.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// A session's initial `load` command failed.
    #[error("document failed to load: {0}")]
    LoadError(String),

    /// Catch-all for I/O and other infrastructure failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SupervisorDied => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PeerDisconnected => StatusCode::BAD_REQUEST,
            AppError::LoadError(_) => StatusCode::BAD_REQUEST,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("request failed: {self}");
        } else {
            log::warn!("request rejected ({status}): {self}");
        }
        (status, self.to_string()).into_response()
    }
}
