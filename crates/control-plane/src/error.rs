//! Error taxonomy for the control plane.
//!
//! Each component keeps its own precise error enum (`dispatcher::DispatchError`,
//! `hub::SendError`, `selector::SelectError`) and converts into `AppError`
//! only at the boundary that needs the coarser taxonomy — typically the
//! REST handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The REST-boundary error categories: Validation, Routing, Transport,
/// Contract violation, Fatal. `Fatal` is not a variant here — it only
/// happens at startup and is handled as a top-level `anyhow::Result` in
/// `main`, never surfaced through this type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("no online agents available")]
    NoAgentsAvailable,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is not in running phase")]
    SessionNotRunning(String),

    #[error("routing: {0}")]
    Routing(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),
}

impl From<crate::session::SessionError> for AppError {
    fn from(e: crate::session::SessionError) -> Self {
        use crate::session::SessionError as S;
        match e {
            S::NoAgentsAvailable => AppError::NoAgentsAvailable,
            S::NotFound(id) => AppError::SessionNotFound(id),
            S::Terminal(id) => AppError::SessionNotRunning(id),
            S::AlreadyInFlight(id) => AppError::Validation(format!(
                "session {id} already has a desired-state change in flight"
            )),
            S::QuotaExceeded(owner) => {
                AppError::Validation(format!("owner {owner} is over quota"))
            }
            S::Store(e) => AppError::Store(e),
            S::Dispatch(e) => AppError::Validation(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NoAgentsAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No online agents available".to_string(),
            ),
            AppError::SessionNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("session not found: {id}"))
            }
            AppError::SessionNotRunning(id) => (
                StatusCode::CONFLICT,
                format!("session {id} is not running"),
            ),
            AppError::Routing(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Transport(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error surfaced to REST boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            AppError::Store(e) => {
                tracing::error!(error = %e, "store error surfaced to REST boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
