//! HTTP API over the mail service.

mod mail;
mod state;
mod system;

pub use state::ApiState;

use crate::error::{ClassifyError, Error, MailError};

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn router(state: Arc<ApiState>) -> Router {
    let mail_routes = Router::new()
        .route("/poll/start", post(mail::start_poll))
        .route("/poll/stop", post(mail::stop_poll))
        .route("/poll/status", get(mail::poll_status))
        .route("/messages", get(mail::list_buffered))
        .route("/analyze", get(mail::analyze_buffered))
        .route("/analyze-text", post(mail::analyze_text))
        .route("/stats", get(mail::stats))
        .route("/priority/{priority}", get(mail::filter_by_priority))
        .route("/department/{department}", get(mail::filter_by_department))
        .route("/ingest", post(mail::ingest))
        .route("/stored", get(mail::list_stored))
        .route("/stored/analyze", get(mail::analyze_stored))
        .route("/stored/{id}/read", post(mail::mark_read));

    Router::new()
        .route("/health", get(system::health))
        .route("/status", get(system::status))
        .nest("/mail", mail_routes)
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind {bind}: {error}"))?;
    tracing::info!(%bind, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|error| anyhow::anyhow!("HTTP server error: {error}"))?;

    tracing::info!("HTTP API stopped");
    Ok(())
}

/// Maps service errors onto JSON responses.
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    Service(Error),
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::Service(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = match self {
            Self::BadRequest(message) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": message })),
                )
                    .into_response();
            }
            Self::Service(error) => error,
        };

        // A mailbox that was never started is a status, not a failure.
        if let Error::UnknownMailbox(_) = error {
            return Json(serde_json::json!({
                "status": "poller not started for this email"
            }))
            .into_response();
        }

        let status = match &error {
            Error::Mail(MailError::Auth { .. }) => StatusCode::UNAUTHORIZED,
            Error::Mail(MailError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Error::Mail(_) => StatusCode::BAD_GATEWAY,
            Error::Classify(ClassifyError::Untrained) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Secret(_) => StatusCode::BAD_REQUEST,
            Error::StopTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::warn!(%error, "request failed");
        }

        (
            status,
            Json(serde_json::json!({ "error": error.to_string() })),
        )
            .into_response()
    }
}
