use super::state::ApiState;
use crate::MailboxId;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
pub(super) struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    model_trained: bool,
    active_pollers: Vec<MailboxId>,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        model_trained: state.service.model().is_trained(),
        active_pollers: state.service.active_pollers().await,
    })
}
