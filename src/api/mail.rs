use super::ApiError;
use super::state::ApiState;
use crate::analysis::{AnalyzedMessage, MailboxStats, PollRequest, StartedPoll};
use crate::classify::AnalysisResult;
use crate::mail::poller::PollerState;
use crate::store::StoredMessage;
use crate::{MailboxCredential, MailboxId, MessageRecord};

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Either a plaintext password or an encrypted secret ref, never both.
#[derive(Deserialize)]
pub(super) struct CredentialFields {
    #[serde(default)]
    server: Option<String>,
    account: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    secret_ref: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct StartPollRequest {
    /// Explicit identity; defaults to `account/server`.
    #[serde(default)]
    mailbox: Option<String>,
    #[serde(flatten)]
    credential: CredentialFields,
    #[serde(default)]
    interval_secs: Option<u64>,
}

#[derive(Deserialize)]
pub(super) struct MailboxRequest {
    mailbox: String,
}

#[derive(Deserialize)]
pub(super) struct MailboxQuery {
    mailbox: String,
}

#[derive(Deserialize)]
pub(super) struct OwnerQuery {
    owner: String,
}

#[derive(Deserialize)]
pub(super) struct AnalyzeTextRequest {
    text: String,
}

#[derive(Deserialize)]
pub(super) struct IngestRequest {
    owner: String,
    #[serde(flatten)]
    credential: CredentialFields,
}

#[derive(Serialize)]
pub(super) struct PollStatusResponse {
    mailbox: MailboxId,
    state: PollerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval_secs: Option<u64>,
}

#[derive(Serialize)]
pub(super) struct ActionResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
pub(super) struct MarkReadResponse {
    updated: bool,
}

enum Secret<'a> {
    Password(&'a str),
    Ref(&'a str),
}

impl CredentialFields {
    fn secret(&self) -> Result<Secret<'_>, ApiError> {
        if self.account.trim().is_empty() {
            return Err(ApiError::BadRequest("account must not be empty".to_string()));
        }
        match (self.password.as_deref(), self.secret_ref.as_deref()) {
            (Some(password), None) => Ok(Secret::Password(password)),
            (None, Some(secret_ref)) => Ok(Secret::Ref(secret_ref)),
            _ => Err(ApiError::BadRequest(
                "exactly one of password or secret_ref is required".to_string(),
            )),
        }
    }

    fn resolve(&self, state: &ApiState) -> Result<MailboxCredential, ApiError> {
        let server = self.server.as_deref();
        match self.secret()? {
            Secret::Password(password) => {
                Ok(state.service.credential(server, &self.account, password))
            }
            Secret::Ref(secret_ref) => Ok(state
                .service
                .credential_with_secret(server, &self.account, secret_ref)?),
        }
    }
}

pub(super) async fn start_poll(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<StartPollRequest>,
) -> Result<Json<StartedPoll>, ApiError> {
    let fields = &request.credential;
    let poll = PollRequest {
        mailbox: request.mailbox.as_deref().map(MailboxId::from),
        server: fields.server.as_deref(),
        account: &fields.account,
        interval_secs: request.interval_secs,
    };

    let started = match fields.secret()? {
        Secret::Password(password) => state.service.start_poll(poll, password).await,
        Secret::Ref(secret_ref) => {
            state
                .service
                .start_poll_with_secret(poll, secret_ref)
                .await?
        }
    };

    Ok(Json(started))
}

pub(super) async fn stop_poll(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<MailboxRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let mailbox = MailboxId::new(request.mailbox);
    state.service.stop_poll(&mailbox).await?;

    Ok(Json(ActionResponse {
        success: true,
        message: format!("poller for {mailbox} stopped"),
    }))
}

pub(super) async fn poll_status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MailboxQuery>,
) -> Json<PollStatusResponse> {
    let mailbox = MailboxId::new(query.mailbox);
    let poller_state = state.service.poller_status(&mailbox).await;
    let interval_secs = state.service.poll_interval_secs(&mailbox).await;
    Json(PollStatusResponse {
        mailbox,
        state: poller_state,
        interval_secs,
    })
}

pub(super) async fn list_buffered(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MailboxQuery>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let records = state
        .service
        .list_buffered(&MailboxId::new(query.mailbox))
        .await?;
    Ok(Json(records.as_ref().clone()))
}

pub(super) async fn analyze_buffered(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MailboxQuery>,
) -> Result<Json<Vec<AnalyzedMessage>>, ApiError> {
    let analyzed = state
        .service
        .analyze_buffered(&MailboxId::new(query.mailbox))
        .await?;
    Ok(Json(analyzed))
}

pub(super) async fn analyze_text(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AnalyzeTextRequest>,
) -> Result<Json<AnalysisResult>, ApiError> {
    Ok(Json(state.service.analyze_text(&request.text)?))
}

pub(super) async fn stats(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MailboxQuery>,
) -> Result<Json<MailboxStats>, ApiError> {
    let stats = state
        .service
        .stats(&MailboxId::new(query.mailbox))
        .await?;
    Ok(Json(stats))
}

pub(super) async fn filter_by_priority(
    State(state): State<Arc<ApiState>>,
    Path(priority): Path<String>,
    Query(query): Query<MailboxQuery>,
) -> Result<Json<Vec<AnalyzedMessage>>, ApiError> {
    let filtered = state
        .service
        .filter_by_priority(&MailboxId::new(query.mailbox), &priority)
        .await?;
    Ok(Json(filtered))
}

pub(super) async fn filter_by_department(
    State(state): State<Arc<ApiState>>,
    Path(department): Path<String>,
    Query(query): Query<MailboxQuery>,
) -> Result<Json<Vec<AnalyzedMessage>>, ApiError> {
    let filtered = state
        .service
        .filter_by_department(&MailboxId::new(query.mailbox), &department)
        .await?;
    Ok(Json(filtered))
}

pub(super) async fn ingest(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let credential = request.credential.resolve(&state)?;
    let stored = state.service.ingest(&request.owner, &credential).await?;
    Ok(Json(stored))
}

pub(super) async fn list_stored(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    Ok(Json(state.service.list_stored(&query.owner).await?))
}

pub(super) async fn analyze_stored(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Vec<AnalyzedMessage<StoredMessage>>>, ApiError> {
    Ok(Json(state.service.analyze_stored(&query.owner).await?))
}

pub(super) async fn mark_read(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let updated = state.service.mark_read(&query.owner, id).await?;
    Ok(Json(MarkReadResponse { updated }))
}
