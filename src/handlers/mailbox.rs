//! # Mailbox API Handlers
//!
//! Connection management, on-demand sync and sync status for the acting user.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::error::{ApiError, validation_error};
use crate::repositories::NewMailboxAccount;
use crate::server::AppState;
use crate::sync_engine::{MessageResult, SyncOptions, SyncOutcome, SyncStatus, SyncStrategy};

/// Credentials obtained by the caller's OAuth flow.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMailboxRequest {
    /// Mailbox address, stored lower-cased
    #[schema(example = "buyer@example.com")]
    pub email: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Optional body of `POST /mailbox/sync`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Search result cap for full and date-bounded syncs (default: 50)
    #[serde(default)]
    pub max_results: Option<u32>,
    /// Ignore the stored cursor
    #[serde(default)]
    pub force_full_sync: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct IngestionSummary {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SyncedEmail {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub ingestion: IngestionSummary,
}

impl From<MessageResult> for SyncedEmail {
    fn from(result: MessageResult) -> Self {
        Self {
            id: result.id,
            subject: result.subject,
            from: result.from,
            date: result.date,
            snippet: result.snippet,
            ingestion: IngestionSummary {
                success: result.ingestion_succeeded,
                error: result.error,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub sync_type: SyncStrategy,
    pub total_processed: usize,
    pub new_history_id: Option<String>,
    pub emails: Vec<SyncedEmail>,
}

impl From<SyncOutcome> for SyncResponse {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            success: true,
            sync_type: outcome.strategy,
            total_processed: outcome.processed_count,
            new_history_id: outcome.new_cursor,
            emails: outcome
                .per_message_results
                .into_iter()
                .map(SyncedEmail::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub connected: bool,
    pub email: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    pub has_history_id: bool,
}

impl From<SyncStatus> for SyncStatusResponse {
    fn from(status: SyncStatus) -> Self {
        Self {
            connected: status.connected,
            email: status.email,
            last_synced: status.last_synced,
            has_history_id: status.has_cursor,
        }
    }
}

/// Store (or replace) the mailbox credentials for the acting user
#[utoipa::path(
    put,
    path = "/mailbox/connection",
    security(("bearer_auth" = [])),
    params(UserHeader),
    request_body = ConnectMailboxRequest,
    responses(
        (status = 200, description = "Mailbox connected", body = ConnectionResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 409, description = "Mailbox already connected to another user", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn put_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    body: Bytes,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let request: ConnectMailboxRequest = serde_json::from_slice(&body).map_err(|e| {
        validation_error("Invalid request body", serde_json::json!({ "body": e.to_string() }))
    })?;

    if !request.email.contains('@') {
        return Err(validation_error(
            "Invalid email address",
            serde_json::json!({ "email": "Must be an email address" }),
        ));
    }
    if request.access_token.trim().is_empty() {
        return Err(validation_error(
            "Missing access token",
            serde_json::json!({ "accessToken": "Must not be empty" }),
        ));
    }

    let record = state
        .store
        .upsert_account(NewMailboxAccount {
            user_id: user.0,
            email: request.email,
            access_token: request.access_token,
            refresh_token: request.refresh_token.filter(|t| !t.is_empty()),
            expires_at: request.expires_at,
            scope: request.scope,
        })
        .await?;

    tracing::info!(user_id = %user.0, "Mailbox connected");
    Ok(Json(ConnectionResponse {
        connected: true,
        email: Some(record.email),
    }))
}

/// Revoke the stored token and forget the mailbox
#[utoipa::path(
    delete,
    path = "/mailbox/connection",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Mailbox disconnected", body = ConnectionResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<ConnectionResponse>, ApiError> {
    if let Some(record) = state.store.find_by_user(user.0).await? {
        // Revocation is best-effort; the local row goes regardless.
        if let Err(err) = state.provider.revoke(&record.credential.access_token).await {
            tracing::warn!(user_id = %user.0, error = %err, "Token revocation failed");
        }
    }

    let removed = state.store.delete_account(user.0).await?;
    tracing::info!(user_id = %user.0, removed, "Mailbox disconnected");

    Ok(Json(ConnectionResponse {
        connected: false,
        email: None,
    }))
}

/// Pull order emails from the mailbox and hand them to ingestion
#[utoipa::path(
    post,
    path = "/mailbox/sync",
    security(("bearer_auth" = [])),
    params(UserHeader),
    request_body(content = Option<SyncRequest>, description = "Optional sync options"),
    responses(
        (status = 200, description = "Sync completed", body = SyncResponse),
        (status = 400, description = "Not connected or invalid options", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 429, description = "Provider rate limit", body = ApiError),
        (status = 502, description = "Provider error", body = ApiError),
        (status = 504, description = "Deadline exceeded", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn sync_mailbox(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    body: Bytes,
) -> Result<Json<SyncResponse>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice::<SyncRequest>(&body).map_err(|e| {
            validation_error("Invalid request body", serde_json::json!({ "body": e.to_string() }))
        })?
    };

    let sync_config = &state.config.sync;
    let max_results = request
        .max_results
        .unwrap_or(sync_config.default_max_results);
    if max_results == 0 || max_results > sync_config.max_results_cap {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED".to_string(),
            format!("maxResults must be between 1 and {}", sync_config.max_results_cap),
        ));
    }

    let outcome = state
        .engine
        .sync(
            user.0,
            SyncOptions {
                max_results,
                force_full_sync: request.force_full_sync.unwrap_or(false),
                deadline: sync_config.deadline(),
            },
        )
        .await?;

    Ok(Json(SyncResponse::from(outcome)))
}

/// Connection and cursor summary
#[utoipa::path(
    get,
    path = "/mailbox/sync-status",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Sync status", body = SyncStatusResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn sync_status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<SyncStatusResponse>, ApiError> {
    let status = state.engine.status(user.0).await?;
    Ok(Json(status.into()))
}
