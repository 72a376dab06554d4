//! # Push Subscription Handlers

use axum::{extract::State, response::Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::error::ApiError;
use crate::server::AppState;
use crate::watch::{SubscriptionSetup, WatchStatus};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchSetupResponse {
    pub success: bool,
    pub expiration: DateTime<Utc>,
    /// Change-log position when the subscription was created
    pub history_id: Option<String>,
}

impl From<SubscriptionSetup> for WatchSetupResponse {
    fn from(setup: SubscriptionSetup) -> Self {
        Self {
            success: true,
            expiration: setup.expires_at,
            history_id: setup.cursor_at_setup,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatusResponse {
    pub active: bool,
    pub expiration: Option<DateTime<Utc>>,
    /// Whole seconds until expiry while active
    pub expires_in: Option<i64>,
}

impl From<WatchStatus> for WatchStatusResponse {
    fn from(status: WatchStatus) -> Self {
        Self {
            active: status.active,
            expiration: status.expiration,
            expires_in: status.expires_in,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WatchStopResponse {
    pub success: bool,
}

/// Register (or renew) the inbox push subscription
#[utoipa::path(
    post,
    path = "/mailbox/watch",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Subscription registered", body = WatchSetupResponse),
        (status = 400, description = "Mailbox not connected", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 500, description = "Push topic not configured", body = ApiError),
        (status = 502, description = "Provider error", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn setup_watch(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<WatchSetupResponse>, ApiError> {
    let setup = state.watch.setup(user.0).await?;
    Ok(Json(setup.into()))
}

/// Stored subscription state
#[utoipa::path(
    get,
    path = "/mailbox/watch",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Subscription status", body = WatchStatusResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn watch_status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<WatchStatusResponse>, ApiError> {
    let status = state.watch.status(user.0).await?;
    Ok(Json(status.into()))
}

/// Tear down the push subscription
#[utoipa::path(
    delete,
    path = "/mailbox/watch",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Subscription stopped", body = WatchStopResponse),
        (status = 400, description = "Mailbox not connected", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "mailbox"
)]
pub async fn stop_watch(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<WatchStopResponse>, ApiError> {
    state.watch.stop(user.0).await?;
    Ok(Json(WatchStopResponse { success: true }))
}
