//! # Webhook Handlers
//!
//! Public endpoint for mailbox push notifications. It sits outside operator
//! authentication; the shared `token` query parameter is its only credential.

use axum::{
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::server::AppState;
use crate::webhook::{AckStatus, PushEnvelope, WebhookAck};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct WebhookTokenQuery {
    /// Shared secret configured on the push subscription endpoint
    pub token: Option<String>,
}

/// Receive a Pub/Sub push delivery
#[utoipa::path(
    post,
    path = "/webhooks/gmail",
    params(WebhookTokenQuery),
    request_body = PushEnvelope,
    responses(
        (status = 200, description = "Delivery acknowledged", body = WebhookAck, example = json!({
            "status": "processed",
            "messagesProcessed": 2
        })),
        (status = 401, description = "Invalid or missing token", body = WebhookAck)
    ),
    tag = "webhooks"
)]
pub async fn gmail_webhook(
    State(state): State<AppState>,
    query: Result<Query<WebhookTokenQuery>, QueryRejection>,
    body: Bytes,
) -> (StatusCode, Json<WebhookAck>) {
    // A malformed query string carries no usable token.
    let query = query.map(|Query(query)| query).unwrap_or_else(|rejection| {
        tracing::warn!(error = %rejection, "Webhook query string rejected");
        WebhookTokenQuery::default()
    });

    // A body that does not parse still gets the token check first.
    let envelope = serde_json::from_slice::<PushEnvelope>(&body).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Webhook body is not a push envelope");
        PushEnvelope::default()
    });

    let status = state.webhook.handle(&envelope, query.token.as_deref()).await;
    let code = match status {
        AckStatus::Unauthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::OK,
    };

    (code, Json(WebhookAck::from(&status)))
}
