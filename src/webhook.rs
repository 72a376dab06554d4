//! # Push notification ingestion
//!
//! Handles mailbox change notifications delivered through Pub/Sub. Every outcome
//! other than a bad shared secret is acknowledged so the publisher does not retry
//! deliveries that can never succeed.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::mailbox::gmail::string_or_number;
use crate::repositories::MailboxStore;
use crate::sync_engine::{MailboxSyncEngine, SyncError, SyncSession, cursor_is_newer};

/// Pub/Sub push envelope.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PushEnvelope {
    #[serde(default)]
    pub message: Option<PushMessage>,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64-encoded JSON `{ emailAddress, historyId }`.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub publish_time: Option<String>,
}

/// Decoded notification payload.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MailboxNotification {
    pub email_address: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub history_id: Option<String>,
}

impl MailboxNotification {
    pub fn decode(data: &str) -> Result<Self, String> {
        let bytes = STANDARD
            .decode(data.trim())
            .or_else(|_| URL_SAFE.decode(data.trim()))
            .map_err(|e| format!("Invalid notification encoding: {}", e))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("Invalid notification payload: {}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UserNotFound,
    NoHistoryId,
    AlreadySynced,
    HistoryExpiredUpdated,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UserNotFound => "user_not_found",
            SkipReason::NoHistoryId => "no_history_id",
            SkipReason::AlreadySynced => "already_synced",
            SkipReason::HistoryExpiredUpdated => "history_expired_updated",
        }
    }
}

/// How a notification was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    Processed { messages_processed: usize },
    Skipped(SkipReason),
    Unauthorized,
    Failed { message: String },
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Processed { .. } => "processed",
            AckStatus::Skipped(reason) => reason.as_str(),
            AckStatus::Unauthorized => "unauthorized",
            AckStatus::Failed { .. } => "error",
        }
    }
}

/// Acknowledgement body returned to the publisher.
#[derive(Debug, Clone, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&AckStatus> for WebhookAck {
    fn from(status: &AckStatus) -> Self {
        let (messages_processed, message) = match status {
            AckStatus::Processed { messages_processed } => (Some(*messages_processed), None),
            AckStatus::Failed { message } => (None, Some(message.clone())),
            AckStatus::Unauthorized => (None, Some("Unauthorized".to_string())),
            AckStatus::Skipped(_) => (None, None),
        };
        Self {
            status: status.as_str().to_string(),
            messages_processed,
            message,
        }
    }
}

pub struct WebhookIngestor {
    store: Arc<dyn MailboxStore>,
    engine: Arc<MailboxSyncEngine>,
    secret: Option<String>,
}

impl WebhookIngestor {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        engine: Arc<MailboxSyncEngine>,
        secret: Option<String>,
    ) -> Self {
        Self {
            store,
            engine,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Apply one push delivery. `token` is the shared secret from the query string.
    pub async fn handle(&self, envelope: &PushEnvelope, token: Option<&str>) -> AckStatus {
        let status = if !self.authorized(token) {
            tracing::warn!("Webhook called with invalid or missing token");
            AckStatus::Unauthorized
        } else {
            self.apply(envelope).await
        };

        metrics::counter!("webhook_notifications_total", "status" => status.as_str())
            .increment(1);
        status
    }

    fn authorized(&self, token: Option<&str>) -> bool {
        // No configured secret means nothing can authenticate.
        match (self.secret.as_deref(), token) {
            (Some(secret), Some(token)) => secret.as_bytes().ct_eq(token.as_bytes()).into(),
            _ => false,
        }
    }

    async fn apply(&self, envelope: &PushEnvelope) -> AckStatus {
        let Some(data) = envelope.message.as_ref().and_then(|m| m.data.as_deref()) else {
            tracing::warn!("Webhook delivery without message data");
            return AckStatus::Failed {
                message: "Missing message data".to_string(),
            };
        };

        let notification = match MailboxNotification::decode(data) {
            Ok(notification) => notification,
            Err(message) => {
                tracing::warn!(error = %message, "Undecodable webhook notification");
                return AckStatus::Failed { message };
            }
        };
        let Some(notified_cursor) = notification.history_id.clone() else {
            return AckStatus::Failed {
                message: "Notification is missing historyId".to_string(),
            };
        };

        tracing::info!(
            history_id = %notified_cursor,
            message_id = ?envelope.message.as_ref().and_then(|m| m.message_id.as_deref()),
            "Webhook notification received"
        );

        match self.apply_notification(&notification.email_address, &notified_cursor).await {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(error = %err, "Webhook processing failed");
                AckStatus::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    async fn apply_notification(
        &self,
        email: &str,
        notified_cursor: &str,
    ) -> Result<AckStatus, SyncError> {
        let Some(record) = self.store.find_by_email(email).await? else {
            tracing::info!("Webhook: no mailbox account for notified address");
            return Ok(AckStatus::Skipped(SkipReason::UserNotFound));
        };
        let user_id = record.user_id;

        let _lease = self.engine.leases().acquire(user_id).await;

        // Re-read under the lease; a concurrent sync may have moved the cursor.
        let Some(record) = self.store.find_by_user(user_id).await? else {
            return Ok(AckStatus::Skipped(SkipReason::UserNotFound));
        };
        let Some(stored_cursor) = record.cursor.last_history_id.clone() else {
            tracing::info!(user_id = %user_id, "Webhook: no stored cursor, skipping");
            return Ok(AckStatus::Skipped(SkipReason::NoHistoryId));
        };

        if !cursor_is_newer(notified_cursor, &stored_cursor) {
            tracing::debug!(user_id = %user_id, "Webhook: notification not newer than cursor");
            return Ok(AckStatus::Skipped(SkipReason::AlreadySynced));
        }

        let mut session = SyncSession::from(&record);
        match self.engine.run_incremental(&mut session, &stored_cursor).await {
            Ok(outcome) => {
                let cursor = match outcome.new_cursor {
                    Some(derived) if cursor_is_newer(&derived, notified_cursor) => derived,
                    _ => notified_cursor.to_string(),
                };
                self.store
                    .record_sync(user_id, Some(cursor), Utc::now())
                    .await?;

                tracing::info!(
                    user_id = %user_id,
                    messages = outcome.candidate_count,
                    "Webhook notification processed"
                );
                Ok(AckStatus::Processed {
                    messages_processed: outcome.candidate_count,
                })
            }
            Err(err) if err.is_cursor_expired() => {
                tracing::info!(user_id = %user_id, "Webhook: history expired, adopting notified cursor");
                self.store
                    .update_cursor(user_id, Some(notified_cursor.to_string()))
                    .await?;
                Ok(AckStatus::Skipped(SkipReason::HistoryExpiredUpdated))
            }
            Err(err) => Err(err),
        }
    }
}
