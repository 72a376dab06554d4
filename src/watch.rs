//! Push subscription lifecycle for a user's inbox.
//!
//! Subscriptions expire after roughly seven days. Renewal is driven from outside
//! this service by calling [`PushSubscriptionManager::setup`] again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::mailbox::{MailboxProvider, ProviderError, PushSubscription, WatchRegistration};
use crate::repositories::{MailboxStore, StoreError};
use crate::sync_engine::SyncSession;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("mailbox is not connected")]
    NotConnected,

    #[error("push notification topic is not configured")]
    MissingTopic,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of registering a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSetup {
    pub expires_at: DateTime<Utc>,
    /// Provider change-log position when the subscription was created.
    pub cursor_at_setup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub active: bool,
    pub expiration: Option<DateTime<Utc>>,
    /// Whole seconds until expiry, only while active.
    pub expires_in: Option<i64>,
}

impl WatchStatus {
    /// Compare a stored subscription with `now`.
    pub fn evaluate(subscription: Option<&PushSubscription>, now: DateTime<Utc>) -> Self {
        let Some(subscription) = subscription else {
            return Self {
                active: false,
                expiration: None,
                expires_in: None,
            };
        };

        let remaining_ms = (subscription.expires_at - now).num_milliseconds().max(0);
        let active = remaining_ms > 0;

        Self {
            active,
            expiration: Some(subscription.expires_at),
            expires_in: active.then_some(remaining_ms / 1000),
        }
    }
}

pub struct PushSubscriptionManager {
    store: Arc<dyn MailboxStore>,
    provider: Arc<dyn MailboxProvider>,
    topic: Option<String>,
}

impl PushSubscriptionManager {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        provider: Arc<dyn MailboxProvider>,
        topic: Option<String>,
    ) -> Self {
        Self {
            store,
            provider,
            topic: topic.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Register an inbox subscription and record its expiry.
    pub async fn setup(&self, user_id: Uuid) -> Result<SubscriptionSetup, WatchError> {
        let topic = self.topic.as_deref().ok_or(WatchError::MissingTopic)?;
        let mut session = self.session(user_id).await?;

        let watched = self.provider.watch(&session.credential, topic).await;
        let registration = session
            .absorb::<WatchRegistration, WatchError>(self.store.as_ref(), watched)
            .await?;

        let subscription = PushSubscription {
            expires_at: registration.expires_at,
            subscription_token: registration.history_id.clone(),
        };
        self.store.set_watch(user_id, &subscription).await?;

        tracing::info!(
            user_id = %user_id,
            expires_at = %registration.expires_at,
            "Push subscription registered"
        );

        Ok(SubscriptionSetup {
            expires_at: registration.expires_at,
            cursor_at_setup: registration.history_id,
        })
    }

    /// Tear down the subscription with the provider and forget it locally.
    pub async fn stop(&self, user_id: Uuid) -> Result<(), WatchError> {
        let mut session = self.session(user_id).await?;

        let stopped = self.provider.stop_watch(&session.credential).await;
        session
            .absorb::<(), WatchError>(self.store.as_ref(), stopped)
            .await?;

        self.store.clear_watch(user_id).await?;
        tracing::info!(user_id = %user_id, "Push subscription stopped");
        Ok(())
    }

    /// Stored subscription state; never calls the provider.
    pub async fn status(&self, user_id: Uuid) -> Result<WatchStatus, WatchError> {
        let record = self.store.find_by_user(user_id).await?;
        Ok(WatchStatus::evaluate(
            record.as_ref().and_then(|r| r.watch.as_ref()),
            Utc::now(),
        ))
    }

    async fn session(&self, user_id: Uuid) -> Result<SyncSession, WatchError> {
        self.store
            .find_by_user(user_id)
            .await?
            .as_ref()
            .map(SyncSession::from)
            .ok_or(WatchError::NotConnected)
    }
}
