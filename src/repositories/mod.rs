//! # Repository Layer
//!
//! The [`MailboxStore`] trait is the durable per-user record the sync engine, the
//! watch manager and the webhook ingestor share. It is injected into each of them
//! rather than reached through global state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::mailbox::{MailboxCredential, PushSubscription, RefreshResult, SyncCursor};

pub mod mailbox_account;

pub use mailbox_account::{MailboxAccountRepository, normalize_email};

/// Errors raised by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("credential encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("no mailbox account for user {0}")]
    NotFound(Uuid),
}

/// Decrypted view of one user's mailbox account.
#[derive(Debug, Clone)]
pub struct MailboxAccountRecord {
    pub user_id: Uuid,
    pub email: String,
    pub credential: MailboxCredential,
    pub scope: Option<String>,
    pub cursor: SyncCursor,
    pub watch: Option<PushSubscription>,
    pub updated_at: DateTime<Utc>,
}

/// Input for connecting (or reconnecting) a mailbox.
#[derive(Debug, Clone)]
pub struct NewMailboxAccount {
    pub user_id: Uuid,
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

/// Durable per-user mailbox state.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<MailboxAccountRecord>, StoreError>;

    /// Lookup by address, case-insensitively.
    async fn find_by_email(&self, email: &str) -> Result<Option<MailboxAccountRecord>, StoreError>;

    /// Create or replace the account's credentials. Changing the address resets the
    /// cursor and the push subscription.
    async fn upsert_account(
        &self,
        account: NewMailboxAccount,
    ) -> Result<MailboxAccountRecord, StoreError>;

    /// Persist refreshed tokens in one row update. An absent refresh token keeps the stored one.
    async fn apply_refresh(
        &self,
        user_id: Uuid,
        email: &str,
        refresh: &RefreshResult,
    ) -> Result<(), StoreError>;

    /// Write the outcome of a completed sync.
    async fn record_sync(
        &self,
        user_id: Uuid,
        cursor: Option<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Replace only the cursor, leaving `last_sync_at` untouched.
    async fn update_cursor(&self, user_id: Uuid, cursor: Option<String>) -> Result<(), StoreError>;

    async fn set_watch(
        &self,
        user_id: Uuid,
        subscription: &PushSubscription,
    ) -> Result<(), StoreError>;

    async fn clear_watch(&self, user_id: Uuid) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    async fn delete_account(&self, user_id: Uuid) -> Result<bool, StoreError>;
}
