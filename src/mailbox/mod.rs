//! # Mailbox provider abstraction
//!
//! Domain types shared by the sync engine, the push subscription manager and the
//! webhook ingestor, plus the [`MailboxProvider`] seam implemented by
//! [`gmail::GmailClient`].
//!
//! Provider calls never mutate credentials behind the caller's back. When a call
//! had to refresh the access token it hands the new token back inside
//! [`Refreshed::refresh`], and the caller applies it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub mod body;
pub mod gmail;

pub use body::{MessageBodyExtractor, RawMessage};
pub use gmail::GmailClient;

/// Access credential for one user's mailbox.
#[derive(Clone)]
pub struct MailboxCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for MailboxCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxCredential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl MailboxCredential {
    /// Whether the access token is expired or about to expire.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some()
            && self
                .expires_at
                .is_some_and(|expires_at| expires_at - Duration::seconds(60) <= now)
    }

    /// Apply a refresh result in place. A missing refresh token keeps the old one.
    pub fn apply(&mut self, refresh: &RefreshResult) {
        self.access_token = refresh.access_token.clone();
        if let Some(token) = &refresh.refresh_token {
            self.refresh_token = Some(token.clone());
        }
        self.expires_at = refresh.expires_at;
    }
}

/// New token material obtained while serving a provider call.
#[derive(Clone)]
pub struct RefreshResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RefreshResult {
    /// Combine with a later refresh, keeping this refresh token if the later one omits it.
    pub fn superseded_by(self, later: RefreshResult) -> RefreshResult {
        RefreshResult {
            refresh_token: later.refresh_token.or(self.refresh_token),
            ..later
        }
    }
}

impl std::fmt::Debug for RefreshResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshResult")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// A provider response plus the refresh that happened while producing it, if any.
#[derive(Debug, Clone)]
pub struct Refreshed<T> {
    pub value: T,
    pub refresh: Option<RefreshResult>,
}

impl<T> Refreshed<T> {
    pub fn new(value: T, refresh: Option<RefreshResult>) -> Self {
        Self { value, refresh }
    }

    /// Apply any refresh to `credential` and return the value plus the refresh for persistence.
    pub fn unpack(self, credential: &mut MailboxCredential) -> (T, Option<RefreshResult>) {
        if let Some(refresh) = &self.refresh {
            credential.apply(refresh);
        }
        (self.value, self.refresh)
    }
}

/// Per-user position in the provider's change log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub last_history_id: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Stored push subscription state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSubscription {
    pub expires_at: DateTime<Utc>,
    pub subscription_token: Option<String>,
}

/// Fully fetched message with the fields the sync engine reads.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub headers: Vec<(String, String)>,
    pub internal_date: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub payload: RawMessage,
}

impl MailMessage {
    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Message ids added since a cursor, plus the provider's current cursor.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    pub message_ids: Vec<String>,
    pub history_id: Option<String>,
}

/// Result of registering a push subscription.
#[derive(Debug, Clone)]
pub struct WatchRegistration {
    pub expires_at: DateTime<Utc>,
    pub history_id: Option<String>,
}

/// Errors surfaced by mailbox provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The start cursor is unknown to the provider (expired or never valid).
    #[error("change cursor is no longer valid")]
    CursorExpired,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned status {status}")]
    Api { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A call failed after the access token had already been refreshed.
    #[error("{source}")]
    AfterRefresh {
        refresh: RefreshResult,
        #[source]
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Attach a refresh obtained before this failure so the caller can still apply it.
    pub fn after_refresh(self, refresh: Option<RefreshResult>) -> ProviderError {
        let Some(refresh) = refresh else {
            return self;
        };
        match self {
            ProviderError::AfterRefresh {
                refresh: later,
                source,
            } => ProviderError::AfterRefresh {
                refresh: refresh.superseded_by(later),
                source,
            },
            other => ProviderError::AfterRefresh {
                refresh,
                source: Box::new(other),
            },
        }
    }

    /// Split into the underlying failure and any refresh obtained before it.
    pub fn into_parts(self) -> (ProviderError, Option<RefreshResult>) {
        match self {
            ProviderError::AfterRefresh { refresh, source } => (*source, Some(refresh)),
            other => (other, None),
        }
    }
}

/// Narrow view of the mailbox REST API used by this service.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Keyword search returning message ids, at most `max_results`.
    async fn search(
        &self,
        credential: &MailboxCredential,
        query: &str,
        max_results: u32,
    ) -> Result<Refreshed<Vec<String>>, ProviderError>;

    /// Fetch a full message tree.
    async fn get_message(
        &self,
        credential: &MailboxCredential,
        message_id: &str,
    ) -> Result<Refreshed<MailMessage>, ProviderError>;

    /// Cheap metadata-only fetch used to learn the current cursor value.
    async fn message_cursor(
        &self,
        credential: &MailboxCredential,
        message_id: &str,
    ) -> Result<Refreshed<Option<String>>, ProviderError>;

    /// Replay "message added" events since `start_history_id`.
    ///
    /// Returns [`ProviderError::CursorExpired`] when the provider no longer knows the cursor.
    async fn changes_since(
        &self,
        credential: &MailboxCredential,
        start_history_id: &str,
    ) -> Result<Refreshed<ChangeLog>, ProviderError>;

    /// Register a push subscription on the inbox for `topic`.
    async fn watch(
        &self,
        credential: &MailboxCredential,
        topic: &str,
    ) -> Result<Refreshed<WatchRegistration>, ProviderError>;

    /// Tear down the push subscription.
    async fn stop_watch(
        &self,
        credential: &MailboxCredential,
    ) -> Result<Refreshed<()>, ProviderError>;

    /// Revoke a token with the identity provider.
    async fn revoke(&self, token: &str) -> Result<(), ProviderError>;
}
