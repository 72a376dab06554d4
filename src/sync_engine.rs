//! # Mailbox sync engine
//!
//! Chooses one of three retrieval strategies per call and writes the resulting
//! cursor back to the [`MailboxStore`]:
//!
//! * **Full**: keyword search, used when forced or when no cursor is stored.
//! * **Incremental**: replay of the provider change log from the stored cursor.
//! * **DateBounded**: keyword search limited to messages after the last sync,
//!   used when the provider reports the stored cursor as expired.
//!
//! Messages are fetched and ingested one at a time. A failure on one message is
//! recorded in its result slot and the batch moves on.
//!
//! Syncs for the same user are serialised through [`SyncLeases`], shared with the
//! webhook path, so a manual refresh and a push delivery cannot race on the cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::ingestion::{EmailIngestionClient, IngestEmailRequest};
use crate::mailbox::{
    MailboxCredential, MailboxProvider, MessageBodyExtractor, ProviderError, Refreshed,
    SyncCursor,
};
use crate::repositories::{MailboxAccountRecord, MailboxStore, StoreError};

/// Order-indicative phrases used by the keyword search.
pub const ORDER_KEYWORDS: &[&str] = &[
    "order confirmation",
    "your order",
    "order receipt",
    "purchase confirmation",
    "shipping confirmation",
    "has shipped",
    "order #",
    "tracking number",
];

/// Provider ceiling for a single search page.
pub const MAX_RESULTS_LIMIT: u32 = 500;

/// Each phrase quoted, joined with ` OR `.
pub fn build_keyword_query() -> String {
    ORDER_KEYWORDS
        .iter()
        .map(|keyword| format!("\"{}\"", keyword))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// `YYYY/MM/DD` in UTC, as the provider's `after:` operator expects.
pub fn format_gmail_date(date: DateTime<Utc>) -> String {
    date.format("%Y/%m/%d").to_string()
}

/// Keyword query restricted to messages after `since`.
pub fn build_date_bounded_query(since: DateTime<Utc>) -> String {
    format!("({}) after:{}", build_keyword_query(), format_gmail_date(since))
}

/// Numeric cursor comparison. Non-numeric cursors never compare as newer.
pub fn cursor_is_newer(candidate: &str, current: &str) -> bool {
    match (candidate.trim().parse::<u128>(), current.trim().parse::<u128>()) {
        (Ok(candidate), Ok(current)) => candidate > current,
        _ => false,
    }
}

/// Retrieval strategy used by one sync call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum SyncStrategy {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "partial")]
    Incremental,
    #[serde(rename = "date-filtered")]
    DateBounded,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Full => "full",
            SyncStrategy::Incremental => "partial",
            SyncStrategy::DateBounded => "date-filtered",
        }
    }
}

/// Caller-supplied knobs for one sync call.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_results: u32,
    pub force_full_sync: bool,
    pub deadline: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_results: 50,
            force_full_sync: false,
            deadline: None,
        }
    }
}

/// Outcome for a single candidate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResult {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    /// False when the message could not be fetched.
    pub fetched: bool,
    pub ingestion_succeeded: bool,
    pub error: Option<String>,
}

impl MessageResult {
    fn fetch_failed(id: &str, error: &ProviderError) -> Self {
        Self {
            id: id.to_string(),
            subject: String::new(),
            from: String::new(),
            date: None,
            snippet: None,
            fetched: false,
            ingestion_succeeded: false,
            error: Some(format!("Failed to fetch message: {}", error)),
        }
    }
}

/// Result of one sync invocation.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub strategy: SyncStrategy,
    /// Messages fetched and handed to ingestion.
    pub processed_count: usize,
    /// Number of candidate ids the strategy produced.
    pub candidate_count: usize,
    pub new_cursor: Option<String>,
    pub per_message_results: Vec<MessageResult>,
}

/// Connection and cursor summary for a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub connected: bool,
    pub email: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
    pub has_cursor: bool,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mailbox is not connected")]
    NotConnected,

    #[error("sync deadline exceeded after {processed} of {total} messages")]
    DeadlineExceeded { processed: usize, total: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, SyncError::Provider(ProviderError::CursorExpired))
    }
}

/// Per-user mutual exclusion for cursor-writing work.
#[derive(Debug, Clone, Default)]
pub struct SyncLeases {
    inner: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Held for the duration of one user's sync or webhook application.
#[derive(Debug)]
pub struct SyncLease {
    _guard: OwnedMutexGuard<()>,
}

impl SyncLeases {
    pub async fn acquire(&self, user_id: Uuid) -> SyncLease {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody else is holding or waiting on.
            locks.retain(|id, lock| *id == user_id || Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(user_id).or_default())
        };

        SyncLease {
            _guard: lock.lock_owned().await,
        }
    }
}

/// Working credential for one invocation; refreshes are applied here and persisted.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub user_id: Uuid,
    pub email: String,
    pub credential: MailboxCredential,
}

impl SyncSession {
    /// Apply and persist any refresh a provider call obtained, whether it succeeded or not.
    pub async fn settle<T>(
        &mut self,
        store: &dyn MailboxStore,
        result: Result<Refreshed<T>, ProviderError>,
    ) -> Result<Result<T, ProviderError>, StoreError> {
        let (result, refresh) = match result {
            Ok(refreshed) => {
                let (value, refresh) = refreshed.unpack(&mut self.credential);
                (Ok(value), refresh)
            }
            Err(err) => {
                let (err, refresh) = err.into_parts();
                if let Some(refresh) = &refresh {
                    self.credential.apply(refresh);
                }
                (Err(err), refresh)
            }
        };

        if let Some(refresh) = refresh {
            store
                .apply_refresh(self.user_id, &self.email, &refresh)
                .await?;
        }
        Ok(result)
    }

    /// [`SyncSession::settle`] with both failure kinds folded into the caller's error.
    pub async fn absorb<T, E>(
        &mut self,
        store: &dyn MailboxStore,
        result: Result<Refreshed<T>, ProviderError>,
    ) -> Result<T, E>
    where
        E: From<ProviderError> + From<StoreError>,
    {
        Ok(self.settle(store, result).await??)
    }
}

impl From<&MailboxAccountRecord> for SyncSession {
    fn from(record: &MailboxAccountRecord) -> Self {
        Self {
            user_id: record.user_id,
            email: record.email.clone(),
            credential: record.credential.clone(),
        }
    }
}

/// What a sync had established when its deadline fired.
#[derive(Debug, Default)]
struct Progress {
    candidates: usize,
    attempted: usize,
    /// Set once the strategy has produced its new cursor.
    derived_cursor: Option<Option<String>>,
    cursor_expired: bool,
}

/// Runs mailbox syncs against a provider, a store and an ingestion client.
pub struct MailboxSyncEngine {
    store: Arc<dyn MailboxStore>,
    provider: Arc<dyn MailboxProvider>,
    ingestion: Arc<dyn EmailIngestionClient>,
    extractor: MessageBodyExtractor,
    leases: SyncLeases,
}

impl MailboxSyncEngine {
    pub fn new(
        store: Arc<dyn MailboxStore>,
        provider: Arc<dyn MailboxProvider>,
        ingestion: Arc<dyn EmailIngestionClient>,
        leases: SyncLeases,
    ) -> Self {
        Self {
            store,
            provider,
            ingestion,
            extractor: MessageBodyExtractor::default(),
            leases,
        }
    }

    pub fn leases(&self) -> &SyncLeases {
        &self.leases
    }

    /// Run one sync for `user_id`, choosing the strategy from the stored cursor.
    pub async fn sync(&self, user_id: Uuid, options: SyncOptions) -> Result<SyncOutcome, SyncError> {
        let _lease = self.leases.acquire(user_id).await;

        let record = self
            .store
            .find_by_user(user_id)
            .await?
            .ok_or(SyncError::NotConnected)?;

        let mut session = SyncSession::from(&record);
        let mut progress = Progress::default();

        let result = match options.deadline {
            Some(deadline) => {
                let run = self.run_sync(&mut session, &record.cursor, &options, &mut progress);
                match tokio::time::timeout(deadline, run).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.persist_after_deadline(user_id, &progress).await;
                        Err(SyncError::DeadlineExceeded {
                            processed: progress.attempted,
                            total: progress.candidates,
                        })
                    }
                }
            }
            None => {
                self.run_sync(&mut session, &record.cursor, &options, &mut progress)
                    .await
            }
        };

        match &result {
            Ok(outcome) => {
                metrics::counter!(
                    "mailbox_sync_total",
                    "strategy" => outcome.strategy.as_str(),
                    "outcome" => "ok"
                )
                .increment(1);
                metrics::counter!("mailbox_sync_messages_total")
                    .increment(outcome.processed_count as u64);
                tracing::info!(
                    user_id = %user_id,
                    strategy = outcome.strategy.as_str(),
                    processed = outcome.processed_count,
                    candidates = outcome.candidate_count,
                    has_cursor = outcome.new_cursor.is_some(),
                    "Mailbox sync completed"
                );
            }
            Err(err) => {
                metrics::counter!("mailbox_sync_total", "outcome" => "error").increment(1);
                tracing::warn!(user_id = %user_id, error = %err, "Mailbox sync failed");
            }
        }

        result
    }

    async fn run_sync(
        &self,
        session: &mut SyncSession,
        cursor: &SyncCursor,
        options: &SyncOptions,
        progress: &mut Progress,
    ) -> Result<SyncOutcome, SyncError> {
        let max_results = options.max_results.clamp(1, MAX_RESULTS_LIMIT);
        let stored_cursor = cursor
            .last_history_id
            .as_deref()
            .filter(|_| !options.force_full_sync);

        let outcome = match stored_cursor {
            None => {
                tracing::debug!(user_id = %session.user_id, "Performing full sync");
                self.run_search(
                    session,
                    SyncStrategy::Full,
                    &build_keyword_query(),
                    max_results,
                    progress,
                )
                .await?
            }
            Some(start) => match self.incremental(session, start, progress).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_cursor_expired() => {
                    progress.cursor_expired = true;
                    match cursor.last_sync_at {
                        Some(since) => {
                            tracing::info!(
                                user_id = %session.user_id,
                                since = %since,
                                "History expired, falling back to date-bounded sync"
                            );
                            self.run_search(
                                session,
                                SyncStrategy::DateBounded,
                                &build_date_bounded_query(since),
                                max_results,
                                progress,
                            )
                            .await?
                        }
                        None => {
                            tracing::info!(
                                user_id = %session.user_id,
                                "History expired and no previous sync time, doing full sync"
                            );
                            self.run_search(
                                session,
                                SyncStrategy::Full,
                                &build_keyword_query(),
                                max_results,
                                progress,
                            )
                            .await?
                        }
                    }
                }
                Err(err) => return Err(err),
            },
        };

        self.store
            .record_sync(session.user_id, outcome.new_cursor.clone(), Utc::now())
            .await?;

        Ok(outcome)
    }

    async fn run_search(
        &self,
        session: &mut SyncSession,
        strategy: SyncStrategy,
        query: &str,
        max_results: u32,
        progress: &mut Progress,
    ) -> Result<SyncOutcome, SyncError> {
        let searched = self
            .provider
            .search(&session.credential, query, max_results)
            .await;
        let message_ids = self.absorb(session, searched).await?;

        // The newest hit tells us where the change log currently stands.
        let new_cursor = match message_ids.first() {
            Some(first) => {
                let fetched = self
                    .provider
                    .message_cursor(&session.credential, first)
                    .await;
                self.absorb(session, fetched).await?
            }
            None => None,
        };

        progress.candidates = message_ids.len();
        progress.derived_cursor = Some(new_cursor.clone());

        let results = self.process_batch(session, &message_ids, progress).await?;
        Ok(Self::outcome(strategy, message_ids.len(), new_cursor, results))
    }

    async fn incremental(
        &self,
        session: &mut SyncSession,
        start_cursor: &str,
        progress: &mut Progress,
    ) -> Result<SyncOutcome, SyncError> {
        let changes = self
            .provider
            .changes_since(&session.credential, start_cursor)
            .await;
        let changes = self.absorb(session, changes).await?;

        // Never move the cursor backwards, and keep it when the provider omits one.
        let new_cursor = match changes.history_id {
            Some(reported) if cursor_is_newer(&reported, start_cursor) => Some(reported),
            _ => Some(start_cursor.to_string()),
        };

        progress.candidates = changes.message_ids.len();
        progress.derived_cursor = Some(new_cursor.clone());

        let results = self
            .process_batch(session, &changes.message_ids, progress)
            .await?;
        Ok(Self::outcome(
            SyncStrategy::Incremental,
            changes.message_ids.len(),
            new_cursor,
            results,
        ))
    }

    /// Incremental replay and ingestion without touching the stored cursor.
    ///
    /// Callers must hold the user's [`SyncLease`]. Cursor expiry surfaces as an error
    /// for which [`SyncError::is_cursor_expired`] is true.
    pub async fn run_incremental(
        &self,
        session: &mut SyncSession,
        start_cursor: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let mut progress = Progress::default();
        self.incremental(session, start_cursor, &mut progress).await
    }

    async fn process_batch(
        &self,
        session: &mut SyncSession,
        message_ids: &[String],
        progress: &mut Progress,
    ) -> Result<Vec<MessageResult>, SyncError> {
        let mut results = Vec::with_capacity(message_ids.len());

        for message_id in message_ids {
            let fetched = self
                .provider
                .get_message(&session.credential, message_id)
                .await;
            let fetched = match session.settle(self.store.as_ref(), fetched).await? {
                Ok(fetched) => fetched,
                // Losing the credential stops the whole batch.
                Err(
                    err @ (ProviderError::Unauthorized(_)
                    | ProviderError::TokenRefresh(_)
                    | ProviderError::Configuration(_)),
                ) => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(
                        user_id = %session.user_id,
                        message_id = %message_id,
                        error = %err,
                        "Failed to fetch message"
                    );
                    results.push(MessageResult::fetch_failed(message_id, &err));
                    progress.attempted += 1;
                    continue;
                }
            };

            let subject = fetched.header("subject").unwrap_or_default().to_string();
            let from = fetched.header("from").unwrap_or_default().to_string();
            let body = self.extractor.extract(&fetched.payload);

            let ingestion = self
                .ingestion
                .ingest(
                    session.user_id,
                    IngestEmailRequest {
                        email_content: body,
                        email_subject: Some(subject.clone()),
                        email_from: Some(from.clone()),
                    },
                )
                .await;

            if !ingestion.success {
                tracing::warn!(
                    user_id = %session.user_id,
                    message_id = %fetched.id,
                    error = ?ingestion.error,
                    "Ingestion failed for message"
                );
            }

            results.push(MessageResult {
                id: fetched.id,
                subject,
                from,
                date: fetched.internal_date,
                snippet: fetched.snippet,
                fetched: true,
                ingestion_succeeded: ingestion.success,
                error: ingestion.error,
            });
            progress.attempted += 1;
        }

        Ok(results)
    }

    fn outcome(
        strategy: SyncStrategy,
        candidate_count: usize,
        new_cursor: Option<String>,
        per_message_results: Vec<MessageResult>,
    ) -> SyncOutcome {
        SyncOutcome {
            strategy,
            processed_count: per_message_results.iter().filter(|r| r.fetched).count(),
            candidate_count,
            new_cursor,
            per_message_results,
        }
    }

    async fn absorb<T>(
        &self,
        session: &mut SyncSession,
        result: Result<Refreshed<T>, ProviderError>,
    ) -> Result<T, SyncError> {
        session.absorb(self.store.as_ref(), result).await
    }

    async fn persist_after_deadline(&self, user_id: Uuid, progress: &Progress) {
        let outcome = match &progress.derived_cursor {
            Some(cursor) if progress.attempted >= progress.candidates => {
                self.store
                    .record_sync(user_id, cursor.clone(), Utc::now())
                    .await
            }
            _ if progress.cursor_expired => self.store.update_cursor(user_id, None).await,
            _ => Ok(()),
        };

        tracing::warn!(
            user_id = %user_id,
            attempted = progress.attempted,
            candidates = progress.candidates,
            cursor_expired = progress.cursor_expired,
            "Mailbox sync deadline exceeded"
        );

        if let Err(err) = outcome {
            tracing::error!(user_id = %user_id, error = %err, "Failed to persist state after deadline");
        }
    }

    /// Connection and cursor summary; no provider call.
    pub async fn status(&self, user_id: Uuid) -> Result<SyncStatus, SyncError> {
        Ok(match self.store.find_by_user(user_id).await? {
            Some(record) => SyncStatus {
                connected: true,
                email: Some(record.email),
                last_synced: record.cursor.last_sync_at.or(Some(record.updated_at)),
                has_cursor: record.cursor.last_history_id.is_some(),
            },
            None => SyncStatus {
                connected: false,
                email: None,
                last_synced: None,
                has_cursor: false,
            },
        })
    }
}
