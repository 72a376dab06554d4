//! Mailbox account repository
//!
//! SeaORM implementation of [`MailboxStore`]. Tokens are encrypted on the way in
//! and decrypted on the way out, so callers only ever see [`MailboxAccountRecord`].
//! Every mutation after creation is a single `UPDATE ... WHERE user_id = ?`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

use super::{MailboxAccountRecord, MailboxStore, NewMailboxAccount, StoreError};
use crate::crypto::{CryptoKey, decrypt_mailbox_tokens, encrypt_mailbox_tokens};
use crate::mailbox::{MailboxCredential, PushSubscription, RefreshResult, SyncCursor};
use crate::models::mailbox_account::{self, Entity as MailboxAccount};

/// Lower-case and trim an address for storage and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn to_utc(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

fn to_db(value: DateTime<Utc>) -> DateTimeWithTimeZone {
    value.into()
}

/// Repository for mailbox account rows
#[derive(Debug, Clone)]
pub struct MailboxAccountRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for token encryption
    pub crypto_key: CryptoKey,
}

impl MailboxAccountRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    fn to_record(&self, model: mailbox_account::Model) -> Result<MailboxAccountRecord, StoreError> {
        let (access_token, refresh_token) = decrypt_mailbox_tokens(&self.crypto_key, &model)
            .map_err(|e| {
                // Details stay out of the logs
                tracing::error!(user_id = %model.user_id, "Token decryption failed");
                StoreError::Crypto(e)
            })?;

        let watch = model.watch_expiration.map(|expires_at| PushSubscription {
            expires_at: to_utc(expires_at),
            subscription_token: model.watch_history_id.clone(),
        });

        Ok(MailboxAccountRecord {
            user_id: model.user_id,
            email: model.email,
            credential: MailboxCredential {
                access_token,
                refresh_token,
                expires_at: model.expires_at.map(to_utc),
            },
            scope: model.scope,
            cursor: SyncCursor {
                last_history_id: model.last_history_id,
                last_sync_at: model.last_sync_at.map(to_utc),
            },
            watch,
            updated_at: to_utc(model.updated_at),
        })
    }

    /// Apply a column update to one user's row, failing when the row is gone.
    async fn update_row(
        &self,
        user_id: Uuid,
        columns: Vec<(mailbox_account::Column, sea_orm::sea_query::SimpleExpr)>,
    ) -> Result<(), StoreError> {
        let mut update = MailboxAccount::update_many()
            .col_expr(
                mailbox_account::Column::UpdatedAt,
                Expr::value(to_db(Utc::now())),
            )
            .filter(mailbox_account::Column::UserId.eq(user_id));

        for (column, value) in columns {
            update = update.col_expr(column, value);
        }

        let result = update.exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(user_id));
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxStore for MailboxAccountRepository {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<MailboxAccountRecord>, StoreError> {
        MailboxAccount::find_by_id(user_id)
            .one(&*self.db)
            .await?
            .map(|model| self.to_record(model))
            .transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<MailboxAccountRecord>, StoreError> {
        MailboxAccount::find()
            .filter(mailbox_account::Column::Email.eq(normalize_email(email)))
            .one(&*self.db)
            .await?
            .map(|model| self.to_record(model))
            .transpose()
    }

    async fn upsert_account(
        &self,
        account: NewMailboxAccount,
    ) -> Result<MailboxAccountRecord, StoreError> {
        let email = normalize_email(&account.email);
        let (access_ciphertext, refresh_ciphertext) = encrypt_mailbox_tokens(
            &self.crypto_key,
            &account.user_id,
            &email,
            &account.access_token,
            account.refresh_token.as_deref(),
        )?;

        let now = to_db(Utc::now());
        let existing = MailboxAccount::find_by_id(account.user_id)
            .one(&*self.db)
            .await?;

        match existing {
            Some(model) => {
                let mailbox_changed = model.email != email;
                // Stored ciphertext is sealed to the old address and cannot follow a new one.
                let refresh_ciphertext = match refresh_ciphertext {
                    Some(ciphertext) => Some(ciphertext),
                    None if !mailbox_changed => model.refresh_token_ciphertext.clone(),
                    None => None,
                };

                let mut active: mailbox_account::ActiveModel = model.into();
                active.email = Set(email);
                active.access_token_ciphertext = Set(access_ciphertext);
                active.refresh_token_ciphertext = Set(refresh_ciphertext);
                active.expires_at = Set(account.expires_at.map(to_db));
                active.scope = Set(account.scope);
                active.updated_at = Set(now);

                // A different mailbox invalidates the cursor and the subscription.
                if mailbox_changed {
                    active.last_history_id = Set(None);
                    active.last_sync_at = Set(None);
                    active.watch_expiration = Set(None);
                    active.watch_history_id = Set(None);
                }

                active.update(&*self.db).await?;
            }
            None => {
                let active = mailbox_account::ActiveModel {
                    user_id: Set(account.user_id),
                    email: Set(email),
                    access_token_ciphertext: Set(access_ciphertext),
                    refresh_token_ciphertext: Set(refresh_ciphertext),
                    expires_at: Set(account.expires_at.map(to_db)),
                    scope: Set(account.scope),
                    last_history_id: Set(None),
                    last_sync_at: Set(None),
                    watch_expiration: Set(None),
                    watch_history_id: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                MailboxAccount::insert(active).exec(&*self.db).await?;
            }
        }

        // Query back directly; SQLite cannot return rows from upserts here.
        let stored = MailboxAccount::find_by_id(account.user_id)
            .one(&*self.db)
            .await?
            .ok_or(StoreError::NotFound(account.user_id))?;
        self.to_record(stored)
    }

    async fn apply_refresh(
        &self,
        user_id: Uuid,
        email: &str,
        refresh: &RefreshResult,
    ) -> Result<(), StoreError> {
        let (access_ciphertext, refresh_ciphertext) = encrypt_mailbox_tokens(
            &self.crypto_key,
            &user_id,
            &normalize_email(email),
            &refresh.access_token,
            refresh.refresh_token.as_deref(),
        )?;

        let mut columns = vec![
            (
                mailbox_account::Column::AccessTokenCiphertext,
                Expr::value(access_ciphertext),
            ),
            (
                mailbox_account::Column::ExpiresAt,
                Expr::value(refresh.expires_at.map(to_db)),
            ),
        ];
        if let Some(ciphertext) = refresh_ciphertext {
            columns.push((
                mailbox_account::Column::RefreshTokenCiphertext,
                Expr::value(ciphertext),
            ));
        }

        self.update_row(user_id, columns).await?;
        tracing::debug!(user_id = %user_id, "Persisted refreshed mailbox credential");
        Ok(())
    }

    async fn record_sync(
        &self,
        user_id: Uuid,
        cursor: Option<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_row(
            user_id,
            vec![
                (mailbox_account::Column::LastHistoryId, Expr::value(cursor)),
                (
                    mailbox_account::Column::LastSyncAt,
                    Expr::value(to_db(synced_at)),
                ),
            ],
        )
        .await
    }

    async fn update_cursor(&self, user_id: Uuid, cursor: Option<String>) -> Result<(), StoreError> {
        self.update_row(
            user_id,
            vec![(mailbox_account::Column::LastHistoryId, Expr::value(cursor))],
        )
        .await
    }

    async fn set_watch(
        &self,
        user_id: Uuid,
        subscription: &PushSubscription,
    ) -> Result<(), StoreError> {
        self.update_row(
            user_id,
            vec![
                (
                    mailbox_account::Column::WatchExpiration,
                    Expr::value(to_db(subscription.expires_at)),
                ),
                (
                    mailbox_account::Column::WatchHistoryId,
                    Expr::value(subscription.subscription_token.clone()),
                ),
            ],
        )
        .await
    }

    async fn clear_watch(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.update_row(
            user_id,
            vec![
                (
                    mailbox_account::Column::WatchExpiration,
                    Expr::value(Option::<DateTimeWithTimeZone>::None),
                ),
                (
                    mailbox_account::Column::WatchHistoryId,
                    Expr::value(Option::<String>::None),
                ),
            ],
        )
        .await
    }

    async fn delete_account(&self, user_id: Uuid) -> Result<bool, StoreError> {
        let result = MailboxAccount::delete_by_id(user_id)
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
