//! Test utilities for database testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations applied, plus clients pointed at a mock server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mailbox_sync::crypto::CryptoKey;
use mailbox_sync::ingestion::TrackableIngestionClient;
use mailbox_sync::mailbox::GmailClient;
use mailbox_sync::repositories::{MailboxAccountRepository, MailboxStore, NewMailboxAccount};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use uuid::Uuid;
use wiremock::MockServer;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Fixed 32-byte key for credential encryption in tests.
pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![42u8; 32]).expect("32-byte key")
}

/// Repository over a fresh in-memory database.
#[allow(dead_code)]
pub async fn test_repository() -> Result<Arc<MailboxAccountRepository>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(MailboxAccountRepository::new(
        Arc::new(db),
        test_crypto_key(),
    )))
}

/// Gmail client whose API, token and revoke endpoints live on `server`.
#[allow(dead_code)]
pub fn gmail_client(server: &MockServer) -> GmailClient {
    GmailClient::new(
        "test-client-id".to_string(),
        "test-client-secret".to_string(),
        format!("{}/gmail/v1/users", server.uri()),
        format!("{}/token", server.uri()),
        format!("{}/revoke", server.uri()),
        Duration::from_secs(5),
    )
    .expect("gmail client")
}

/// Ingestion client posting to `server`.
#[allow(dead_code)]
pub fn ingestion_client(server: &MockServer) -> TrackableIngestionClient {
    TrackableIngestionClient::new(server.uri(), Duration::from_secs(5))
        .expect("ingestion client")
}

/// Connects a mailbox with a long-lived access token and returns its user.
#[allow(dead_code)]
pub async fn connect_mailbox(store: &dyn MailboxStore, email: &str) -> Result<Uuid> {
    let user_id = Uuid::new_v4();
    store
        .upsert_account(NewMailboxAccount {
            user_id,
            email: email.to_string(),
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            scope: Some("https://www.googleapis.com/auth/gmail.readonly".to_string()),
        })
        .await?;
    Ok(user_id)
}
