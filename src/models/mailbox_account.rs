//! Mailbox account entity model
//!
//! One row per user holding the encrypted mailbox credential, the incremental
//! sync cursor and the push subscription bookkeeping.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "mailbox_accounts")]
pub struct Model {
    /// Owning user (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: Uuid,

    /// Mailbox address, stored lower-cased
    #[sea_orm(unique)]
    pub email: String,

    /// Encrypted access token
    pub access_token_ciphertext: Vec<u8>,

    /// Encrypted refresh token
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry
    pub expires_at: Option<DateTimeWithTimeZone>,

    /// Granted OAuth scope string
    pub scope: Option<String>,

    /// Provider change cursor (history id) from the last completed sync
    pub last_history_id: Option<String>,

    /// When the last sync completed
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// Push subscription expiry
    pub watch_expiration: Option<DateTimeWithTimeZone>,

    /// History id reported when the push subscription was established
    pub watch_history_id: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
