//! Migration to create the mailbox_accounts table.
//!
//! One row per user: encrypted mailbox credentials, the incremental sync cursor
//! and the push subscription bookkeeping.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MailboxAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MailboxAccounts::UserId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MailboxAccounts::Email).text().not_null())
                    .col(
                        ColumnDef::new(MailboxAccounts::AccessTokenCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MailboxAccounts::RefreshTokenCiphertext)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MailboxAccounts::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(MailboxAccounts::Scope).text().null())
                    .col(ColumnDef::new(MailboxAccounts::LastHistoryId).text().null())
                    .col(
                        ColumnDef::new(MailboxAccounts::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MailboxAccounts::WatchExpiration)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(MailboxAccounts::WatchHistoryId).text().null())
                    .col(
                        ColumnDef::new(MailboxAccounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(MailboxAccounts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Webhook lookups resolve the user from the lower-cased address
        manager
            .create_index(
                Index::create()
                    .name("idx_mailbox_accounts_email")
                    .table(MailboxAccounts::Table)
                    .col(MailboxAccounts::Email)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_mailbox_accounts_email").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(MailboxAccounts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MailboxAccounts {
    Table,
    UserId,
    Email,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    ExpiresAt,
    Scope,
    LastHistoryId,
    LastSyncAt,
    WatchExpiration,
    WatchHistoryId,
    CreatedAt,
    UpdatedAt,
}
