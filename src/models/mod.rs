//! # Data Models
//!
//! Persistence entities and shared response types for the mailbox sync API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod mailbox_account;

pub use mailbox_account::Entity as MailboxAccount;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "mailbox-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
