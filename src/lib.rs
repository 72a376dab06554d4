//! # Mailbox Sync Library
//!
//! Pulls order emails out of connected mailboxes and hands them to the
//! ingestion service, either on demand or driven by push notifications. Also
//! proxies the agent chat stream.

pub mod auth;
pub mod chat;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ingestion;
pub mod mailbox;
pub mod models;
pub mod repositories;
pub mod server;
pub mod stream;
pub mod sync_engine;
pub mod telemetry;
pub mod watch;
pub mod webhook;
pub use migration;
