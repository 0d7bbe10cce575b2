//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Actor cache, follow relations, shares
//! - Inbox dedup ledger and delivery jobs

mod database;
mod models;

pub use database::{CANCELLED_REASON, Database, now_millis};
pub use models::*;
