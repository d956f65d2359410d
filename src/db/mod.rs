//! Database module.
//!
//! Provides SQLite storage for monitor definitions, status, the check log
//! and the incident ledger, with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
