//! Durable local store for the agent.
//!
//! Two logical tables live in one SQLite file:
//! - `api_cache`: request identity -> JSON payload + expiry (at most one row per key)
//! - `pending_mutations`: append-only outbox of writes awaiting delivery
//!
//! The store fails open: see [`LocalStore`] for the degraded-mode rules.

pub(crate) mod local;
mod storage;

pub use local::LocalStore;
pub use storage::{CacheEntry, NewMutation};

#[cfg(test)]
pub use storage::SqliteStorage;
