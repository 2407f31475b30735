//! blockindex-storage: persistent [`IndexStore`] backends for BlockIndex.
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! The in-memory store lives in `blockindex_core::store::MemoryStore`.
//!
//! [`IndexStore`]: blockindex_core::IndexStore

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
