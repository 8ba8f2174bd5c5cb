//! Storage traits and implementations
//!
//! Two backends implement [`ArchiveStore`]: an embedded ordered key-value
//! store (redb) and a relational store (SQLite). Which one a service uses is
//! decided once, from configuration.

mod persistent;
mod sqlite;
mod traits;

pub use persistent::RedbArchiveStore;
pub use sqlite::SqliteArchiveStore;
pub use traits::{ArchiveStore, SaveOutcome};
