//! Scoped local state store for per-user, per-venue diagnostic data.
//!
//! Everything is persisted as string values under namespaced keys in an
//! async [`KvStore`]. Higher layers never see storage or parse failures on
//! reads; a caller with no cached state falls back to defaults.

mod error;
mod kv;
mod migrations;
mod user_data;
mod venue;

pub use error::StoreError;
pub use kv::{KvStore, MemoryKvStore, SqliteKvStore};
pub use migrations::{
    all_migrations, MigrationDescriptor, MigrationOutcome, MigrationRunner, MigrationTarget,
};
pub use user_data::UserDataStore;
pub use venue::VenueSelector;
