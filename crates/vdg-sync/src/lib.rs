//! Best-effort backup/restore against the remote sync service.
//!
//! Sync is advisory: every failure is logged and reported as `false`, never
//! surfaced as a hard error. App function does not depend on it.

mod boot;
mod client;

pub use boot::run_startup_tasks;
pub use client::{SyncClient, SyncConfig, SyncError, SYNC_COMPLETED_FLAG};
