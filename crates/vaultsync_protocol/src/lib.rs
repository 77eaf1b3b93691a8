//! # VaultSync Protocol
//!
//! Protocol types and pure algorithms for VaultSync.
//!
//! This crate provides:
//! - `Change` for journal and replication records
//! - `EntityRecord` and `Vault` domain views
//! - `SyncContext` for resumable per-session cursors
//! - Partial-modification merging for update changes
//! - Client/server version compatibility gating
//! - The daily-doc merge policy
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod context;
mod merge;
mod mods;
mod record;
mod version;

pub use change::{Change, ChangeKind, ChangeOrigin};
pub use context::SyncContext;
pub use merge::{merge_daily_docs, split_for_daily_merge, DailyDocMerge, DailySplit};
pub use mods::{apply_mods, merge_mods, unflatten};
pub use record::{EntityRecord, Vault, VaultKind};
pub use version::{check_compatibility, CompatibilityOutcome, ParseVersionError, Version};
