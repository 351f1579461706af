//! TaskSync core library.
//!
//! This crate provides the foundational components for keeping a personal
//! task/list/label store in sync with an external task provider:
//! configuration, database persistence, the encrypted credential vault,
//! identity mapping, conflict detection and resolution, the provider and
//! local-store seams, and the sync engine.

pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod fields;
pub mod local;
pub mod locks;
pub mod mapping;
pub mod models;
pub mod notify;
pub mod remote;
pub mod service;
pub mod sync_engine;
pub mod vault;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use errors::{ActionError, ActionErrorKind};
pub use service::SyncService;
pub use sync_engine::{SyncContext, SyncEngine};
pub use vault::CredentialVault;
