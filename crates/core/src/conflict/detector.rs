//! Three-way change classification.
//!
//! Each side of a mapped entity is compared with the hash recorded at the
//! last successful sync. The pair of outcomes decides what the orchestrator
//! does with the entity.

use serde::{Deserialize, Serialize};

/// How one side of an entity moved since the last sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChange {
    Unchanged,
    /// Content differs from the base; carries the current hash.
    Changed(String),
    Deleted,
}

impl SideChange {
    /// Compare a current hash (`None` if the entity is gone) with the base.
    pub fn classify(current: Option<&str>, base: &str) -> Self {
        match current {
            None => Self::Deleted,
            Some(hash) if hash == base => Self::Unchanged,
            Some(hash) => Self::Changed(hash.to_string()),
        }
    }
}

/// Categorisation of a divergence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides edited the entity to different content.
    Content,
    /// The local copy was deleted while the remote one was edited.
    DeletedLocally,
    /// The remote copy was deleted while the local one was edited.
    DeletedRemotely,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::DeletedLocally => write!(f, "deleted_locally"),
            Self::DeletedRemotely => write!(f, "deleted_remotely"),
        }
    }
}

/// What the orchestrator does with one mapped entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Noop,
    /// Apply remote content locally.
    Pull,
    /// Push local content to the remote.
    Push,
    /// Both sides reached the same content independently; record hashes.
    Converged,
    Conflict(ConflictType),
    /// Local tombstone: delete the remote copy.
    DeleteRemote,
    /// Remote tombstone: delete the local copy.
    DeleteLocal,
    /// Gone on both sides: drop the mapping.
    Forget,
}

/// Decide the action for an entity from the change on each side.
pub fn decide(local: &SideChange, remote: &SideChange) -> SyncAction {
    use SideChange::*;
    match (local, remote) {
        (Unchanged, Unchanged) => SyncAction::Noop,
        (Unchanged, Changed(_)) => SyncAction::Pull,
        (Changed(_), Unchanged) => SyncAction::Push,
        (Changed(l), Changed(r)) if l == r => SyncAction::Converged,
        (Changed(_), Changed(_)) => SyncAction::Conflict(ConflictType::Content),
        (Deleted, Unchanged) => SyncAction::DeleteRemote,
        (Unchanged, Deleted) => SyncAction::DeleteLocal,
        (Deleted, Deleted) => SyncAction::Forget,
        (Deleted, Changed(_)) => SyncAction::Conflict(ConflictType::DeletedLocally),
        (Changed(_), Deleted) => SyncAction::Conflict(ConflictType::DeletedRemotely),
    }
}
