//! Domain model types used throughout TaskSync.
//!
//! These types bridge the sync engine, the database layer, and the action
//! layer that renders results to a user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// A synchronizable record kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Label,
    List,
    Task,
}

impl EntityType {
    /// Every entity type in dependency order: tasks reference labels and
    /// lists, so those are synced first.
    pub const SYNC_ORDER: [EntityType; 3] = [Self::Label, Self::List, Self::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::List => "list",
            Self::Task => "task",
        }
    }

    /// Parse the lowercase storage name.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "label" => Some(Self::Label),
            "list" => Some(Self::List),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Per-user sync state machine position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
}

impl SyncStatus {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "syncing" => Self::Syncing,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
        }
    }
}

/// A row from the `sync_state` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStateRecord {
    pub user_id: String,
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// What `get_status` reports to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub connected: bool,
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub unresolved_conflicts: i64,
}

impl StatusReport {
    /// Report for a user with no credential and no history.
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            status: SyncStatus::Idle,
            last_sync_at: None,
            last_error: None,
            unresolved_conflicts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Which side wins when a conflict is resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted divergence between the local and remote copy of one entity.
///
/// Payloads are canonical field documents (JSON, remote identifier space).
/// An empty payload means that side deleted the entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: String,
    pub user_id: String,
    pub entity_type: EntityType,
    pub local_id: String,
    pub remote_id: String,
    pub local_payload: String,
    pub remote_payload: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Short label for the kind of divergence.
    pub fn kind(&self) -> &'static str {
        match (self.local_payload.is_empty(), self.remote_payload.is_empty()) {
            (true, _) => "deleted_locally",
            (_, true) => "deleted_remotely",
            _ => "content",
        }
    }
}

// ---------------------------------------------------------------------------
// Sync results
// ---------------------------------------------------------------------------

/// Counters describing one sync pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub pulled_created: u32,
    pub pulled_updated: u32,
    pub pulled_deleted: u32,
    pub pushed_created: u32,
    pub pushed_updated: u32,
    pub pushed_deleted: u32,
    pub converged: u32,
    pub conflicts: u32,
    pub frozen: u32,
    pub failed: u32,
    pub completed_types: Vec<EntityType>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            pulled_created: 0,
            pulled_updated: 0,
            pulled_deleted: 0,
            pushed_created: 0,
            pushed_updated: 0,
            pushed_deleted: 0,
            converged: 0,
            conflicts: 0,
            frozen: 0,
            failed: 0,
            completed_types: Vec::new(),
            started_at,
            completed_at: None,
        }
    }

    pub fn pulled(&self) -> u32 {
        self.pulled_created + self.pulled_updated + self.pulled_deleted
    }

    pub fn pushed(&self) -> u32 {
        self.pushed_created + self.pushed_updated + self.pushed_deleted
    }

    /// Whether the pass wrote anything or found something needing attention.
    pub fn has_activity(&self) -> bool {
        self.pulled() + self.pushed() + self.converged + self.conflicts + self.failed > 0
    }
}

impl std::fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pulled {} (+{} ~{} -{}), pushed {} (+{} ~{} -{}), {} converged, {} conflicts, {} frozen, {} failed",
            self.pulled(),
            self.pulled_created,
            self.pulled_updated,
            self.pulled_deleted,
            self.pushed(),
            self.pushed_created,
            self.pushed_updated,
            self.pushed_deleted,
            self.converged,
            self.conflicts,
            self.frozen,
            self.failed,
        )
    }
}

/// What observers receive after a pass, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub summary: SyncSummary,
    pub error: Option<String>,
    pub requires_reconnect: bool,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Audit actions recorded per user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Connect,
    Disconnect,
    Rotate,
    Sync,
    ResolveConflict,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Rotate => "rotate",
            Self::Sync => "sync",
            Self::ResolveConflict => "resolve_conflict",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: String,
    pub action: String,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_round_trip_names() {
        for t in EntityType::SYNC_ORDER {
            assert_eq!(EntityType::from_str_val(t.as_str()), Some(t));
        }
        assert_eq!(EntityType::from_str_val("project"), None);
        assert_eq!(
            EntityType::SYNC_ORDER.last().copied(),
            Some(EntityType::Task)
        );
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::from_str_val("local"), Some(Resolution::Local));
        assert_eq!(Resolution::from_str_val("remote"), Some(Resolution::Remote));
        assert_eq!(Resolution::from_str_val("both"), None);
    }

    #[test]
    fn test_summary_activity() {
        let mut summary = SyncSummary::new(Utc::now());
        assert!(!summary.has_activity());
        summary.frozen = 2;
        assert!(!summary.has_activity());
        summary.pushed_updated = 1;
        assert!(summary.has_activity());
        assert_eq!(summary.pushed(), 1);
        assert!(summary.to_string().contains("pushed 1"));
    }

    #[test]
    fn test_conflict_kind() {
        let mut record = ConflictRecord {
            id: "c1".into(),
            user_id: "u1".into(),
            entity_type: EntityType::Task,
            local_id: "5".into(),
            remote_id: "T1".into(),
            local_payload: r#"{"title":"a"}"#.into(),
            remote_payload: r#"{"title":"b"}"#.into(),
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        assert_eq!(record.kind(), "content");
        record.remote_payload.clear();
        assert_eq!(record.kind(), "deleted_remotely");
        assert!(!record.is_resolved());
    }
}
