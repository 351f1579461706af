//! End-to-end tests for the sync service.
//!
//! These tests drive the real `SyncService` (vault, engine, resolver) with:
//! - an in-memory SQLite database
//! - the SQLite-backed local store
//! - the in-process `MemoryProvider` with failure injection
//!
//! No network I/O.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};

use tasksync_core::conflict::format_payload;
use tasksync_core::db::Database;
use tasksync_core::errors::{ActionError, ActionErrorKind, RemoteApiError};
use tasksync_core::local::{LocalEntity, LocalStore, SqliteLocalStore};
use tasksync_core::mapping::{Mapping, MappingStore};
use tasksync_core::models::{EntityType, SyncOutcome, SyncStatus};
use tasksync_core::notify::SyncObserver;
use tasksync_core::remote::memory::RemoteOp;
use tasksync_core::remote::{MemoryProvider, RemoteProvider, RetryPolicy};
use tasksync_core::vault::keyring::KeyRing;
use tasksync_core::vault::RotationOutcome;
use tasksync_core::{CredentialVault, SyncContext, SyncService};

// ===========================================================================
// Helpers
// ===========================================================================

const TOKEN: &str = "tok_123";
const ALICE: &str = "alice";
const KEY_A: [u8; 32] = [0xA1; 32];
const KEY_B: [u8; 32] = [0xB2; 32];

#[derive(Default)]
struct Recording(Mutex<Vec<(String, SyncOutcome)>>);

impl SyncObserver for Recording {
    fn on_sync_completed(&self, user_id: &str, outcome: &SyncOutcome) {
        self.0
            .lock()
            .unwrap()
            .push((user_id.to_string(), outcome.clone()));
    }
}

struct Harness {
    service: Arc<SyncService>,
    provider: Arc<MemoryProvider>,
    db: Arc<Database>,
    local: SqliteLocalStore,
    events: Arc<Recording>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn service_on(
    db: Arc<Database>,
    provider: Arc<MemoryProvider>,
    keys: KeyRing,
    events: Arc<Recording>,
) -> Arc<SyncService> {
    let vault = Arc::new(CredentialVault::new(db.clone(), keys, "remote"));
    let ctx = Arc::new(SyncContext::new(
        db,
        vault,
        provider,
        Arc::new(SqliteLocalStore::new()),
        fast_retry(),
    ));
    Arc::new(SyncService::new(ctx, events, true))
}

fn harness_with(keys: KeyRing) -> Harness {
    let db = Arc::new(Database::in_memory().unwrap());
    db.initialize().unwrap();
    let provider = Arc::new(MemoryProvider::new(TOKEN));
    let events = Arc::new(Recording::default());
    let service = service_on(db.clone(), provider.clone(), keys, events.clone());
    Harness {
        service,
        provider,
        db,
        local: SqliteLocalStore::new(),
        events,
    }
}

fn harness() -> Harness {
    harness_with(KeyRing::single("a", KEY_A))
}

fn doc(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

impl Harness {
    fn locals(&self, user: &str, entity_type: EntityType) -> Vec<LocalEntity> {
        let conn = self.db.conn();
        self.local.list(&conn, user, entity_type).unwrap()
    }

    fn create_local(&self, user: &str, entity_type: EntityType, fields: Value) -> String {
        let conn = self.db.conn();
        self.local
            .insert(&conn, user, entity_type, &doc(fields))
            .unwrap()
    }

    fn edit_local(&self, user: &str, entity_type: EntityType, id: &str, patch: Value) {
        let conn = self.db.conn();
        self.local
            .update(&conn, user, entity_type, id, &doc(patch))
            .unwrap();
    }

    fn delete_local(&self, user: &str, entity_type: EntityType, id: &str) {
        let conn = self.db.conn();
        assert!(self.local.soft_delete(&conn, user, entity_type, id).unwrap());
    }

    fn mapping(&self, user: &str, entity_type: EntityType, local_id: &str) -> Option<Mapping> {
        let conn = self.db.conn();
        MappingStore::new(&conn, user)
            .get(entity_type, local_id)
            .unwrap()
    }

    /// Connect alice and pull one remote task `T1`; returns its local id.
    async fn with_pulled_task(&self, title: &str) -> String {
        self.provider.insert_with_id(
            EntityType::Task,
            "T1",
            json!({"title": title, "description": "", "completed": false}),
        );
        self.service.connect(ALICE, TOKEN).await.unwrap();
        let summary = self.service.sync_now(ALICE).await.unwrap();
        assert_eq!(summary.pulled_created, 1);

        let tasks = self.locals(ALICE, EntityType::Task);
        assert_eq!(tasks.len(), 1);
        tasks[0].id.clone()
    }
}

// ===========================================================================
// Pull, push and convergence
// ===========================================================================

#[tokio::test]
async fn test_connect_and_pull_creates_local_task_and_mapping() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    let task = &h.locals(ALICE, EntityType::Task)[0];
    assert_eq!(task.fields["title"], "Write report");

    let mapping = h.mapping(ALICE, EntityType::Task, &local_id).unwrap();
    assert_eq!(mapping.remote_id, "T1");
    assert_eq!(mapping.last_local_hash, mapping.last_remote_hash);
    assert!(mapping.is_live());

    let status = h.service.get_status(ALICE).unwrap();
    assert!(status.connected);
    assert_eq!(status.status, SyncStatus::Idle);
    assert!(status.last_sync_at.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(status.unresolved_conflicts, 0);
}

#[tokio::test]
async fn test_second_pass_without_changes_is_a_noop() {
    let h = harness();
    h.with_pulled_task("Write report").await;

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert!(!summary.has_activity());
    assert_eq!(h.provider.calls(RemoteOp::Update), 0);
    assert_eq!(h.locals(ALICE, EntityType::Task).len(), 1);
}

#[tokio::test]
async fn test_remote_edit_is_pulled() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Write final report"}));
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pulled_updated, 1);

    let task = &h.locals(ALICE, EntityType::Task)[0];
    assert_eq!(task.id, local_id);
    assert_eq!(task.fields["title"], "Write final report");
}

#[tokio::test]
async fn test_local_entities_are_pushed_with_translated_references() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();

    let list_id = h.create_local(ALICE, EntityType::List, json!({"name": "Home", "color": "red"}));
    let task_id = h.create_local(
        ALICE,
        EntityType::Task,
        json!({"title": "Buy milk", "list_id": list_id, "xp": 10}),
    );

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pushed_created, 2);

    let list_mapping = h.mapping(ALICE, EntityType::List, &list_id).unwrap();
    let task_mapping = h.mapping(ALICE, EntityType::Task, &task_id).unwrap();

    let remote_list = h.provider.get(EntityType::List, &list_mapping.remote_id).unwrap();
    assert_eq!(remote_list["name"], "Home");

    let remote_task = h.provider.get(EntityType::Task, &task_mapping.remote_id).unwrap();
    assert_eq!(remote_task["title"], "Buy milk");
    assert_eq!(remote_task["list_id"], json!(list_mapping.remote_id));
    assert!(!remote_task.contains_key("xp"));

    let again = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(again.pushed(), 0);
    assert_eq!(again.pulled(), 0);
}

#[tokio::test]
async fn test_independent_identical_edits_converge() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    let before = h.mapping(ALICE, EntityType::Task, &local_id).unwrap();

    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Same"}));
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Same"}));

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.converged, 1);
    assert_eq!(summary.conflicts, 0);
    assert!(h.service.get_conflicts(ALICE).unwrap().is_empty());

    let after = h.mapping(ALICE, EntityType::Task, &local_id).unwrap();
    assert_ne!(after.last_local_hash, before.last_local_hash);
    assert_eq!(after.last_local_hash, after.last_remote_hash);
}

// ===========================================================================
// Conflicts
// ===========================================================================

#[tokio::test]
async fn test_divergent_edits_create_one_conflict_and_freeze_hashes() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    let before = h.mapping(ALICE, EntityType::Task, &local_id).unwrap();

    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Buy milk"}));
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Buy bread"}));

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.conflicts, 1);

    let conflicts = h.service.get_conflicts(ALICE).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.kind(), "content");
    assert_eq!(conflict.remote_id, "T1");
    assert_eq!(format_payload(&conflict.local_payload).title, "Buy milk");
    assert_eq!(format_payload(&conflict.remote_payload).title, "Buy bread");

    let after = h.mapping(ALICE, EntityType::Task, &local_id).unwrap();
    assert_eq!(after.last_local_hash, before.last_local_hash);
    assert_eq!(after.last_remote_hash, before.last_remote_hash);

    // Neither side was overwritten.
    assert_eq!(h.locals(ALICE, EntityType::Task)[0].fields["title"], "Buy milk");
    assert_eq!(h.provider.get(EntityType::Task, "T1").unwrap()["title"], "Buy bread");
    assert_eq!(h.service.get_status(ALICE).unwrap().unresolved_conflicts, 1);
}

#[tokio::test]
async fn test_frozen_entity_refreshes_conflict_payload() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Buy milk"}));
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Buy bread"}));
    h.service.sync_now(ALICE).await.unwrap();

    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Buy oat milk"}));
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.frozen, 1);
    assert_eq!(summary.conflicts, 0);
    assert_eq!(h.provider.calls(RemoteOp::Update), 0);

    let conflicts = h.service.get_conflicts(ALICE).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(format_payload(&conflicts[0].local_payload).title, "Buy oat milk");
    assert_eq!(format_payload(&conflicts[0].remote_payload).title, "Buy bread");
}

#[tokio::test]
async fn test_resolve_local_pushes_and_second_resolve_is_not_found() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Buy milk"}));
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Buy bread"}));
    h.service.sync_now(ALICE).await.unwrap();
    let conflict_id = h.service.get_conflicts(ALICE).unwrap()[0].id.clone();

    h.service
        .resolve_conflict(ALICE, &conflict_id, "local")
        .await
        .unwrap();
    assert_eq!(h.provider.get(EntityType::Task, "T1").unwrap()["title"], "Buy milk");
    assert!(h.service.get_conflicts(ALICE).unwrap().is_empty());

    let err = h
        .service
        .resolve_conflict(ALICE, &conflict_id, "local")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::NotFound);
    assert_eq!(h.provider.calls(RemoteOp::Update), 1);

    let resolved = h.service.get_conflict(ALICE, &conflict_id).unwrap();
    assert!(resolved.is_resolved());

    // Sides agree again: nothing left to do.
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert!(!summary.has_activity());
}

#[tokio::test]
async fn test_resolve_remote_applies_locally_without_remote_writes() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Buy milk"}));
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Buy bread"}));
    h.service.sync_now(ALICE).await.unwrap();
    let conflict_id = h.service.get_conflicts(ALICE).unwrap()[0].id.clone();

    h.service
        .resolve_conflict(ALICE, &conflict_id, "remote")
        .await
        .unwrap();
    assert_eq!(h.locals(ALICE, EntityType::Task)[0].fields["title"], "Buy bread");
    assert_eq!(h.provider.calls(RemoteOp::Update), 0);

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert!(!summary.has_activity());
}

#[tokio::test]
async fn test_invalid_resolution_is_a_validation_error() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    let err = h
        .service
        .resolve_conflict(ALICE, "whatever", "both")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::ValidationError);
}

// ===========================================================================
// Deletions
// ===========================================================================

#[tokio::test]
async fn test_local_delete_propagates_to_remote() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    h.delete_local(ALICE, EntityType::Task, &local_id);
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pushed_deleted, 1);

    assert!(h.provider.get(EntityType::Task, "T1").is_none());
    assert!(h.mapping(ALICE, EntityType::Task, &local_id).is_none());
    assert!(h.locals(ALICE, EntityType::Task).is_empty());
}

#[tokio::test]
async fn test_remote_delete_propagates_locally() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    assert!(h.provider.remove(EntityType::Task, "T1"));
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pulled_deleted, 1);

    assert!(h.locals(ALICE, EntityType::Task).is_empty());
    assert!(h.mapping(ALICE, EntityType::Task, &local_id).is_none());
}

#[tokio::test]
async fn test_full_fetch_treats_absence_as_deletion() {
    let h = harness();
    h.provider.set_delta_enabled(false);
    let local_id = h.with_pulled_task("Write report").await;

    assert!(h.provider.remove(EntityType::Task, "T1"));
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pulled_deleted, 1);
    assert!(h.mapping(ALICE, EntityType::Task, &local_id).is_none());
}

#[tokio::test]
async fn test_delete_vs_edit_conflict_resolved_remote_recreates_local() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    h.delete_local(ALICE, EntityType::Task, &local_id);
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Write the report today"}));

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.pushed_deleted, 0);

    let conflict = h.service.get_conflicts(ALICE).unwrap().remove(0);
    assert_eq!(conflict.kind(), "deleted_locally");
    assert!(conflict.local_payload.is_empty());
    assert_eq!(format_payload(&conflict.local_payload).title, "");
    assert!(h.provider.get(EntityType::Task, "T1").is_some());

    h.service
        .resolve_conflict(ALICE, &conflict.id, "remote")
        .await
        .unwrap();

    let tasks = h.locals(ALICE, EntityType::Task);
    assert_eq!(tasks.len(), 1);
    assert_ne!(tasks[0].id, local_id);
    assert!(!tasks[0].deleted);
    assert_eq!(tasks[0].fields["title"], "Write the report today");
    let mapping = h.mapping(ALICE, EntityType::Task, &tasks[0].id).unwrap();
    assert_eq!(mapping.remote_id, "T1");

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert!(!summary.has_activity());
}

#[tokio::test]
async fn test_edit_vs_remote_delete_resolved_local_recreates_remote() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Keep me"}));
    assert!(h.provider.remove(EntityType::Task, "T1"));

    h.service.sync_now(ALICE).await.unwrap();
    let conflict = h.service.get_conflicts(ALICE).unwrap().remove(0);
    assert_eq!(conflict.kind(), "deleted_remotely");

    h.service
        .resolve_conflict(ALICE, &conflict.id, "local")
        .await
        .unwrap();

    assert_eq!(h.provider.calls(RemoteOp::Create), 1);
    let mapping = h.mapping(ALICE, EntityType::Task, &local_id).unwrap();
    let remote = h.provider.get(EntityType::Task, &mapping.remote_id).unwrap();
    assert_eq!(remote["title"], "Keep me");

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.conflicts, 0);
    assert_eq!(summary.pushed(), 0);
}

// ===========================================================================
// Identity joins and cursors
// ===========================================================================

#[tokio::test]
async fn test_stable_key_joins_instead_of_duplicating() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    let local_id = h.create_local(ALICE, EntityType::Label, json!({"name": "urgent", "color": "red"}));

    // A previous pass created the remote copy but died before mapping it.
    let fields = doc(json!({"name": "urgent", "color": "red"}));
    let created = h
        .provider
        .create(TOKEN, EntityType::Label, &fields, &local_id)
        .await
        .unwrap();

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pushed_created, 0);
    assert_eq!(summary.pulled_created, 0);
    assert_eq!(h.provider.ids(EntityType::Label).len(), 1);
    assert_eq!(h.locals(ALICE, EntityType::Label).len(), 1);

    let mapping = h.mapping(ALICE, EntityType::Label, &local_id).unwrap();
    assert_eq!(mapping.remote_id, created.remote_id);
}

#[tokio::test]
async fn test_expired_cursor_falls_back_to_full_fetch() {
    let h = harness();
    h.with_pulled_task("Write report").await;

    h.provider.fail_next_with(
        RemoteOp::Fetch,
        Some(EntityType::Task),
        RemoteApiError::ApiError {
            status: 410,
            body: "cursor expired".into(),
        },
    );
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pulled(), 0);
    assert_eq!(summary.pulled_deleted, 0);
    assert_eq!(h.locals(ALICE, EntityType::Task).len(), 1);
}

// ===========================================================================
// Failure semantics
// ===========================================================================

#[tokio::test]
async fn test_unauthorized_aborts_without_retry() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    h.provider.revoke_token(TOKEN);

    let err = h.service.sync_now(ALICE).await.unwrap_err();
    match err {
        ActionError::RemoteApi {
            requires_reconnect,
            completed_types,
            ..
        } => {
            assert!(requires_reconnect);
            assert!(completed_types.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.provider.calls(RemoteOp::Fetch), 1);

    let status = h.service.get_status(ALICE).unwrap();
    assert_eq!(status.status, SyncStatus::Idle);
    assert!(status.last_error.is_some());
    assert!(status.last_sync_at.is_none());

    let events = h.events.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].1.is_success());
    assert!(events[0].1.requires_reconnect);
}

#[tokio::test]
async fn test_transient_fetch_failure_is_retried() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    h.provider.fail_next(RemoteOp::Fetch, 503);

    h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(h.provider.calls(RemoteOp::Fetch), 4);
}

#[tokio::test]
async fn test_failing_type_keeps_completed_types() {
    let h = harness();
    h.provider
        .insert_with_id(EntityType::Label, "L1", json!({"name": "urgent"}));
    h.service.connect(ALICE, TOKEN).await.unwrap();
    h.provider.fail_next_with(
        RemoteOp::Fetch,
        Some(EntityType::Task),
        RemoteApiError::Unauthorized { status: 403 },
    );

    let err = h.service.sync_now(ALICE).await.unwrap_err();
    match err {
        ActionError::RemoteApi {
            completed_types, ..
        } => assert_eq!(completed_types, vec![EntityType::Label, EntityType::List]),
        other => panic!("unexpected error: {other:?}"),
    }
    // The label pulled before the failure stays applied.
    assert_eq!(h.locals(ALICE, EntityType::Label).len(), 1);
}

#[tokio::test]
async fn test_push_failure_is_counted_and_retried_next_pass() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"completed": true}));
    h.provider.fail_next(RemoteOp::Update, 500);

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.pushed_updated, 0);

    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert_eq!(summary.pushed_updated, 1);
    assert_eq!(h.provider.get(EntityType::Task, "T1").unwrap()["completed"], true);
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    let locks = h.service.context().locks.clone();

    // Hold the user's lock so the first pass stalls after claiming.
    let guard = locks.acquire(ALICE).await.unwrap();
    let first = {
        let service = h.service.clone();
        tokio::spawn(async move { service.sync_now(ALICE).await })
    };
    while !locks.is_syncing(ALICE) {
        tokio::task::yield_now().await;
    }

    let err = h.service.sync_now(ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::AlreadyInProgress);

    drop(guard);
    first.await.unwrap().unwrap();
    assert!(!locks.is_syncing(ALICE));
}

#[tokio::test]
async fn test_timed_out_caller_leaves_pass_to_finish() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    h.provider
        .insert_with_id(EntityType::Task, "T1", json!({"title": "Renew passport"}));

    let guard = h.service.context().locks.acquire(ALICE).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_millis(50), h.service.sync_now(ALICE)).await;
    assert!(waited.is_err());
    assert_eq!(
        h.service.get_status(ALICE).unwrap().status,
        SyncStatus::Syncing
    );

    drop(guard);
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.events.0.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let status = h.service.get_status(ALICE).unwrap();
    assert_eq!(status.status, SyncStatus::Idle);
    assert!(status.last_sync_at.is_some());
    assert!(status.last_error.is_none());

    let tasks = h.locals(ALICE, EntityType::Task);
    assert_eq!(tasks.len(), 1);
    let mapping = h.mapping(ALICE, EntityType::Task, &tasks[0].id).unwrap();
    assert_eq!(mapping.remote_id, "T1");
    assert!(h.events.0.lock().unwrap()[0].1.error.is_none());
}

/// Two services on one database file stand in for the daemon and a CLI
/// invocation.
fn shared_file_services(
    path: &std::path::Path,
    provider: &Arc<MemoryProvider>,
) -> (Arc<Database>, Arc<SyncService>, Arc<SyncService>) {
    let open = || {
        let db = Database::new(path).unwrap();
        db.initialize().unwrap();
        Arc::new(db)
    };
    let daemon_db = open();
    let daemon = service_on(
        daemon_db.clone(),
        provider.clone(),
        KeyRing::single("a", KEY_A),
        Arc::new(Recording::default()),
    );
    let cli = service_on(
        open(),
        provider.clone(),
        KeyRing::single("a", KEY_A),
        Arc::new(Recording::default()),
    );
    (daemon_db, daemon, cli)
}

#[tokio::test]
async fn test_simultaneous_passes_across_processes_push_once() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new(TOKEN));
    let (db, daemon, cli) = shared_file_services(&dir.path().join("tasksync.db"), &provider);
    daemon.connect(ALICE, TOKEN).await.unwrap();
    {
        let conn = db.conn();
        SqliteLocalStore::new()
            .insert(
                &conn,
                ALICE,
                EntityType::List,
                &doc(json!({"name": "Errands", "color": "blue"})),
            )
            .unwrap();
    }

    let (a, b) = tokio::join!(daemon.sync_now(ALICE), cli.sync_now(ALICE));
    let (ok, rejected) = match (a, b) {
        (Ok(summary), Err(err)) | (Err(err), Ok(summary)) => (summary, err),
        other => panic!("expected exactly one pass to run: {other:?}"),
    };
    assert_eq!(rejected.kind(), ActionErrorKind::AlreadyInProgress);
    assert_eq!(ok.pushed_created, 1);
    assert_eq!(provider.ids(EntityType::List).len(), 1);

    // Later passes from either side see the mapping and push nothing.
    cli.sync_now(ALICE).await.unwrap();
    daemon.sync_now(ALICE).await.unwrap();
    assert_eq!(provider.ids(EntityType::List).len(), 1);
}

#[tokio::test]
async fn test_user_lock_is_shared_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MemoryProvider::new(TOKEN));
    let (_db, daemon, cli) = shared_file_services(&dir.path().join("tasksync.db"), &provider);
    daemon.connect(ALICE, TOKEN).await.unwrap();

    // Stall the daemon's pass after it claims the user.
    let guard = daemon.context().locks.acquire(ALICE).await.unwrap();
    let first = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.sync_now(ALICE).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while cli.get_status(ALICE).unwrap().status != SyncStatus::Syncing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = cli.sync_now(ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::AlreadyInProgress);

    // Other mutations from the second process wait for the lease too.
    let blocked = tokio::time::timeout(Duration::from_millis(300), cli.disconnect(ALICE)).await;
    assert!(blocked.is_err());
    assert!(cli.get_status(ALICE).unwrap().connected);

    drop(guard);
    first.await.unwrap().unwrap();
    cli.disconnect(ALICE).await.unwrap();
    assert!(!daemon.get_status(ALICE).unwrap().connected);
}

// ===========================================================================
// Vault and isolation
// ===========================================================================

#[tokio::test]
async fn test_connect_validation_and_rejected_token() {
    let h = harness();
    let err = h.service.connect(ALICE, "   ").await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::ValidationError);

    let err = h.service.connect(ALICE, "wrong").await.unwrap_err();
    match err {
        ActionError::RemoteApi {
            requires_reconnect, ..
        } => assert!(requires_reconnect),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!h.service.get_status(ALICE).unwrap().connected);

    let err = h.service.sync_now(ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::NotConnected);
}

#[tokio::test]
async fn test_disconnect_keeps_mappings() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;

    h.service.disconnect(ALICE).await.unwrap();
    assert!(!h.service.get_status(ALICE).unwrap().connected);
    assert!(h.mapping(ALICE, EntityType::Task, &local_id).is_some());

    let err = h.service.disconnect(ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::NotConnected);

    // Reconnecting resumes without duplicating anything.
    h.service.connect(ALICE, TOKEN).await.unwrap();
    let summary = h.service.sync_now(ALICE).await.unwrap();
    assert!(!summary.has_activity());
    assert_eq!(h.locals(ALICE, EntityType::Task).len(), 1);
}

#[tokio::test]
async fn test_rotation_to_new_key_and_missing_key() {
    let h = harness_with(KeyRing::single("a", KEY_A));
    h.service.connect(ALICE, TOKEN).await.unwrap();

    let both = KeyRing::new(
        "b",
        vec![("a".to_string(), KEY_A), ("b".to_string(), KEY_B)],
    )
    .unwrap();
    let rotated = service_on(h.db.clone(), h.provider.clone(), both, h.events.clone());
    let outcome = rotated.rotate_tokens(ALICE).await.unwrap();
    assert_eq!(
        outcome,
        RotationOutcome::Rotated {
            from: "a".to_string()
        }
    );
    rotated.sync_now(ALICE).await.unwrap();

    // Only the retired key: the rotated credential is unreadable.
    let retired = service_on(
        h.db.clone(),
        h.provider.clone(),
        KeyRing::single("a", KEY_A),
        h.events.clone(),
    );
    let err = retired.sync_now(ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::DecryptionError);
    let err = retired.rotate_tokens(ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::DecryptionError);

    // Only the new key: still readable.
    let current_only = service_on(
        h.db.clone(),
        h.provider.clone(),
        KeyRing::single("b", KEY_B),
        h.events.clone(),
    );
    current_only.sync_now(ALICE).await.unwrap();
}

#[tokio::test]
async fn test_cross_user_isolation() {
    let h = harness();
    let local_id = h.with_pulled_task("Write report").await;
    h.edit_local(ALICE, EntityType::Task, &local_id, json!({"title": "Buy milk"}));
    h.provider
        .edit(EntityType::Task, "T1", json!({"title": "Buy bread"}));
    h.service.sync_now(ALICE).await.unwrap();
    let alice_conflict = h.service.get_conflicts(ALICE).unwrap()[0].id.clone();

    assert!(h.service.get_conflicts("bob").unwrap().is_empty());
    let err = h
        .service
        .resolve_conflict("bob", &alice_conflict, "local")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::NotFound);
    let err = h.service.get_conflict("bob", &alice_conflict).unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::NotFound);

    let bob = h.service.get_status("bob").unwrap();
    assert!(!bob.connected);
    assert_eq!(bob.unresolved_conflicts, 0);
    assert!(bob.last_sync_at.is_none());
    assert!(h.service.audit_log("bob", 10).unwrap().is_empty());

    let err = h.service.get_conflicts("").unwrap_err();
    assert_eq!(err.kind(), ActionErrorKind::Forbidden);

    // Alice's conflict is untouched.
    assert_eq!(h.service.get_conflicts(ALICE).unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_all_connected_and_audit_trail() {
    let h = harness();
    h.service.connect(ALICE, TOKEN).await.unwrap();
    h.service.connect("bob", TOKEN).await.unwrap();
    h.service.disconnect("bob").await.unwrap();

    let results = h.service.sync_all_connected().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, ALICE);
    assert!(results[0].1.is_ok());

    let actions: Vec<String> = h
        .service
        .audit_log(ALICE, 10)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec!["sync", "connect"]);

    let events = h.events.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, ALICE);
    assert!(events[0].1.is_success());
}
