//! Bidirectional task/list/label synchronization engine.
//!
//! The [`SyncEngine`] drives one pass per call to [`SyncEngine::sync_now`]:
//!
//! 1. Claim the user's `sync_state` row (failing fast if another pass, in
//!    any process, holds it) and take the per-user lock.
//! 2. Decrypt the provider token.
//! 3. For each entity type in dependency order (labels, lists, tasks):
//!    fetch the remote set (delta when a cursor is stored), read the local
//!    set, classify every entity against its mapping's last-synced hashes,
//!    and apply local-side effects in one transaction.
//! 4. Push local-side changes to the provider, committing each mapping
//!    update as soon as its remote write succeeds.
//! 5. Advance the type's cursor, renew the lease and heartbeat the claim.
//! 6. Record the outcome, release the lock and notify observers.
//!
//! Entities with an unresolved conflict are frozen: their conflict payloads
//! are refreshed but neither side nor the mapping is touched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::conflict::detector::{decide, SideChange, SyncAction};
use crate::db::{queries, Database};
use crate::errors::{DatabaseError, RemoteApiError, SyncError, VaultError};
use crate::fields::{self, Fields};
use crate::local::{LocalEntity, LocalStore};
use crate::locks::{SyncClaim, UserGuard, UserLocks};
use crate::mapping::{Mapping, MappingKey, MappingStore, Side};
use crate::models::{AuditAction, EntityType, SyncOutcome, SyncSummary};
use crate::notify::SyncObserver;
use crate::remote::{RemoteBatch, RemoteEnvelope, RemoteProvider, RetryPolicy};
use crate::vault::CredentialVault;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Collaborators shared by the engine, the conflict resolver and the
/// service facade.
pub struct SyncContext {
    pub db: Arc<Database>,
    pub vault: Arc<CredentialVault>,
    pub provider: Arc<dyn RemoteProvider>,
    pub local: Arc<dyn LocalStore>,
    pub locks: Arc<UserLocks>,
    pub retry: RetryPolicy,
}

impl SyncContext {
    pub fn new(
        db: Arc<Database>,
        vault: Arc<CredentialVault>,
        provider: Arc<dyn RemoteProvider>,
        local: Arc<dyn LocalStore>,
        retry: RetryPolicy,
    ) -> Self {
        let locks = Arc::new(UserLocks::new(db.clone(), vault.provider()));
        Self {
            db,
            vault,
            provider,
            local,
            locks,
            retry,
        }
    }

    /// Override how long a lease or an unrefreshed `syncing` row stays valid.
    pub fn with_lease_ttl(self, ttl: Duration) -> Self {
        let locks = UserLocks::new(self.db.clone(), self.vault.provider()).with_lease_ttl(ttl);
        Self {
            locks: Arc::new(locks),
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Remote write queued by reconciliation.
#[derive(Debug)]
enum RemoteWork {
    Update {
        local_id: String,
        remote_id: String,
        fields: Fields,
        local_hash: String,
    },
    Create {
        local_id: String,
        fields: Fields,
        local_hash: String,
    },
    Delete {
        local_id: String,
        remote_id: String,
    },
}

impl RemoteWork {
    fn local_id(&self) -> &str {
        match self {
            Self::Update { local_id, .. }
            | Self::Create { local_id, .. }
            | Self::Delete { local_id, .. } => local_id,
        }
    }
}

/// Current state of one side of a mapped entity.
struct SideState {
    change: SideChange,
    /// Canonical document; `None` when deleted or not in a delta batch.
    fields: Option<Fields>,
}

/// The sync orchestrator.
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    observer: Arc<dyn SyncObserver>,
}

impl SyncEngine {
    pub fn new(ctx: Arc<SyncContext>, observer: Arc<dyn SyncObserver>) -> Self {
        info!(provider = %ctx.vault.provider(), "initializing sync engine");
        Self { ctx, observer }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Whether a pass started by this process is running for the user.
    pub fn is_running(&self, user_id: &str) -> bool {
        self.ctx.locks.is_syncing(user_id)
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Run one sync pass for `user_id`.
    ///
    /// Fails immediately with [`SyncError::AlreadyRunning`] if a pass is
    /// already running for the user in this or another process. The pass
    /// itself runs on a spawned task: dropping the returned future (a
    /// caller-side timeout) leaves it to finish in the background.
    pub async fn sync_now(self: &Arc<Self>, user_id: &str) -> Result<SyncSummary, SyncError> {
        let claim = self
            .ctx
            .locks
            .try_claim_sync(user_id)?
            .ok_or_else(|| SyncError::AlreadyRunning {
                user_id: user_id.to_string(),
            })?;

        let engine = Arc::clone(self);
        let user = user_id.to_string();
        tokio::spawn(async move { engine.run_pass(&user, claim).await })
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))?
    }

    async fn run_pass(
        &self,
        user_id: &str,
        mut claim: SyncClaim,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::new(Utc::now());

        let result = match self.ctx.locks.acquire(user_id).await {
            Ok(guard) => {
                self.run_locked(user_id, &mut claim, &guard, &mut summary)
                    .await
            }
            Err(e) => {
                let err = SyncError::from(e);
                if let Err(e) = claim.finish(Utc::now(), Some(&err.to_string())) {
                    warn!(user_id, error = %e, "failed to record sync state");
                }
                Err(err)
            }
        };
        drop(claim);

        let outcome = SyncOutcome {
            summary: summary.clone(),
            error: result.as_ref().err().map(|e| e.to_string()),
            requires_reconnect: result.as_ref().err().is_some_and(requires_reconnect),
        };
        self.observer.on_sync_completed(user_id, &outcome);

        result.map(|()| summary)
    }

    async fn run_locked(
        &self,
        user_id: &str,
        claim: &mut SyncClaim,
        guard: &UserGuard,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let token = match self.ctx.vault.get_token(user_id) {
            Ok(token) => token,
            Err(e) => {
                if let Err(e) = claim.cancel() {
                    warn!(user_id, error = %e, "failed to release sync claim");
                }
                return Err(e.into());
            }
        };
        info!(user_id, "sync pass started");

        let mut result = Ok(());
        for entity_type in EntityType::SYNC_ORDER {
            if let Err(e) = self.sync_type(user_id, &token, entity_type, summary).await {
                result = Err(e);
                break;
            }
            summary.completed_types.push(entity_type);
            keep_alive(user_id, claim, guard);
        }

        let completed_at = Utc::now();
        summary.completed_at = Some(completed_at);

        let (details, error) = match &result {
            Ok(()) => (summary.to_string(), None),
            Err(e) => (format!("sync failed: {}", e), Some(e.to_string())),
        };
        match &result {
            Ok(()) => info!(user_id, summary = %summary, "sync pass completed"),
            Err(e) => warn!(user_id, error = %e, completed = ?summary.completed_types, "sync pass failed"),
        }

        if let Err(e) = claim.finish(completed_at, error.as_deref()) {
            warn!(user_id, error = %e, "failed to record sync state");
        }
        if let Err(e) = self.ctx.db.insert_audit(
            user_id,
            AuditAction::Sync,
            Some(&details),
            result.is_ok(),
        ) {
            warn!(user_id, error = %e, "failed to write audit entry");
        }

        result
    }

    // -----------------------------------------------------------------------
    // Per entity type
    // -----------------------------------------------------------------------

    async fn sync_type(
        &self,
        user_id: &str,
        token: &str,
        entity_type: EntityType,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let abort = |source: RemoteApiError, completed: &[EntityType]| SyncError::Remote {
            entity_type,
            completed: completed.to_vec(),
            source,
        };

        let cursor = {
            let conn = self.ctx.db.conn();
            queries::get_cursor(&conn, user_id, entity_type)?
        };
        let batch = self
            .fetch(token, entity_type, cursor.as_deref())
            .await
            .map_err(|e| abort(e, &summary.completed_types))?;
        debug!(
            user_id,
            %entity_type,
            count = batch.entities.len(),
            delta = batch.is_delta,
            "fetched remote entities"
        );

        let mut staged = summary.clone();
        let work = self.ctx.db.transaction(|conn| {
            self.reconcile(conn, user_id, entity_type, &batch, &mut staged)
        })?;
        *summary = staged;

        for item in work {
            if let Err(e) = self.push(user_id, token, entity_type, &item, summary).await {
                match e {
                    PushError::Remote(err) if err.requires_reconnect() => {
                        return Err(abort(err, &summary.completed_types));
                    }
                    PushError::Remote(err) => {
                        warn!(
                            user_id,
                            %entity_type,
                            local_id = item.local_id(),
                            error = %err,
                            "push failed, will retry next pass"
                        );
                        summary.failed += 1;
                    }
                    PushError::Database(err) => return Err(err.into()),
                }
            }
        }

        if let Some(cursor) = &batch.cursor {
            let conn = self.ctx.db.conn();
            queries::set_cursor(&conn, user_id, entity_type, cursor)?;
        }
        Ok(())
    }

    /// Fetch with retry. An expired cursor falls back to a full fetch.
    async fn fetch(
        &self,
        token: &str,
        entity_type: EntityType,
        cursor: Option<&str>,
    ) -> Result<RemoteBatch, RemoteApiError> {
        let provider: &dyn RemoteProvider = self.ctx.provider.as_ref();
        let operation = format!("fetch {}", entity_type);

        let result = self
            .ctx
            .retry
            .run(&operation, move || provider.fetch(token, entity_type, cursor))
            .await;
        match result {
            Err(e) if e.is_cursor_expired() && cursor.is_some() => {
                warn!(%entity_type, "delta cursor expired, refetching everything");
                self.ctx
                    .retry
                    .run(&operation, move || provider.fetch(token, entity_type, None))
                    .await
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Reconciliation (runs inside one transaction)
    // -----------------------------------------------------------------------

    /// Classify every entity of a type, apply local-side effects and return
    /// the remote writes still to do.
    fn reconcile(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        batch: &RemoteBatch,
        summary: &mut SyncSummary,
    ) -> Result<Vec<RemoteWork>, DatabaseError> {
        let local_store = self.ctx.local.as_ref();
        let mappings = MappingStore::new(conn, user_id);

        let mut locals: HashMap<String, LocalEntity> = local_store
            .list(conn, user_id, entity_type)?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let mut remotes: HashMap<&str, &RemoteEnvelope> = batch
            .entities
            .iter()
            .map(|e| (e.remote_id.as_str(), e))
            .collect();
        let mut work = Vec::new();

        for mapping in mappings.list(entity_type)? {
            let local = locals.remove(&mapping.local_id);
            let remote = remotes.remove(mapping.remote_id.as_str());

            let local_side = local_state(&mappings, &mapping, local.as_ref())?;
            let remote_side = remote_state(&mappings, &mapping, remote, batch.is_delta)?;

            if let Some(existing) =
                queries::find_unresolved_conflict(conn, user_id, entity_type, &mapping.local_id)?
            {
                let local_payload = payload(local_side.fields.as_ref())?;
                let remote_payload = match (&remote_side.change, &remote_side.fields) {
                    (SideChange::Deleted, _) => String::new(),
                    (_, Some(f)) => payload(Some(f))?,
                    (_, None) => existing.remote_payload.clone(),
                };
                queries::upsert_conflict(
                    conn,
                    user_id,
                    entity_type,
                    &mapping.local_id,
                    &mapping.remote_id,
                    &local_payload,
                    &remote_payload,
                )?;
                debug!(user_id, %entity_type, local_id = %mapping.local_id, "entity frozen by conflict");
                summary.frozen += 1;
                continue;
            }

            let action = decide(&local_side.change, &remote_side.change);
            debug!(user_id, %entity_type, local_id = %mapping.local_id, ?action, "reconciled");
            match action {
                SyncAction::Noop => {}
                SyncAction::Pull => {
                    let (SideChange::Changed(remote_hash), Some(canonical)) =
                        (&remote_side.change, &remote_side.fields)
                    else {
                        continue;
                    };
                    let local_fields = fields::to_local(&mappings, entity_type, canonical)?;
                    local_store.update(conn, user_id, entity_type, &mapping.local_id, &local_fields)?;
                    mappings.update_hashes(entity_type, &mapping.local_id, remote_hash, remote_hash)?;
                    summary.pulled_updated += 1;
                }
                SyncAction::Push => {
                    let (SideChange::Changed(local_hash), Some(canonical)) =
                        (&local_side.change, local_side.fields)
                    else {
                        continue;
                    };
                    work.push(RemoteWork::Update {
                        local_id: mapping.local_id.clone(),
                        remote_id: mapping.remote_id.clone(),
                        fields: canonical,
                        local_hash: local_hash.clone(),
                    });
                }
                SyncAction::Converged => {
                    if let SideChange::Changed(hash) = &local_side.change {
                        mappings.update_hashes(entity_type, &mapping.local_id, hash, hash)?;
                        summary.converged += 1;
                    }
                }
                SyncAction::Conflict(kind) => {
                    let local_payload = payload(local_side.fields.as_ref())?;
                    let remote_payload = payload(remote_side.fields.as_ref())?;
                    let id = queries::upsert_conflict(
                        conn,
                        user_id,
                        entity_type,
                        &mapping.local_id,
                        &mapping.remote_id,
                        &local_payload,
                        &remote_payload,
                    )?;
                    info!(user_id, %entity_type, local_id = %mapping.local_id, conflict_id = %id, kind = %kind, "conflict recorded");
                    summary.conflicts += 1;
                }
                SyncAction::DeleteRemote => {
                    mappings.mark_deleted(
                        entity_type,
                        MappingKey::Local(&mapping.local_id),
                        Side::Local,
                    )?;
                    work.push(RemoteWork::Delete {
                        local_id: mapping.local_id.clone(),
                        remote_id: mapping.remote_id.clone(),
                    });
                }
                SyncAction::DeleteLocal => {
                    local_store.delete(conn, user_id, entity_type, &mapping.local_id)?;
                    mappings.mark_deleted(
                        entity_type,
                        MappingKey::Remote(&mapping.remote_id),
                        Side::Remote,
                    )?;
                    mappings.mark_deleted(
                        entity_type,
                        MappingKey::Local(&mapping.local_id),
                        Side::Local,
                    )?;
                    summary.pulled_deleted += 1;
                }
                SyncAction::Forget => {
                    local_store.delete(conn, user_id, entity_type, &mapping.local_id)?;
                    mappings.remove(entity_type, &mapping.local_id)?;
                }
            }
        }

        // Remote entities with no mapping: join by stable key or pull.
        let mut unmatched: Vec<&RemoteEnvelope> = remotes.into_values().collect();
        unmatched.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        for envelope in unmatched.into_iter().filter(|e| !e.deleted) {
            let canonical = fields::canonical_from_remote(&mappings, entity_type, &envelope.raw_fields)?;
            let remote_hash = fields::content_hash(&canonical);

            let joined = envelope
                .stable_key
                .as_deref()
                .and_then(|key| locals.get(key))
                .filter(|local| !local.deleted)
                .map(|local| local.id.clone());

            if let Some(local_id) = joined {
                let Some(local) = locals.remove(&local_id) else {
                    continue;
                };
                mappings.upsert(entity_type, &local_id, &envelope.remote_id, &remote_hash, &remote_hash)?;
                info!(user_id, %entity_type, %local_id, remote_id = %envelope.remote_id, "joined by stable key");

                let local_canonical = fields::canonical_from_local(&mappings, entity_type, &local.fields)?;
                let local_hash = fields::content_hash(&local_canonical);
                if local_hash != remote_hash {
                    work.push(RemoteWork::Update {
                        local_id,
                        remote_id: envelope.remote_id.clone(),
                        fields: local_canonical,
                        local_hash,
                    });
                }
                continue;
            }

            let local_fields = fields::to_local(&mappings, entity_type, &canonical)?;
            let local_id = local_store.insert(conn, user_id, entity_type, &local_fields)?;
            mappings.upsert(entity_type, &local_id, &envelope.remote_id, &remote_hash, &remote_hash)?;
            summary.pulled_created += 1;
        }

        // Local entities with no mapping: create remotely.
        let mut unmapped: Vec<LocalEntity> = locals.into_values().filter(|e| !e.deleted).collect();
        unmapped.sort_by(|a, b| a.id.cmp(&b.id));
        for local in unmapped {
            let canonical = fields::canonical_from_local(&mappings, entity_type, &local.fields)?;
            let local_hash = fields::content_hash(&canonical);
            work.push(RemoteWork::Create {
                local_id: local.id,
                fields: canonical,
                local_hash,
            });
        }

        Ok(work)
    }

    // -----------------------------------------------------------------------
    // Remote writes
    // -----------------------------------------------------------------------

    /// Perform one remote write and commit the matching mapping update.
    async fn push(
        &self,
        user_id: &str,
        token: &str,
        entity_type: EntityType,
        item: &RemoteWork,
        summary: &mut SyncSummary,
    ) -> Result<(), PushError> {
        let provider = self.ctx.provider.as_ref();
        let local_store = self.ctx.local.as_ref();

        match item {
            RemoteWork::Update {
                local_id,
                remote_id,
                fields,
                local_hash,
            } => {
                let envelope = provider.update(token, entity_type, remote_id, fields).await?;
                self.ctx.db.transaction(|conn| {
                    let mappings = MappingStore::new(conn, user_id);
                    let remote_hash = remote_hash(&mappings, &envelope)?;
                    mappings.update_hashes(entity_type, local_id, local_hash, &remote_hash)
                })?;
                summary.pushed_updated += 1;
            }
            RemoteWork::Create {
                local_id,
                fields,
                local_hash,
            } => {
                let envelope = provider.create(token, entity_type, fields, local_id).await?;
                self.ctx.db.transaction(|conn| {
                    let mappings = MappingStore::new(conn, user_id);
                    let remote_hash = remote_hash(&mappings, &envelope)?;
                    mappings
                        .upsert(entity_type, local_id, &envelope.remote_id, local_hash, &remote_hash)
                        .map(|_| ())
                })?;
                debug!(user_id, %entity_type, %local_id, remote_id = %envelope.remote_id, "created remotely");
                summary.pushed_created += 1;
            }
            RemoteWork::Delete {
                local_id,
                remote_id,
            } => {
                provider.delete(token, entity_type, remote_id).await?;
                self.ctx.db.transaction(|conn| {
                    let mappings = MappingStore::new(conn, user_id);
                    mappings.mark_deleted(entity_type, MappingKey::Remote(remote_id), Side::Remote)?;
                    local_store.delete(conn, user_id, entity_type, local_id)
                })?;
                summary.pushed_deleted += 1;
            }
        }
        Ok(())
    }
}

/// Failure of one queued remote write.
enum PushError {
    Remote(RemoteApiError),
    Database(DatabaseError),
}

impl From<RemoteApiError> for PushError {
    fn from(err: RemoteApiError) -> Self {
        Self::Remote(err)
    }
}

impl From<DatabaseError> for PushError {
    fn from(err: DatabaseError) -> Self {
        Self::Database(err)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn local_state(
    mappings: &MappingStore<'_>,
    mapping: &Mapping,
    local: Option<&LocalEntity>,
) -> Result<SideState, DatabaseError> {
    match local {
        Some(entity) if !entity.deleted && !mapping.deleted_locally => {
            let canonical =
                fields::canonical_from_local(mappings, mapping.entity_type, &entity.fields)?;
            let hash = fields::content_hash(&canonical);
            Ok(SideState {
                change: SideChange::classify(Some(&hash), &mapping.last_local_hash),
                fields: Some(canonical),
            })
        }
        _ => Ok(SideState {
            change: SideChange::Deleted,
            fields: None,
        }),
    }
}

fn remote_state(
    mappings: &MappingStore<'_>,
    mapping: &Mapping,
    remote: Option<&RemoteEnvelope>,
    is_delta: bool,
) -> Result<SideState, DatabaseError> {
    let deleted = SideState {
        change: SideChange::Deleted,
        fields: None,
    };
    if mapping.deleted_remotely {
        return Ok(deleted);
    }
    match remote {
        Some(envelope) if envelope.deleted => Ok(deleted),
        Some(envelope) => {
            let canonical =
                fields::canonical_from_remote(mappings, mapping.entity_type, &envelope.raw_fields)?;
            let hash = fields::content_hash(&canonical);
            Ok(SideState {
                change: SideChange::classify(Some(&hash), &mapping.last_remote_hash),
                fields: Some(canonical),
            })
        }
        // Delta batches only carry changes.
        None if is_delta => Ok(SideState {
            change: SideChange::Unchanged,
            fields: None,
        }),
        None => Ok(deleted),
    }
}

fn remote_hash(
    mappings: &MappingStore<'_>,
    envelope: &RemoteEnvelope,
) -> Result<String, DatabaseError> {
    let canonical =
        fields::canonical_from_remote(mappings, envelope.entity_type, &envelope.raw_fields)?;
    Ok(fields::content_hash(&canonical))
}

/// Conflict payload for one side; empty when that side is deleted.
fn payload(fields: Option<&Fields>) -> Result<String, DatabaseError> {
    match fields {
        Some(fields) => Ok(serde_json::to_string(fields)?),
        None => Ok(String::new()),
    }
}

/// Extend the lease and the claim heartbeat between entity types.
fn keep_alive(user_id: &str, claim: &SyncClaim, guard: &UserGuard) {
    match guard.renew() {
        Ok(true) => {}
        Ok(false) => warn!(user_id, "user lease expired mid-pass; another process may take it"),
        Err(e) => warn!(user_id, error = %e, "failed to renew user lease"),
    }
    if let Err(e) = claim.heartbeat() {
        warn!(user_id, error = %e, "failed to refresh sync heartbeat");
    }
}

/// Whether the user must reconnect before another pass can succeed.
fn requires_reconnect(err: &SyncError) -> bool {
    match err {
        SyncError::Remote { source, .. } => source.requires_reconnect(),
        SyncError::VaultError(
            VaultError::UnknownKey { .. } | VaultError::DecryptionFailed { .. },
        ) => true,
        _ => false,
    }
}

