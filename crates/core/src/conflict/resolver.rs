//! Conflict listing and resolution.
//!
//! Resolving a conflict applies the chosen side's stored payload to the
//! other side, records fresh mapping hashes and marks the conflict resolved,
//! all under the user's lock. A conflict that is unknown, belongs to another
//! user or is already resolved is reported as not found, so a repeated
//! submission never repeats a write.

use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::db::queries;
use crate::errors::ConflictError;
use crate::fields::{self, Fields};
use crate::mapping::MappingStore;
use crate::models::{AuditAction, ConflictRecord, EntityType, Resolution};
use crate::sync_engine::SyncContext;

/// Display form of a conflict payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadPreview {
    pub title: String,
    pub description: String,
}

/// Parse a stored payload for display. Missing, malformed or partial
/// payloads yield empty strings.
pub fn format_payload(payload: &str) -> PayloadPreview {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(payload) else {
        return PayloadPreview::default();
    };
    let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
    PayloadPreview {
        title: text("title").or_else(|| text("name")).unwrap_or_default(),
        description: text("description").unwrap_or_default(),
    }
}

fn parse_payload(conflict: &ConflictRecord, payload: &str) -> Result<Fields, ConflictError> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(fields::extract(conflict.entity_type, &map)),
        Ok(_) => Err(ConflictError::InvalidPayload {
            id: conflict.id.clone(),
            detail: "payload is not a JSON object".into(),
        }),
        Err(e) => Err(ConflictError::InvalidPayload {
            id: conflict.id.clone(),
            detail: e.to_string(),
        }),
    }
}

/// Lists and resolves a user's conflicts.
pub struct ConflictResolver {
    ctx: Arc<SyncContext>,
}

impl ConflictResolver {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Unresolved conflicts of the user, oldest first.
    pub fn list(&self, user_id: &str) -> Result<Vec<ConflictRecord>, ConflictError> {
        Ok(self.ctx.db.list_unresolved_conflicts(user_id)?)
    }

    /// One of the user's conflicts, resolved or not.
    pub fn get(&self, user_id: &str, conflict_id: &str) -> Result<ConflictRecord, ConflictError> {
        self.ctx
            .db
            .get_conflict(user_id, conflict_id)?
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))
    }

    /// Settle a conflict in favour of one side.
    pub async fn resolve(
        &self,
        user_id: &str,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<(), ConflictError> {
        let _guard = self.ctx.locks.acquire(user_id).await?;

        let conflict = self
            .ctx
            .db
            .get_conflict(user_id, conflict_id)?
            .filter(|c| !c.is_resolved())
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))?;

        info!(
            user_id,
            conflict_id,
            entity_type = %conflict.entity_type,
            local_id = %conflict.local_id,
            %resolution,
            "resolving conflict"
        );

        let result = match resolution {
            Resolution::Local => self.keep_local(user_id, &conflict).await,
            Resolution::Remote => self.keep_remote(user_id, &conflict),
        };

        let details = match &result {
            Ok(()) => format!("conflict {} resolved as {}", conflict_id, resolution),
            Err(e) => format!("resolving conflict {} as {} failed: {}", conflict_id, resolution, e),
        };
        if let Err(e) = self.ctx.db.insert_audit(
            user_id,
            AuditAction::ResolveConflict,
            Some(&details),
            result.is_ok(),
        ) {
            warn!(user_id, error = %e, "failed to write audit entry");
        }
        result
    }

    /// Push the local payload to the provider.
    async fn keep_local(&self, user_id: &str, conflict: &ConflictRecord) -> Result<(), ConflictError> {
        let token = self.ctx.vault.get_token(user_id)?;
        let provider = self.ctx.provider.as_ref();
        let entity_type = conflict.entity_type;
        let remote_id = conflict.remote_id.as_str();
        let token = token.as_str();

        if conflict.local_payload.is_empty() {
            // Deleted locally: delete the remote copy too.
            self.ctx
                .retry
                .run("resolve delete", move || provider.delete(token, entity_type, remote_id))
                .await?;
            return self.ctx.db.transaction(|conn| {
                MappingStore::new(conn, user_id).remove(entity_type, &conflict.local_id)?;
                self.ctx
                    .local
                    .delete(conn, user_id, entity_type, &conflict.local_id)?;
                mark_resolved(conn, user_id, conflict, Resolution::Local)
            });
        }

        let payload = parse_payload(conflict, &conflict.local_payload)?;
        let local_hash = fields::content_hash(&payload);
        let payload_ref = &payload;

        if conflict.remote_payload.is_empty() {
            // Deleted remotely: recreate the remote copy.
            let local_id = conflict.local_id.as_str();
            let envelope = self
                .ctx
                .retry
                .run("resolve create", move || {
                    provider.create(token, entity_type, payload_ref, local_id)
                })
                .await?;
            return self.ctx.db.transaction(|conn| {
                let mappings = MappingStore::new(conn, user_id);
                let remote_hash = hash_remote(&mappings, entity_type, &envelope.raw_fields)?;
                mappings.rebind_remote(
                    entity_type,
                    &conflict.local_id,
                    &envelope.remote_id,
                    &local_hash,
                    &remote_hash,
                )?;
                mark_resolved(conn, user_id, conflict, Resolution::Local)
            });
        }

        let envelope = self
            .ctx
            .retry
            .run("resolve update", move || {
                provider.update(token, entity_type, remote_id, payload_ref)
            })
            .await?;
        self.ctx.db.transaction(|conn| {
            let mappings = MappingStore::new(conn, user_id);
            let remote_hash = hash_remote(&mappings, entity_type, &envelope.raw_fields)?;
            mappings.update_hashes(entity_type, &conflict.local_id, &local_hash, &remote_hash)?;
            mark_resolved(conn, user_id, conflict, Resolution::Local)
        })
    }

    /// Apply the remote payload locally. Purely local, one transaction.
    fn keep_remote(&self, user_id: &str, conflict: &ConflictRecord) -> Result<(), ConflictError> {
        let entity_type = conflict.entity_type;
        let local = self.ctx.local.as_ref();

        if conflict.remote_payload.is_empty() {
            // Deleted remotely: delete the local copy too.
            return self.ctx.db.transaction(|conn| {
                local.delete(conn, user_id, entity_type, &conflict.local_id)?;
                MappingStore::new(conn, user_id).remove(entity_type, &conflict.local_id)?;
                mark_resolved(conn, user_id, conflict, Resolution::Remote)
            });
        }

        let payload = parse_payload(conflict, &conflict.remote_payload)?;
        let hash = fields::content_hash(&payload);

        self.ctx.db.transaction(|conn| {
            let mappings = MappingStore::new(conn, user_id);
            let local_fields = fields::to_local(&mappings, entity_type, &payload)?;

            if conflict.local_payload.is_empty() {
                // Deleted locally: recreate the local copy.
                let new_id = local.insert(conn, user_id, entity_type, &local_fields)?;
                local.delete(conn, user_id, entity_type, &conflict.local_id)?;
                mappings.rebind_local(entity_type, &conflict.local_id, &new_id, &hash, &hash)?;
                info!(user_id, old_local_id = %conflict.local_id, %new_id, "recreated local entity");
            } else {
                local.update(conn, user_id, entity_type, &conflict.local_id, &local_fields)?;
                mappings.update_hashes(entity_type, &conflict.local_id, &hash, &hash)?;
            }
            mark_resolved(conn, user_id, conflict, Resolution::Remote)
        })
    }
}

fn hash_remote(
    mappings: &MappingStore<'_>,
    entity_type: EntityType,
    raw: &Map<String, Value>,
) -> Result<String, ConflictError> {
    let canonical = fields::canonical_from_remote(mappings, entity_type, raw)?;
    Ok(fields::content_hash(&canonical))
}

fn mark_resolved(
    conn: &Connection,
    user_id: &str,
    conflict: &ConflictRecord,
    resolution: Resolution,
) -> Result<(), ConflictError> {
    if !queries::mark_conflict_resolved(conn, user_id, &conflict.id, resolution)? {
        return Err(ConflictError::NotFound(conflict.id.clone()));
    }
    Ok(())
}
