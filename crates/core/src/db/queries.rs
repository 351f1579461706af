//! Typed query helpers for the credential, sync state, conflict, cursor and
//! audit tables.
//!
//! Helpers that must run inside a caller's transaction are free functions
//! taking a `&Connection`; everything else is a method on [`Database`].
//! Every query filters by `user_id`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{
    AuditAction, AuditEntry, ConflictRecord, EntityType, Resolution, SyncStateRecord, SyncStatus,
};

// ---------------------------------------------------------------------------
// Rows returned by queries
// ---------------------------------------------------------------------------

/// A row from the `credentials` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRow {
    pub user_id: String,
    pub provider: String,
    pub key_id: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, &v)).transpose()
}

/// Fixed-width UTC timestamp so stored values order correctly as text.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_entity_type(idx: usize, value: &str) -> rusqlite::Result<EntityType> {
    EntityType::from_str_val(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown entity type '{}'", value).into(),
        )
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRow> {
    Ok(CredentialRow {
        user_id: row.get(0)?,
        provider: row.get(1)?,
        key_id: row.get(2)?,
        ciphertext: row.get(3)?,
        nonce: row.get(4)?,
        auth_tag: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const CONFLICT_COLUMNS: &str = "id, user_id, entity_type, local_id, remote_id, local_payload, \
     remote_payload, created_at, resolved_at, resolution";

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    let entity_type: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    let resolution: Option<String> = row.get(9)?;
    Ok(ConflictRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        entity_type: parse_entity_type(2, &entity_type)?,
        local_id: row.get(3)?,
        remote_id: row.get(4)?,
        local_payload: row.get(5)?,
        remote_payload: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        resolved_at: parse_opt_ts(8, row.get(8)?)?,
        resolution: resolution.as_deref().and_then(Resolution::from_str_val),
    })
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers
// ---------------------------------------------------------------------------

/// Find the unresolved conflict for one entity, if any.
pub fn find_unresolved_conflict(
    conn: &Connection,
    user_id: &str,
    entity_type: EntityType,
    local_id: &str,
) -> Result<Option<ConflictRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM conflicts
         WHERE user_id = ?1 AND entity_type = ?2 AND local_id = ?3 AND resolved_at IS NULL",
        CONFLICT_COLUMNS
    );
    let record = conn
        .query_row(&sql, params![user_id, entity_type.as_str(), local_id], conflict_from_row)
        .optional()?;
    Ok(record)
}

/// Create the unresolved conflict for an entity, or refresh its payloads if
/// one already exists. Returns the conflict id.
pub fn upsert_conflict(
    conn: &Connection,
    user_id: &str,
    entity_type: EntityType,
    local_id: &str,
    remote_id: &str,
    local_payload: &str,
    remote_payload: &str,
) -> Result<String, DatabaseError> {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = find_unresolved_conflict(conn, user_id, entity_type, local_id)? {
        conn.execute(
            "UPDATE conflicts
             SET remote_id = ?1, local_payload = ?2, remote_payload = ?3, updated_at = ?4
             WHERE id = ?5 AND user_id = ?6",
            params![remote_id, local_payload, remote_payload, now, existing.id, user_id],
        )?;
        debug!(conflict_id = %existing.id, "refreshed conflict payloads");
        return Ok(existing.id);
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO conflicts
            (id, user_id, entity_type, local_id, remote_id, local_payload, remote_payload, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            user_id,
            entity_type.as_str(),
            local_id,
            remote_id,
            local_payload,
            remote_payload,
            now
        ],
    )?;
    debug!(conflict_id = %id, %entity_type, local_id, remote_id, "inserted conflict");
    Ok(id)
}

/// Mark a conflict resolved. Returns `false` if it does not belong to the
/// user or was already resolved.
pub fn mark_conflict_resolved(
    conn: &Connection,
    user_id: &str,
    id: &str,
    resolution: Resolution,
) -> Result<bool, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE conflicts SET resolved_at = ?1, resolution = ?2, updated_at = ?1
         WHERE id = ?3 AND user_id = ?4 AND resolved_at IS NULL",
        params![now, resolution.as_str(), id, user_id],
    )?;
    Ok(changed == 1)
}

/// Read the delta cursor for an entity type.
pub fn get_cursor(
    conn: &Connection,
    user_id: &str,
    entity_type: EntityType,
) -> Result<Option<String>, DatabaseError> {
    let cursor = conn
        .query_row(
            "SELECT cursor FROM sync_cursors WHERE user_id = ?1 AND entity_type = ?2",
            params![user_id, entity_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(cursor)
}

/// Store the delta cursor for an entity type.
pub fn set_cursor(
    conn: &Connection,
    user_id: &str,
    entity_type: EntityType,
    cursor: &str,
) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_cursors (user_id, entity_type, cursor, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, entity_type) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
        params![user_id, entity_type.as_str(), cursor, now],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Database methods
// ---------------------------------------------------------------------------

impl Database {
    // -- credentials --------------------------------------------------------

    /// Insert or replace the user's credential in one statement.
    pub fn put_credential(&self, row: &CredentialRow) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO credentials (user_id, provider, key_id, ciphertext, nonce, auth_tag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, provider) DO UPDATE SET
                key_id = excluded.key_id,
                ciphertext = excluded.ciphertext,
                nonce = excluded.nonce,
                auth_tag = excluded.auth_tag,
                created_at = excluded.created_at",
            params![
                row.user_id,
                row.provider,
                row.key_id,
                row.ciphertext,
                row.nonce,
                row.auth_tag,
                row.created_at
            ],
        )?;
        debug!(user_id = %row.user_id, key_id = %row.key_id, "stored credential");
        Ok(())
    }

    /// Replace a credential only if it still holds the sealed value `previous`.
    /// Returns `false` when the row changed (or vanished) in the meantime.
    pub fn replace_credential(
        &self,
        previous: &CredentialRow,
        next: &CredentialRow,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE credentials
             SET key_id = ?1, ciphertext = ?2, nonce = ?3, auth_tag = ?4, created_at = ?5
             WHERE user_id = ?6 AND provider = ?7 AND key_id = ?8 AND nonce = ?9",
            params![
                next.key_id,
                next.ciphertext,
                next.nonce,
                next.auth_tag,
                next.created_at,
                previous.user_id,
                previous.provider,
                previous.key_id,
                previous.nonce
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_credential(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<CredentialRow>, DatabaseError> {
        let row = self
            .conn()
            .query_row(
                "SELECT user_id, provider, key_id, ciphertext, nonce, auth_tag, created_at
                 FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                credential_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Delete the user's credential. Returns `false` if none existed.
    pub fn delete_credential(&self, user_id: &str, provider: &str) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider],
        )?;
        Ok(changed > 0)
    }

    /// All credentials stored for a provider, ordered by user.
    pub fn list_credentials(&self, provider: &str) -> Result<Vec<CredentialRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, provider, key_id, ciphertext, nonce, auth_tag, created_at
             FROM credentials WHERE provider = ?1 ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map(params![provider], credential_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Users holding a credential for the provider.
    pub fn connected_users(&self, provider: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT user_id FROM credentials WHERE provider = ?1 ORDER BY user_id")?;
        let users = stmt
            .query_map(params![provider], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(users)
    }

    // -- sync_state ---------------------------------------------------------

    /// Create an idle sync state row for the user if none exists.
    pub fn ensure_sync_state(&self, user_id: &str) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO sync_state (user_id, status, updated_at) VALUES (?1, 'idle', ?2)",
            params![user_id, stamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncStateRecord>, DatabaseError> {
        let row = self
            .conn()
            .query_row(
                "SELECT user_id, status, last_sync_at, last_error, updated_at
                 FROM sync_state WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let status: String = row.get(1)?;
                    let updated_at: String = row.get(4)?;
                    Ok(SyncStateRecord {
                        user_id: row.get(0)?,
                        status: SyncStatus::from_str_val(&status),
                        last_sync_at: parse_opt_ts(2, row.get(2)?)?,
                        last_error: row.get(3)?,
                        updated_at: parse_ts(4, &updated_at)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Move the user to `syncing` unless a pass already is. A `syncing` row
    /// whose heartbeat is older than `stale_before` is taken over.
    ///
    /// Returns `false` when another pass, in this or another process, holds
    /// the state.
    pub fn try_begin_sync(
        &self,
        user_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "INSERT INTO sync_state (user_id, status, updated_at) VALUES (?1, 'syncing', ?2)
             ON CONFLICT(user_id) DO UPDATE SET status = 'syncing', updated_at = excluded.updated_at
             WHERE sync_state.status = 'idle' OR sync_state.updated_at < ?3",
            params![user_id, stamp(Utc::now()), stamp(stale_before)],
        )?;
        Ok(changed > 0)
    }

    /// Refresh the heartbeat of a running pass.
    pub fn touch_sync(&self, user_id: &str) -> Result<(), DatabaseError> {
        self.conn().execute(
            "UPDATE sync_state SET updated_at = ?1 WHERE user_id = ?2 AND status = 'syncing'",
            params![stamp(Utc::now()), user_id],
        )?;
        Ok(())
    }

    /// Move the user back to `idle`. On success `last_sync_at` advances and
    /// `last_error` clears; on failure only `last_error` is recorded.
    pub fn finish_sync(
        &self,
        user_id: &str,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = stamp(completed_at);
        let conn = self.conn();
        match error {
            None => conn.execute(
                "UPDATE sync_state SET status = 'idle', last_sync_at = ?1, last_error = NULL, updated_at = ?1
                 WHERE user_id = ?2",
                params![now, user_id],
            )?,
            Some(message) => conn.execute(
                "UPDATE sync_state SET status = 'idle', last_error = ?1, updated_at = ?2
                 WHERE user_id = ?3",
                params![message, now, user_id],
            )?,
        };
        Ok(())
    }

    /// Give up a claimed pass that never ran. `last_sync_at` is untouched;
    /// `last_error` is only replaced when `error` is given.
    pub fn release_sync(&self, user_id: &str, error: Option<&str>) -> Result<(), DatabaseError> {
        self.conn().execute(
            "UPDATE sync_state SET status = 'idle', last_error = COALESCE(?1, last_error), updated_at = ?2
             WHERE user_id = ?3 AND status = 'syncing'",
            params![error, stamp(Utc::now()), user_id],
        )?;
        Ok(())
    }

    /// Reset rows left in `syncing` by a process that died mid-pass. Rows
    /// with a heartbeat at or after `stale_before` belong to a live pass and
    /// are left alone.
    pub fn reset_interrupted_syncs(&self, stale_before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE sync_state SET status = 'idle', last_error = 'sync interrupted', updated_at = ?1
             WHERE status = 'syncing' AND updated_at < ?2",
            params![stamp(Utc::now()), stamp(stale_before)],
        )?;
        Ok(changed)
    }

    // -- leases -------------------------------------------------------------

    /// Take the `(user, provider)` lease for `holder` until `expires_at`.
    /// Succeeds if the lease is free, expired or already held by `holder`.
    pub fn try_acquire_lease(
        &self,
        user_id: &str,
        provider: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "INSERT INTO user_leases (user_id, provider, holder, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, provider) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE user_leases.holder = excluded.holder OR user_leases.expires_at < ?5",
            params![user_id, provider, holder, stamp(expires_at), stamp(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// Extend a lease `holder` still owns. Returns `false` if it was lost.
    pub fn renew_lease(
        &self,
        user_id: &str,
        provider: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE user_leases SET expires_at = ?1
             WHERE user_id = ?2 AND provider = ?3 AND holder = ?4",
            params![stamp(expires_at), user_id, provider, holder],
        )?;
        Ok(changed > 0)
    }

    pub fn release_lease(
        &self,
        user_id: &str,
        provider: &str,
        holder: &str,
    ) -> Result<(), DatabaseError> {
        self.conn().execute(
            "DELETE FROM user_leases WHERE user_id = ?1 AND provider = ?2 AND holder = ?3",
            params![user_id, provider, holder],
        )?;
        Ok(())
    }

    // -- conflicts ----------------------------------------------------------

    /// Unresolved conflicts for the user, oldest first.
    pub fn list_unresolved_conflicts(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConflictRecord>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM conflicts WHERE user_id = ?1 AND resolved_at IS NULL
             ORDER BY created_at, id",
            CONFLICT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], conflict_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// A conflict by id, only if it belongs to the user.
    pub fn get_conflict(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<ConflictRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM conflicts WHERE id = ?1 AND user_id = ?2",
            CONFLICT_COLUMNS
        );
        let row = self
            .conn()
            .query_row(&sql, params![id, user_id], conflict_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn count_unresolved_conflicts(&self, user_id: &str) -> Result<i64, DatabaseError> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM conflicts WHERE user_id = ?1 AND resolved_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- audit_log ----------------------------------------------------------

    /// Append an audit row for the user.
    pub fn insert_audit(
        &self,
        user_id: &str,
        action: AuditAction,
        details: Option<&str>,
        success: bool,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (user_id, action, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, action.as_str(), details, success, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent audit rows for the user, newest first.
    pub fn list_audit(&self, user_id: &str, limit: u32) -> Result<Vec<AuditEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, action, details, success, created_at
             FROM audit_log WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    action: row.get(2)?,
                    details: row.get(3)?,
                    success: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
