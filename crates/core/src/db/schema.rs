//! Database schema definitions and migration runner.
//!
//! Migrations are SQL strings applied in order. The SQLite `user_version`
//! pragma records which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            user_id     TEXT NOT NULL,
            provider    TEXT NOT NULL,
            key_id      TEXT NOT NULL,
            ciphertext  BLOB NOT NULL,
            nonce       BLOB NOT NULL,
            auth_tag    BLOB NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (user_id, provider)
        );

        CREATE INDEX IF NOT EXISTS idx_credentials_key_id ON credentials (key_id);

        CREATE TABLE IF NOT EXISTS sync_state (
            user_id       TEXT PRIMARY KEY,
            status        TEXT NOT NULL DEFAULT 'idle' CHECK (status IN ('idle', 'syncing')),
            last_sync_at  TEXT,
            last_error    TEXT,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mappings (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id           TEXT    NOT NULL,
            entity_type       TEXT    NOT NULL CHECK (entity_type IN ('label', 'list', 'task')),
            local_id          TEXT    NOT NULL,
            remote_id         TEXT    NOT NULL,
            last_local_hash   TEXT    NOT NULL,
            last_remote_hash  TEXT    NOT NULL,
            last_synced_at    TEXT    NOT NULL,
            deleted_locally   INTEGER NOT NULL DEFAULT 0,
            deleted_remotely  INTEGER NOT NULL DEFAULT 0
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_local
            ON mappings (user_id, entity_type, local_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_remote
            ON mappings (user_id, entity_type, remote_id);

        CREATE TABLE IF NOT EXISTS conflicts (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            entity_type     TEXT NOT NULL,
            local_id        TEXT NOT NULL,
            remote_id       TEXT NOT NULL,
            local_payload   TEXT NOT NULL DEFAULT '',
            remote_payload  TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            resolved_at     TEXT,
            resolution      TEXT CHECK (resolution IS NULL OR resolution IN ('local', 'remote'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_unresolved
            ON conflicts (user_id, entity_type, local_id) WHERE resolved_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_conflicts_user ON conflicts (user_id, resolved_at);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT    NOT NULL,
            action      TEXT    NOT NULL,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_user ON audit_log (user_id, created_at);
        "#,
    ),
    (
        2,
        "delta cursors and local entity store",
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            user_id      TEXT NOT NULL,
            entity_type  TEXT NOT NULL,
            cursor       TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            PRIMARY KEY (user_id, entity_type)
        );

        CREATE TABLE IF NOT EXISTS local_entities (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      TEXT    NOT NULL,
            entity_type  TEXT    NOT NULL,
            fields       TEXT    NOT NULL,
            deleted      INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_local_entities_user
            ON local_entities (user_id, entity_type);
        "#,
    ),
    (
        3,
        "per-user leases shared across processes",
        r#"
        CREATE TABLE IF NOT EXISTS user_leases (
            user_id     TEXT NOT NULL,
            provider    TEXT NOT NULL,
            holder      TEXT NOT NULL,
            expires_at  TEXT NOT NULL,
            PRIMARY KEY (user_id, provider)
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = latest_version(),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied");
        }
    }

    Ok(())
}

/// Highest migration version known to this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.0).unwrap_or(0)
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
