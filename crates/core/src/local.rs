//! Seam to the host application's task/list/label store.
//!
//! The engine never owns local entities; it reads and writes them through
//! [`LocalStore`], passing the active connection so local writes commit in
//! the same transaction as the mapping update. [`SqliteLocalStore`] keeps
//! entities as JSON documents in `local_entities` and is what the daemon
//! and CLI run against.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::EntityType;

/// A local entity as seen by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntity {
    pub id: String,
    pub entity_type: EntityType,
    /// Field document in local identifier space.
    pub fields: Map<String, Value>,
    /// Soft-deleted by the user since the last pass.
    pub deleted: bool,
}

/// Access to local entities for one user.
pub trait LocalStore: Send + Sync {
    /// All entities of a type, including soft-deleted ones.
    fn list(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<LocalEntity>, DatabaseError>;

    fn get(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<LocalEntity>, DatabaseError>;

    /// Create an entity and return its new id.
    fn insert(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        fields: &Map<String, Value>,
    ) -> Result<String, DatabaseError>;

    /// Replace the synchronizable fields of an entity, leaving any other
    /// fields the host keeps untouched.
    fn update(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), DatabaseError>;

    /// Delete an entity because the remote copy was deleted.
    fn delete(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<(), DatabaseError>;
}

/// [`LocalStore`] backed by the `local_entities` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteLocalStore;

impl SqliteLocalStore {
    pub fn new() -> Self {
        Self
    }

    /// Soft-delete an entity the way the host's delete action does. The next
    /// pass sees it as a local tombstone.
    pub fn soft_delete(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<bool, DatabaseError> {
        let changed = conn.execute(
            "UPDATE local_entities SET deleted = 1, updated_at = ?1
             WHERE id = ?2 AND user_id = ?3 AND entity_type = ?4",
            params![Utc::now().to_rfc3339(), parse_id(id)?, user_id, entity_type.as_str()],
        )?;
        Ok(changed > 0)
    }
}

fn parse_id(id: &str) -> Result<i64, DatabaseError> {
    id.parse().map_err(|_| DatabaseError::NotFound {
        entity: "local entity".into(),
        id: id.to_string(),
    })
}

fn parse_fields(raw: &str) -> Result<Map<String, Value>, DatabaseError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

impl LocalStore for SqliteLocalStore {
    fn list(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<LocalEntity>, DatabaseError> {
        let mut stmt = conn.prepare(
            "SELECT id, fields, deleted FROM local_entities
             WHERE user_id = ?1 AND entity_type = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id, entity_type.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, fields, deleted)| {
                Ok(LocalEntity {
                    id: id.to_string(),
                    entity_type,
                    fields: parse_fields(&fields)?,
                    deleted,
                })
            })
            .collect()
    }

    fn get(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<LocalEntity>, DatabaseError> {
        let Ok(row_id) = id.parse::<i64>() else {
            return Ok(None);
        };
        let row = conn
            .query_row(
                "SELECT fields, deleted FROM local_entities
                 WHERE id = ?1 AND user_id = ?2 AND entity_type = ?3",
                params![row_id, user_id, entity_type.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;

        row.map(|(fields, deleted)| {
            Ok(LocalEntity {
                id: id.to_string(),
                entity_type,
                fields: parse_fields(&fields)?,
                deleted,
            })
        })
        .transpose()
    }

    fn insert(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        fields: &Map<String, Value>,
    ) -> Result<String, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO local_entities (user_id, entity_type, fields, deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![
                user_id,
                entity_type.as_str(),
                serde_json::to_string(fields)?,
                now
            ],
        )?;
        let id = conn.last_insert_rowid().to_string();
        debug!(user_id, %entity_type, local_id = %id, "local entity created");
        Ok(id)
    }

    fn update(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(), DatabaseError> {
        let existing = self
            .get(conn, user_id, entity_type, id)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: format!("local {}", entity_type),
                id: id.to_string(),
            })?;

        let mut merged = existing.fields;
        for (key, value) in fields {
            merged.insert(key.clone(), value.clone());
        }

        conn.execute(
            "UPDATE local_entities SET fields = ?1, updated_at = ?2
             WHERE id = ?3 AND user_id = ?4 AND entity_type = ?5",
            params![
                serde_json::to_string(&merged)?,
                Utc::now().to_rfc3339(),
                parse_id(id)?,
                user_id,
                entity_type.as_str()
            ],
        )?;
        Ok(())
    }

    fn delete(
        &self,
        conn: &Connection,
        user_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<(), DatabaseError> {
        let Ok(row_id) = id.parse::<i64>() else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM local_entities WHERE id = ?1 AND user_id = ?2 AND entity_type = ?3",
            params![row_id, user_id, entity_type.as_str()],
        )?;
        Ok(())
    }
}
