//! Local ↔ remote identity mapping with last-synced content hashes.
//!
//! A [`MappingStore`] borrows a connection and is scoped to one user at
//! construction, so every lookup and mutation carries that user's id. It
//! runs on whatever connection it is given, which lets the orchestrator
//! update mappings in the same transaction as the entity write they
//! describe.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::EntityType;

/// Identity correspondence plus the three-way-merge base for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub entity_type: EntityType,
    pub local_id: String,
    pub remote_id: String,
    pub last_local_hash: String,
    pub last_remote_hash: String,
    pub last_synced_at: DateTime<Utc>,
    pub deleted_locally: bool,
    pub deleted_remotely: bool,
}

impl Mapping {
    /// Neither side is tombstoned.
    pub fn is_live(&self) -> bool {
        !self.deleted_locally && !self.deleted_remotely
    }
}

/// Which id a tombstone refers to.
#[derive(Debug, Clone, Copy)]
pub enum MappingKey<'a> {
    Local(&'a str),
    Remote(&'a str),
}

/// Which side of a mapping was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

const COLUMNS: &str = "entity_type, local_id, remote_id, last_local_hash, last_remote_hash, \
     last_synced_at, deleted_locally, deleted_remotely";

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<Mapping> {
    let entity_type: String = row.get(0)?;
    let synced_at: String = row.get(5)?;
    Ok(Mapping {
        entity_type: EntityType::from_str_val(&entity_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown entity type '{}'", entity_type).into(),
            )
        })?,
        local_id: row.get(1)?,
        remote_id: row.get(2)?,
        last_local_hash: row.get(3)?,
        last_remote_hash: row.get(4)?,
        last_synced_at: DateTime::parse_from_rfc3339(&synced_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?,
        deleted_locally: row.get(6)?,
        deleted_remotely: row.get(7)?,
    })
}

/// User-scoped view over the `mappings` table.
pub struct MappingStore<'c> {
    conn: &'c Connection,
    user_id: &'c str,
}

impl<'c> MappingStore<'c> {
    pub fn new(conn: &'c Connection, user_id: &'c str) -> Self {
        Self { conn, user_id }
    }

    /// Mapping by local id; `None` when the entity is not mapped.
    pub fn get(
        &self,
        entity_type: EntityType,
        local_id: &str,
    ) -> Result<Option<Mapping>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM mappings WHERE user_id = ?1 AND entity_type = ?2 AND local_id = ?3",
            COLUMNS
        );
        let mapping = self
            .conn
            .query_row(
                &sql,
                params![self.user_id, entity_type.as_str(), local_id],
                mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    /// Mapping by remote id; `None` when the entity is not mapped.
    pub fn get_by_remote(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<Mapping>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM mappings WHERE user_id = ?1 AND entity_type = ?2 AND remote_id = ?3",
            COLUMNS
        );
        let mapping = self
            .conn
            .query_row(
                &sql,
                params![self.user_id, entity_type.as_str(), remote_id],
                mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    /// Every mapping of one entity type, including tombstoned ones.
    pub fn list(&self, entity_type: EntityType) -> Result<Vec<Mapping>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM mappings WHERE user_id = ?1 AND entity_type = ?2 ORDER BY id",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![self.user_id, entity_type.as_str()], mapping_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Create or update the mapping for `local_id`, clearing any tombstones.
    ///
    /// Returns `false` when the stored row already held exactly these values,
    /// in which case nothing (not even `last_synced_at`) is written.
    pub fn upsert(
        &self,
        entity_type: EntityType,
        local_id: &str,
        remote_id: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "INSERT INTO mappings
                (user_id, entity_type, local_id, remote_id, last_local_hash, last_remote_hash, last_synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, entity_type, local_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                last_local_hash = excluded.last_local_hash,
                last_remote_hash = excluded.last_remote_hash,
                last_synced_at = excluded.last_synced_at,
                deleted_locally = 0,
                deleted_remotely = 0
             WHERE mappings.remote_id != excluded.remote_id
                OR mappings.last_local_hash != excluded.last_local_hash
                OR mappings.last_remote_hash != excluded.last_remote_hash
                OR mappings.deleted_locally != 0
                OR mappings.deleted_remotely != 0",
            params![
                self.user_id,
                entity_type.as_str(),
                local_id,
                remote_id,
                local_hash,
                remote_hash,
                now
            ],
        )?;
        if changed > 0 {
            debug!(user_id = self.user_id, %entity_type, local_id, remote_id, "mapping upserted");
        }
        Ok(changed > 0)
    }

    /// Point an existing mapping at a new remote id (the remote copy was
    /// recreated) and record fresh hashes.
    pub fn rebind_remote(
        &self,
        entity_type: EntityType,
        local_id: &str,
        remote_id: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<(), DatabaseError> {
        self.upsert(entity_type, local_id, remote_id, local_hash, remote_hash)?;
        Ok(())
    }

    /// Point an existing mapping at a new local id (the local copy was
    /// recreated) and record fresh hashes.
    pub fn rebind_local(
        &self,
        entity_type: EntityType,
        old_local_id: &str,
        new_local_id: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE mappings
             SET local_id = ?1, last_local_hash = ?2, last_remote_hash = ?3, last_synced_at = ?4,
                 deleted_locally = 0, deleted_remotely = 0
             WHERE user_id = ?5 AND entity_type = ?6 AND local_id = ?7",
            params![
                new_local_id,
                local_hash,
                remote_hash,
                now,
                self.user_id,
                entity_type.as_str(),
                old_local_id
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "mapping".into(),
                id: format!("{}/{}", entity_type, old_local_id),
            });
        }
        Ok(())
    }

    /// Record the hashes of a completed sync step.
    pub fn update_hashes(
        &self,
        entity_type: EntityType,
        local_id: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE mappings SET last_local_hash = ?1, last_remote_hash = ?2, last_synced_at = ?3
             WHERE user_id = ?4 AND entity_type = ?5 AND local_id = ?6",
            params![
                local_hash,
                remote_hash,
                now,
                self.user_id,
                entity_type.as_str(),
                local_id
            ],
        )?;
        Ok(())
    }

    /// Tombstone one side. A mapping tombstoned on both sides is removed.
    /// Returns `true` if the row was physically removed.
    pub fn mark_deleted(
        &self,
        entity_type: EntityType,
        key: MappingKey<'_>,
        side: Side,
    ) -> Result<bool, DatabaseError> {
        let column = match side {
            Side::Local => "deleted_locally",
            Side::Remote => "deleted_remotely",
        };
        let (key_column, key_value) = match key {
            MappingKey::Local(id) => ("local_id", id),
            MappingKey::Remote(id) => ("remote_id", id),
        };

        self.conn.execute(
            &format!(
                "UPDATE mappings SET {} = 1 WHERE user_id = ?1 AND entity_type = ?2 AND {} = ?3",
                column, key_column
            ),
            params![self.user_id, entity_type.as_str(), key_value],
        )?;

        let removed = self.conn.execute(
            &format!(
                "DELETE FROM mappings
                 WHERE user_id = ?1 AND entity_type = ?2 AND {} = ?3
                   AND deleted_locally = 1 AND deleted_remotely = 1",
                key_column
            ),
            params![self.user_id, entity_type.as_str(), key_value],
        )?;
        if removed > 0 {
            debug!(user_id = self.user_id, %entity_type, key = key_value, "mapping removed");
        }
        Ok(removed > 0)
    }

    /// Remove a mapping outright.
    pub fn remove(&self, entity_type: EntityType, local_id: &str) -> Result<bool, DatabaseError> {
        let removed = self.conn.execute(
            "DELETE FROM mappings WHERE user_id = ?1 AND entity_type = ?2 AND local_id = ?3",
            params![self.user_id, entity_type.as_str(), local_id],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn synced_at(conn: &Connection) -> String {
        conn.query_row("SELECT last_synced_at FROM mappings", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_absent_is_not_an_error() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");
        assert!(store.get(EntityType::Task, "5").unwrap().is_none());
        assert!(store.get_by_remote(EntityType::Task, "T1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_and_lookup_both_ways() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");

        assert!(store.upsert(EntityType::Task, "5", "T1", "h1", "h1").unwrap());
        let by_local = store.get(EntityType::Task, "5").unwrap().unwrap();
        let by_remote = store.get_by_remote(EntityType::Task, "T1").unwrap().unwrap();
        assert_eq!(by_local, by_remote);
        assert_eq!(by_local.last_local_hash, "h1");
        assert!(by_local.is_live());

        // Another entity type with the same ids is a separate mapping.
        assert!(store.get(EntityType::List, "5").unwrap().is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");

        assert!(store.upsert(EntityType::Task, "5", "T1", "h1", "h2").unwrap());
        let first = synced_at(&conn);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!store.upsert(EntityType::Task, "5", "T1", "h1", "h2").unwrap());
        assert_eq!(synced_at(&conn), first);

        assert!(store.upsert(EntityType::Task, "5", "T1", "h3", "h3").unwrap());
    }

    #[test]
    fn test_remote_id_is_unique_per_user() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");
        store.upsert(EntityType::Task, "5", "T1", "h", "h").unwrap();
        assert!(store.upsert(EntityType::Task, "6", "T1", "h", "h").is_err());

        // A different user may map the same remote id.
        let other = MappingStore::new(&conn, "u2");
        assert!(other.upsert(EntityType::Task, "6", "T1", "h", "h").unwrap());
    }

    #[test]
    fn test_mappings_are_user_scoped() {
        let db = test_db();
        let conn = db.conn();
        MappingStore::new(&conn, "u1")
            .upsert(EntityType::Task, "5", "T1", "h", "h")
            .unwrap();

        let other = MappingStore::new(&conn, "u2");
        assert!(other.get(EntityType::Task, "5").unwrap().is_none());
        assert!(other.list(EntityType::Task).unwrap().is_empty());
        assert!(!other
            .mark_deleted(EntityType::Task, MappingKey::Local("5"), Side::Local)
            .unwrap());
        assert!(MappingStore::new(&conn, "u1")
            .get(EntityType::Task, "5")
            .unwrap()
            .unwrap()
            .is_live());
    }

    #[test]
    fn test_mark_deleted_both_sides_removes() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");
        store.upsert(EntityType::Label, "1", "L1", "h", "h").unwrap();

        assert!(!store
            .mark_deleted(EntityType::Label, MappingKey::Local("1"), Side::Local)
            .unwrap());
        let tombstoned = store.get(EntityType::Label, "1").unwrap().unwrap();
        assert!(tombstoned.deleted_locally);
        assert!(!tombstoned.is_live());

        assert!(store
            .mark_deleted(EntityType::Label, MappingKey::Remote("L1"), Side::Remote)
            .unwrap());
        assert!(store.get(EntityType::Label, "1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_clears_tombstones() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");
        store.upsert(EntityType::Task, "5", "T1", "h", "h").unwrap();
        store
            .mark_deleted(EntityType::Task, MappingKey::Local("5"), Side::Local)
            .unwrap();
        assert!(store.upsert(EntityType::Task, "5", "T1", "h", "h").unwrap());
        assert!(store.get(EntityType::Task, "5").unwrap().unwrap().is_live());
    }

    #[test]
    fn test_rebind_and_remove() {
        let db = test_db();
        let conn = db.conn();
        let store = MappingStore::new(&conn, "u1");
        store.upsert(EntityType::Task, "5", "T1", "a", "a").unwrap();

        store.rebind_remote(EntityType::Task, "5", "T9", "b", "b").unwrap();
        assert!(store.get_by_remote(EntityType::Task, "T1").unwrap().is_none());
        assert_eq!(
            store.get(EntityType::Task, "5").unwrap().unwrap().remote_id,
            "T9"
        );

        store.rebind_local(EntityType::Task, "5", "8", "c", "c").unwrap();
        assert!(store.get(EntityType::Task, "5").unwrap().is_none());
        assert_eq!(
            store.get_by_remote(EntityType::Task, "T9").unwrap().unwrap().local_id,
            "8"
        );
        assert!(store.rebind_local(EntityType::Task, "5", "9", "c", "c").is_err());

        store.update_hashes(EntityType::Task, "8", "d", "e").unwrap();
        let m = store.get(EntityType::Task, "8").unwrap().unwrap();
        assert_eq!((m.last_local_hash.as_str(), m.last_remote_hash.as_str()), ("d", "e"));

        assert!(store.remove(EntityType::Task, "8").unwrap());
        assert!(store.list(EntityType::Task).unwrap().is_empty());
    }
}
