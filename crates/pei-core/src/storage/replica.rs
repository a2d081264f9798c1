use crate::clock::Clock;
use crate::error::Result;
use crate::models::{conflict_marker, ReplicaRecord};
use crate::storage::LocalDb;
use pei_proto::EntityType;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const COLUMNS: &str =
    "id, payload, is_synced, last_modified, deleted, sync_conflict, conflict_note, remote_updated_at";

/// Row as stored in one of the entity tables
struct RecordRow {
    id: String,
    payload: String,
    is_synced: bool,
    last_modified: i64,
    deleted: bool,
    sync_conflict: bool,
    conflict_note: Option<String>,
    remote_updated_at: Option<i64>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            is_synced: row.get(2)?,
            last_modified: row.get(3)?,
            deleted: row.get(4)?,
            sync_conflict: row.get(5)?,
            conflict_note: row.get(6)?,
            remote_updated_at: row.get(7)?,
        })
    }

    fn into_record(self, entity_type: EntityType) -> Result<ReplicaRecord> {
        Ok(ReplicaRecord {
            entity_type,
            id: self.id,
            payload: serde_json::from_str(&self.payload)?,
            is_synced: self.is_synced,
            last_modified: self.last_modified,
            deleted: self.deleted,
            sync_conflict: self.sync_conflict,
            conflict_note: self.conflict_note,
            remote_updated_at: self.remote_updated_at,
        })
    }
}

/// Durable local copy of every replicated entity.
#[derive(Clone)]
pub struct ReplicaStore {
    db: LocalDb,
    clock: Arc<dyn Clock>,
}

impl ReplicaStore {
    pub fn new(db: LocalDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Insert or replace a record as-is
    pub fn put(&self, record: &ReplicaRecord) -> Result<()> {
        let conn = self.db.conn()?;
        Self::put_in(&conn, record)
    }

    /// Live record, tombstones hidden
    pub fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<ReplicaRecord>> {
        Ok(self.get_any(entity_type, id)?.filter(|r| !r.deleted))
    }

    /// Record including tombstones
    pub fn get_any(&self, entity_type: EntityType, id: &str) -> Result<Option<ReplicaRecord>> {
        let conn = self.db.conn()?;
        Self::get_any_in(&conn, entity_type, id)
    }

    /// All live records of a type, ordered by id
    pub fn list(&self, entity_type: EntityType) -> Result<Vec<ReplicaRecord>> {
        let conn = self.db.conn()?;
        Self::select(&conn, entity_type, "deleted = 0 ORDER BY id")
    }

    /// Every record whose local state has not been confirmed by the backend,
    /// tombstones included.
    pub fn list_unsynced(&self, entity_type: EntityType) -> Result<Vec<ReplicaRecord>> {
        let conn = self.db.conn()?;
        Self::select(&conn, entity_type, "is_synced = 0 ORDER BY last_modified, id")
    }

    /// Flag a record as synced without touching its payload. Missing records are ignored.
    pub fn mark_synced(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            &format!("UPDATE {} SET is_synced = 1 WHERE id = ?1", entity_type.table()),
            params![id],
        )?;
        Ok(())
    }

    /// Flag a record as synced only if no local write happened after `expected_last_modified`.
    pub fn mark_synced_if_unchanged(
        &self,
        entity_type: EntityType,
        id: &str,
        expected_last_modified: i64,
        remote_updated_at: Option<i64>,
    ) -> Result<bool> {
        let conn = self.db.conn()?;
        Self::mark_synced_if_unchanged_in(
            &conn,
            entity_type,
            id,
            expected_last_modified,
            remote_updated_at,
        )
    }

    /// Delete synced records not modified within `horizon`. Unsynced records
    /// and tombstones are never touched. Returns the removed count per type.
    pub fn sweep_old_synced(&self, horizon: Duration) -> Result<BTreeMap<EntityType, usize>> {
        let horizon_ms = i64::try_from(horizon.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(horizon_ms);
        let conn = self.db.conn()?;
        let mut removed = BTreeMap::new();
        for entity_type in EntityType::ALL {
            let count = conn.execute(
                &format!(
                    "DELETE FROM {} WHERE is_synced = 1 AND deleted = 0 AND last_modified < ?1",
                    entity_type.table()
                ),
                params![cutoff],
            )?;
            removed.insert(entity_type, count);
        }
        Ok(removed)
    }

    pub fn remove(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        Self::remove_in(&conn, entity_type, id)
    }

    /// Number of unsynced records across all types
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let mut total = 0usize;
        for entity_type in EntityType::ALL {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE is_synced = 0",
                    entity_type.table()
                ),
                [],
                |row| row.get(0),
            )?;
            total += usize::try_from(count).unwrap_or(0);
        }
        Ok(total)
    }

    pub(crate) fn put_in(conn: &Connection, record: &ReplicaRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    payload = excluded.payload,
                    is_synced = excluded.is_synced,
                    last_modified = excluded.last_modified,
                    deleted = excluded.deleted,
                    sync_conflict = excluded.sync_conflict,
                    conflict_note = excluded.conflict_note,
                    remote_updated_at = excluded.remote_updated_at",
                record.entity_type.table()
            ),
            params![
                record.id,
                payload,
                record.is_synced,
                record.last_modified,
                record.deleted,
                record.sync_conflict,
                record.conflict_note,
                record.remote_updated_at,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn get_any_in(
        conn: &Connection,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ReplicaRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", entity_type.table()),
                params![id],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(|r| r.into_record(entity_type)).transpose()
    }

    /// The acknowledgement is always recorded, since the backend now holds our
    /// write even when a newer local edit keeps the record dirty.
    pub(crate) fn mark_synced_if_unchanged_in(
        conn: &Connection,
        entity_type: EntityType,
        id: &str,
        expected_last_modified: i64,
        remote_updated_at: Option<i64>,
    ) -> Result<bool> {
        if let Some(acked) = remote_updated_at {
            Self::record_ack_in(conn, entity_type, id, acked)?;
        }
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET is_synced = 1
                 WHERE id = ?1 AND last_modified = ?2 AND deleted = 0",
                entity_type.table()
            ),
            params![id, expected_last_modified],
        )?;
        Ok(changed > 0)
    }

    /// Remember the backend stamp of a write we made
    pub(crate) fn record_ack_in(
        conn: &Connection,
        entity_type: EntityType,
        id: &str,
        remote_updated_at: i64,
    ) -> Result<()> {
        conn.execute(
            &format!(
                "UPDATE {} SET remote_updated_at = ?2 WHERE id = ?1",
                entity_type.table()
            ),
            params![id, remote_updated_at],
        )?;
        Ok(())
    }

    /// Replace the payload with the version agreed with the backend, if the
    /// record was not edited after `expected_last_modified`.
    pub(crate) fn apply_remote_version_in(
        conn: &Connection,
        entity_type: EntityType,
        id: &str,
        expected_last_modified: i64,
        payload: &Value,
        remote_updated_at: i64,
    ) -> Result<bool> {
        let (sync_conflict, conflict_note) = conflict_marker(payload);
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET payload = ?3, is_synced = 1, sync_conflict = ?4,
                    conflict_note = ?5, remote_updated_at = ?6
                 WHERE id = ?1 AND last_modified = ?2 AND deleted = 0",
                entity_type.table()
            ),
            params![
                id,
                expected_last_modified,
                serde_json::to_string(payload)?,
                sync_conflict,
                conflict_note,
                remote_updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Drop a tombstone once its deletion reached the backend, unless the id
    /// was written again in the meantime.
    pub(crate) fn remove_tombstone_in(
        conn: &Connection,
        entity_type: EntityType,
        id: &str,
        expected_last_modified: i64,
    ) -> Result<bool> {
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND deleted = 1 AND last_modified = ?2",
                entity_type.table()
            ),
            params![id, expected_last_modified],
        )?;
        Ok(removed > 0)
    }

    /// Mark a record as matching the backend after its pending changes were
    /// abandoned. A tombstone is revived, since the deletion never happened remotely.
    pub(crate) fn settle_in(conn: &Connection, entity_type: EntityType, id: &str) -> Result<()> {
        conn.execute(
            &format!(
                "UPDATE {} SET is_synced = 1, deleted = 0 WHERE id = ?1",
                entity_type.table()
            ),
            params![id],
        )?;
        Ok(())
    }

    pub(crate) fn remove_in(conn: &Connection, entity_type: EntityType, id: &str) -> Result<bool> {
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", entity_type.table()),
            params![id],
        )?;
        Ok(removed > 0)
    }

    fn select(
        conn: &Connection,
        entity_type: EntityType,
        filter: &str,
    ) -> Result<Vec<ReplicaRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM {} WHERE {filter}",
            entity_type.table()
        ))?;
        let rows = stmt.query_map([], RecordRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record(entity_type)?);
        }
        Ok(out)
    }
}
