use crate::clock::Clock;
use crate::error::Result;
use crate::storage::LocalDb;
use pei_proto::EntityType;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub const LAST_SYNC_TIME: &str = "last_sync_time";
pub const RETENTION_DAYS: &str = "retention_days";

/// Settings key holding the pull cursor of a table
pub fn pull_cursor_key(entity_type: EntityType) -> String {
    format!("pull_cursor.{}", entity_type.table())
}

/// JSON-valued key/value settings persisted next to the replica.
#[derive(Clone)]
pub struct SettingsStore {
    db: LocalDb,
    clock: Arc<dyn Clock>,
}

impl SettingsStore {
    pub fn new(db: LocalDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.db.conn()?;
        Self::get_in(&conn, key)
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let conn = self.db.conn()?;
        Self::set_in(&conn, key, value, self.clock.now_millis())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub(crate) fn get_in<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|value| serde_json::from_str(&value)).transpose()?)
    }

    pub(crate) fn set_in<T: Serialize>(
        conn: &Connection,
        key: &str,
        value: &T,
        now: i64,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, now],
        )?;
        Ok(())
    }
}
