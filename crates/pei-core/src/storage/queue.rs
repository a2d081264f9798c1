use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::storage::LocalDb;
use pei_proto::EntityType;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const COLUMNS: &str = "seq, id, entity_type, entity_id, operation, payload, last_modified, \
    created_at, retry_count, last_error, next_attempt_at, dead_lettered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// A durable record of one local mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    /// Insertion order; delivery follows it even if the wall clock steps back
    pub seq: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Full snapshot of the record at enqueue time
    pub payload: Value,
    /// The record's `last_modified` at enqueue time
    pub last_modified: i64,
    pub created_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Not attempted again before this instant (ms)
    pub next_attempt_at: Option<i64>,
    pub dead_lettered: bool,
}

impl QueueEntry {
    /// A fresh entry; `seq` is assigned on insert.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
        last_modified: i64,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            last_modified,
            created_at,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            dead_lettered: false,
        }
    }

    pub fn entity_key(&self) -> (EntityType, String) {
        (self.entity_type, self.entity_id.clone())
    }

    pub fn is_ready(&self, now: i64) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

struct EntryRow {
    seq: i64,
    id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    last_modified: i64,
    created_at: i64,
    retry_count: i64,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    dead_lettered: bool,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            operation: row.get(4)?,
            payload: row.get(5)?,
            last_modified: row.get(6)?,
            created_at: row.get(7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            next_attempt_at: row.get(10)?,
            dead_lettered: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry> {
        let entity_type = EntityType::from_table(&self.entity_type).ok_or_else(|| {
            SyncError::InvalidPayload(format!("unknown entity table: {}", self.entity_type))
        })?;
        let operation = self.operation.parse().map_err(SyncError::InvalidPayload)?;
        Ok(QueueEntry {
            id: self.id,
            seq: self.seq,
            entity_type,
            entity_id: self.entity_id,
            operation,
            payload: serde_json::from_str(&self.payload)?,
            last_modified: self.last_modified,
            created_at: self.created_at,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            dead_lettered: self.dead_lettered,
        })
    }
}

/// Durable FIFO of pending mutations.
#[derive(Clone)]
pub struct SyncQueue {
    db: LocalDb,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    pub fn new(db: LocalDb, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Append a mutation stamped with the current time
    pub fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: Value,
        last_modified: i64,
    ) -> Result<QueueEntry> {
        let entry = QueueEntry::new(
            entity_type,
            entity_id,
            operation,
            payload,
            last_modified,
            self.clock.now_millis(),
        );
        let conn = self.db.conn()?;
        Self::insert_in(&conn, entry)
    }

    /// Active entries in delivery order. Entries are not removed.
    pub fn drain(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.db.conn()?;
        Self::select(&conn, "dead_lettered = 0 ORDER BY seq", params![])
    }

    pub fn get(&self, entry_id: &str) -> Result<Option<QueueEntry>> {
        let conn = self.db.conn()?;
        Self::get_in(&conn, entry_id)
    }

    /// Remove an entry after the backend accepted it
    pub fn complete(&self, entry_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        if Self::complete_in(&conn, entry_id)? {
            Ok(())
        } else {
            Err(SyncError::EntryNotFound(entry_id.to_string()))
        }
    }

    /// Record a failed attempt. Returns the new retry count.
    pub fn fail(&self, entry_id: &str, error: &str, next_attempt_at: i64) -> Result<u32> {
        let conn = self.db.conn()?;
        let retry_count: Option<i64> = conn
            .query_row(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1, last_error = ?2, next_attempt_at = ?3
                 WHERE id = ?1
                 RETURNING retry_count",
                params![entry_id, error, next_attempt_at],
                |row| row.get(0),
            )
            .optional()?;
        match retry_count {
            Some(count) => Ok(u32::try_from(count).unwrap_or(u32::MAX)),
            None => Err(SyncError::EntryNotFound(entry_id.to_string())),
        }
    }

    /// Park an entry until an operator decides what to do with it
    pub fn dead_letter(&self, entry_id: &str, error: &str) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE sync_queue
             SET dead_lettered = 1, retry_count = retry_count + 1, last_error = ?2,
                 next_attempt_at = NULL
             WHERE id = ?1",
            params![entry_id, error],
        )?;
        if changed == 0 {
            return Err(SyncError::EntryNotFound(entry_id.to_string()));
        }
        Ok(())
    }

    pub fn dead_letters(&self) -> Result<Vec<QueueEntry>> {
        let conn = self.db.conn()?;
        Self::select(&conn, "dead_lettered = 1 ORDER BY seq", params![])
    }

    /// Put a dead-lettered entry back in line with its retry state reset
    pub fn requeue(&self, entry_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE sync_queue
             SET dead_lettered = 0, retry_count = 0, last_error = NULL, next_attempt_at = NULL
             WHERE id = ?1",
            params![entry_id],
        )?;
        if changed == 0 {
            return Err(SyncError::EntryNotFound(entry_id.to_string()));
        }
        Ok(())
    }

    /// Drop an entry without delivering it
    pub fn discard(&self, entry_id: &str) -> Result<QueueEntry> {
        let conn = self.db.conn()?;
        Self::discard_in(&conn, entry_id)
    }

    /// Entities that have at least one dead-lettered entry
    pub fn dead_lettered_entities(&self) -> Result<HashSet<(EntityType, String)>> {
        Ok(self
            .dead_letters()?
            .into_iter()
            .map(|entry| (entry.entity_type, entry.entity_id))
            .collect())
    }

    /// Drop every entry, returning them
    pub fn clear(&self) -> Result<Vec<QueueEntry>> {
        self.db.transaction(|tx| Self::clear_in(tx))
    }

    /// Number of entries, dead letters included
    pub fn len(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn dead_letter_count(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE dead_lettered = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub(crate) fn insert_in(conn: &Connection, mut entry: QueueEntry) -> Result<QueueEntry> {
        conn.execute(
            "INSERT INTO sync_queue (id, entity_type, entity_id, operation, payload,
                last_modified, created_at, retry_count, last_error, next_attempt_at, dead_lettered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id,
                entry.entity_type.table(),
                entry.entity_id,
                entry.operation.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.last_modified,
                entry.created_at,
                entry.retry_count,
                entry.last_error,
                entry.next_attempt_at,
                entry.dead_lettered,
            ],
        )?;
        entry.seq = conn.last_insert_rowid();
        Ok(entry)
    }

    pub(crate) fn get_in(conn: &Connection, entry_id: &str) -> Result<Option<QueueEntry>> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM sync_queue WHERE id = ?1"),
            params![entry_id],
            EntryRow::from_row,
        )
        .optional()?
        .map(EntryRow::into_entry)
        .transpose()
    }

    pub(crate) fn complete_in(conn: &Connection, entry_id: &str) -> Result<bool> {
        let removed = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![entry_id])?;
        Ok(removed > 0)
    }

    pub(crate) fn discard_in(conn: &Connection, entry_id: &str) -> Result<QueueEntry> {
        let entry = Self::get_in(conn, entry_id)?
            .ok_or_else(|| SyncError::EntryNotFound(entry_id.to_string()))?;
        Self::complete_in(conn, entry_id)?;
        Ok(entry)
    }

    pub(crate) fn clear_in(conn: &Connection) -> Result<Vec<QueueEntry>> {
        let entries = Self::select(conn, "1 = 1 ORDER BY seq", params![])?;
        conn.execute("DELETE FROM sync_queue", [])?;
        Ok(entries)
    }

    pub(crate) fn has_entries_for_in(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.table(), entity_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Active entries of one entity in delivery order
    pub(crate) fn pending_for_in(
        conn: &Connection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<QueueEntry>> {
        Self::select(
            conn,
            "dead_lettered = 0 AND entity_type = ?1 AND entity_id = ?2 ORDER BY seq",
            params![entity_type.table(), entity_id],
        )
    }

    pub(crate) fn set_payload_in(conn: &Connection, entry_id: &str, payload: &Value) -> Result<()> {
        conn.execute(
            "UPDATE sync_queue SET payload = ?2 WHERE id = ?1",
            params![entry_id, serde_json::to_string(payload)?],
        )?;
        Ok(())
    }

    fn select(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<QueueEntry>> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sync_queue WHERE {filter}"))?;
        let rows = stmt.query_map(params, EntryRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_entry()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn queue() -> (SyncQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let db = LocalDb::open_in_memory().unwrap();
        (SyncQueue::new(db, clock.clone()), clock)
    }

    fn push(queue: &SyncQueue, id: &str, op: Operation) -> QueueEntry {
        queue
            .enqueue(EntityType::Student, id, op, json!({"id": id}), 1)
            .unwrap()
    }

    #[test]
    fn test_drain_is_fifo_and_non_destructive() {
        let (queue, clock) = queue();
        let first = push(&queue, "s1", Operation::Insert);
        // Same timestamp, ordered by seq
        let second = push(&queue, "s2", Operation::Insert);
        clock.advance(10);
        let third = push(&queue, "s1", Operation::Update);

        let ids: Vec<_> = queue.drain().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn test_drain_follows_insertion_when_clock_steps_back() {
        let (queue, clock) = queue();
        let first = push(&queue, "s1", Operation::Insert);
        clock.set(500);
        let second = push(&queue, "s1", Operation::Update);
        assert!(second.created_at < first.created_at);

        let ids: Vec<_> = queue.drain().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        let cleared: Vec<_> = queue.clear().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(cleared, vec![first.id, second.id]);
    }

    #[test]
    fn test_fail_on_missing_entry() {
        let (queue, _) = queue();
        assert!(matches!(
            queue.fail("nope", "timeout", 5_000),
            Err(SyncError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_complete_removes_entry() {
        let (queue, _) = queue();
        let entry = push(&queue, "s1", Operation::Insert);
        queue.complete(&entry.id).unwrap();
        assert!(queue.is_empty().unwrap());
        assert!(matches!(
            queue.complete(&entry.id),
            Err(SyncError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_fail_records_error_and_backoff() {
        let (queue, _) = queue();
        let entry = push(&queue, "s1", Operation::Insert);
        assert_eq!(queue.fail(&entry.id, "timeout", 5_000).unwrap(), 1);
        assert_eq!(queue.fail(&entry.id, "timeout again", 9_000).unwrap(), 2);
        let stored = queue.get(&entry.id).unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("timeout again"));
        assert_eq!(stored.next_attempt_at, Some(9_000));
        assert!(!stored.is_ready(8_999));
        assert!(stored.is_ready(9_000));
    }

    #[test]
    fn test_dead_letter_and_requeue() {
        let (queue, _) = queue();
        let entry = push(&queue, "s1", Operation::Update);
        queue.dead_letter(&entry.id, "422 invalid").unwrap();

        assert!(queue.drain().unwrap().is_empty());
        assert_eq!(queue.dead_letter_count().unwrap(), 1);
        assert!(queue
            .dead_lettered_entities()
            .unwrap()
            .contains(&(EntityType::Student, "s1".to_string())));

        queue.requeue(&entry.id).unwrap();
        let active = queue.drain().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].retry_count, 0);
        assert!(active[0].last_error.is_none());
    }

    #[test]
    fn test_discard_and_clear() {
        let (queue, _) = queue();
        let a = push(&queue, "s1", Operation::Insert);
        push(&queue, "s2", Operation::Insert);
        push(&queue, "s3", Operation::Delete);

        let discarded = queue.discard(&a.id).unwrap();
        assert_eq!(discarded.entity_id, "s1");
        assert!(queue.discard(&a.id).is_err());

        let cleared = queue.clear().unwrap();
        assert_eq!(cleared.len(), 2);
        assert_eq!(cleared[1].operation, Operation::Delete);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("upsert".parse::<Operation>().is_err());
    }
}
