use crate::clock::{next_stamp, Clock};
use crate::error::{Result, SyncError};
use crate::models::ReplicaRecord;
use crate::storage::{LocalDb, Operation, QueueEntry, ReplicaStore, SyncQueue};
use crate::sync::locks::EntityLocks;
use pei_proto::EntityType;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Funnel for every local write: stamps the record dirty and enqueues the
/// matching mutation in the same transaction.
#[derive(Clone)]
pub struct ChangeTracker {
    db: LocalDb,
    locks: Arc<EntityLocks>,
    clock: Arc<dyn Clock>,
}

impl ChangeTracker {
    pub fn new(db: LocalDb, locks: Arc<EntityLocks>, clock: Arc<dyn Clock>) -> Self {
        Self { db, locks, clock }
    }

    /// Create a record. The id is taken from `payload.id` or generated.
    pub fn create(&self, entity_type: EntityType, payload: Value) -> Result<ReplicaRecord> {
        let mut object = into_object(payload)?;
        let id = match object.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Null) | None => uuid::Uuid::new_v4().to_string(),
            Some(other) => {
                return Err(SyncError::InvalidPayload(format!(
                    "id must be a string, got {other}"
                )))
            }
        };
        object.insert("id".to_string(), Value::String(id.clone()));
        let payload = Value::Object(object);

        self.locks.with_entity(entity_type, &id, || {
            self.db.transaction(|tx| {
                let previous = ReplicaStore::get_any_in(tx, entity_type, &id)?;
                if previous.as_ref().is_some_and(|r| !r.deleted) {
                    return Err(SyncError::AlreadyExists {
                        entity_type,
                        id: id.clone(),
                    });
                }
                let previous_stamp = previous.as_ref().map(|r| r.last_modified);
                let record = ReplicaRecord {
                    entity_type,
                    id: id.clone(),
                    payload,
                    is_synced: false,
                    last_modified: next_stamp(self.clock.now_millis(), previous_stamp),
                    deleted: false,
                    sync_conflict: false,
                    conflict_note: None,
                    remote_updated_at: previous.and_then(|r| r.remote_updated_at),
                };
                self.stage(tx, &record, Operation::Insert)?;
                Ok(record)
            })
        })
    }

    /// Shallow-merge `partial` into the current payload
    pub fn update(&self, entity_type: EntityType, id: &str, partial: Value) -> Result<ReplicaRecord> {
        let partial = into_object(partial)?;
        self.locks.with_entity(entity_type, id, || {
            self.db.transaction(|tx| {
                let mut record = live_record(tx, entity_type, id)?;
                let Value::Object(ref mut current) = record.payload else {
                    return Err(SyncError::InvalidPayload(format!(
                        "stored payload of {entity_type} {id} is not an object"
                    )));
                };
                for (key, value) in partial {
                    if key == "id" {
                        continue;
                    }
                    current.insert(key, value);
                }
                record.is_synced = false;
                record.last_modified =
                    next_stamp(self.clock.now_millis(), Some(record.last_modified));
                self.stage(tx, &record, Operation::Update)?;
                Ok(record)
            })
        })
    }

    /// Tombstone a record and enqueue its remote deletion
    pub fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.locks.with_entity(entity_type, id, || {
            self.db.transaction(|tx| {
                let mut record = live_record(tx, entity_type, id)?;
                record.deleted = true;
                record.is_synced = false;
                record.last_modified =
                    next_stamp(self.clock.now_millis(), Some(record.last_modified));
                self.stage(tx, &record, Operation::Delete)?;
                Ok(())
            })
        })
    }

    fn stage(
        &self,
        conn: &rusqlite::Connection,
        record: &ReplicaRecord,
        operation: Operation,
    ) -> Result<()> {
        ReplicaStore::put_in(conn, record)?;
        let entry = SyncQueue::insert_in(
            conn,
            QueueEntry::new(
                record.entity_type,
                &record.id,
                operation,
                record.payload.clone(),
                record.last_modified,
                self.clock.now_millis(),
            ),
        )?;
        debug!(
            "Queued {} of {} {} as entry {}",
            operation, record.entity_type, record.id, entry.id
        );
        Ok(())
    }
}

fn into_object(payload: Value) -> Result<Map<String, Value>> {
    match payload {
        Value::Object(object) => Ok(object),
        other => Err(SyncError::InvalidPayload(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn live_record(
    conn: &rusqlite::Connection,
    entity_type: EntityType,
    id: &str,
) -> Result<ReplicaRecord> {
    ReplicaStore::get_any_in(conn, entity_type, id)?
        .filter(|r| !r.deleted)
        .ok_or_else(|| SyncError::NotFound {
            entity_type,
            id: id.to_string(),
        })
}
