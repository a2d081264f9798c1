use crate::error::RemoteError;
use crate::sync::remote::RemoteStore;
use async_trait::async_trait;
use pei_proto::{EntityType, RemoteChange, RemoteRecord, UpsertAck};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredRow {
    /// None once deleted
    payload: Option<Value>,
    updated_at: i64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<EntityType, BTreeMap<String, StoredRow>>,
    now: i64,
    last_write: i64,
    offline: bool,
    fail_next: u32,
    rejected: HashSet<String>,
    calls: RemoteCalls,
}

/// Number of successful calls per method
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCalls {
    pub fetch: usize,
    pub upsert: usize,
    pub delete: usize,
    pub changes_since: usize,
}

/// Backend kept in memory, with switches to simulate outages and rejections.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server time used to stamp writes; writes still get increasing stamps.
    pub fn set_time(&self, millis: i64) {
        self.state().now = millis;
    }

    /// Every call fails with a network error while offline
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// The next `n` calls fail with a network error
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Writes touching `id` are rejected with a validation error
    pub fn reject(&self, id: &str) {
        self.state().rejected.insert(id.to_string());
    }

    pub fn accept(&self, id: &str) {
        self.state().rejected.remove(id);
    }

    /// Place a record directly on the server as if another client wrote it.
    pub fn seed(&self, entity_type: EntityType, payload: Value, updated_at: i64) {
        let mut state = self.state();
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        state.last_write = state.last_write.max(updated_at);
        state.tables.entry(entity_type).or_default().insert(
            id,
            StoredRow {
                payload: Some(payload),
                updated_at,
            },
        );
    }

    /// Delete a record as if another client did, leaving a remote tombstone.
    pub fn seed_delete(&self, entity_type: EntityType, id: &str, updated_at: i64) {
        let mut state = self.state();
        state.last_write = state.last_write.max(updated_at);
        state.tables.entry(entity_type).or_default().insert(
            id.to_string(),
            StoredRow {
                payload: None,
                updated_at,
            },
        );
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<RemoteRecord> {
        let state = self.state();
        let row = state.tables.get(&entity_type)?.get(id)?;
        Some(RemoteRecord {
            payload: row.payload.clone()?,
            updated_at: row.updated_at,
        })
    }

    /// Number of live records of a type
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.state()
            .tables
            .get(&entity_type)
            .map_or(0, |t| t.values().filter(|r| r.payload.is_some()).count())
    }

    pub fn calls(&self) -> RemoteCalls {
        self.state().calls
    }

    fn check_link(state: &mut State) -> Result<(), RemoteError> {
        if state.offline {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    fn check_rejected(state: &State, id: &str) -> Result<(), RemoteError> {
        if state.rejected.contains(id) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("record {id} failed validation"),
            });
        }
        Ok(())
    }

    fn stamp(state: &mut State) -> i64 {
        let stamp = state.now.max(state.last_write + 1);
        state.last_write = stamp;
        stamp
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        let mut state = self.state();
        Self::check_link(&mut state)?;
        state.calls.fetch += 1;
        let record = state
            .tables
            .get(&entity_type)
            .and_then(|t| t.get(id))
            .and_then(|row| {
                Some(RemoteRecord {
                    payload: row.payload.clone()?,
                    updated_at: row.updated_at,
                })
            });
        Ok(record)
    }

    async fn upsert(
        &self,
        entity_type: EntityType,
        payload: &Value,
    ) -> Result<UpsertAck, RemoteError> {
        let mut state = self.state();
        Self::check_link(&mut state)?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Rejected {
                status: 400,
                message: "payload has no id".to_string(),
            })?
            .to_string();
        Self::check_rejected(&state, &id)?;
        let updated_at = Self::stamp(&mut state);
        state.calls.upsert += 1;
        state.tables.entry(entity_type).or_default().insert(
            id,
            StoredRow {
                payload: Some(payload.clone()),
                updated_at,
            },
        );
        Ok(UpsertAck { updated_at })
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
        let mut state = self.state();
        Self::check_link(&mut state)?;
        Self::check_rejected(&state, id)?;
        let exists = state
            .tables
            .get(&entity_type)
            .and_then(|t| t.get(id))
            .is_some_and(|row| row.payload.is_some());
        if !exists {
            return Err(RemoteError::NotFound);
        }
        let updated_at = Self::stamp(&mut state);
        state.calls.delete += 1;
        state.tables.entry(entity_type).or_default().insert(
            id.to_string(),
            StoredRow {
                payload: None,
                updated_at,
            },
        );
        Ok(())
    }

    async fn changes_since(
        &self,
        entity_type: EntityType,
        cursor: i64,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        let mut state = self.state();
        Self::check_link(&mut state)?;
        state.calls.changes_since += 1;
        let mut changes: Vec<RemoteChange> = state
            .tables
            .get(&entity_type)
            .into_iter()
            .flat_map(|t| t.iter())
            .filter(|(_, row)| row.updated_at > cursor)
            .map(|(id, row)| RemoteChange {
                id: id.clone(),
                payload: row.payload.clone().unwrap_or(Value::Null),
                updated_at: row.updated_at,
                deleted: row.payload.is_none(),
            })
            .collect();
        changes.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(changes)
    }
}
