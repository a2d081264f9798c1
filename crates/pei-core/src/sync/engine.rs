use crate::clock::{next_stamp, Clock};
use crate::config::SyncSettings;
use crate::error::{RemoteError, Result};
use crate::models::{conflict_marker, ReplicaRecord};
use crate::storage::settings::{pull_cursor_key, LAST_SYNC_TIME};
use crate::storage::{LocalDb, Operation, QueueEntry, ReplicaStore, SettingsStore, SyncQueue};
use crate::sync::locks::EntityLocks;
use crate::sync::remote::RemoteStore;
use crate::sync::resolver::{rebase_plan, resolve, Strategy};
use pei_proto::{EntityType, RemoteChange};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tally of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub pushed: usize,
    pub merged: usize,
    pub remote_wins: usize,
    pub deleted: usize,
    pub deferred: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub pulled: usize,
    pub pulled_deletes: usize,
    pub pull_errors: usize,
    /// Clock time at which the cycle finished (ms)
    pub finished_at: i64,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dead_lettered == 0 && self.pull_errors == 0
    }
}

enum Pushed {
    Accepted,
    Merged,
    RemoteWins,
    Deleted,
}

/// Pushes queued mutations to the backend in FIFO order, then pulls remote changes.
pub struct ReconciliationEngine {
    db: LocalDb,
    store: ReplicaStore,
    queue: SyncQueue,
    settings: SettingsStore,
    locks: Arc<EntityLocks>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    config: SyncSettings,
}

impl ReconciliationEngine {
    pub fn new(
        db: LocalDb,
        locks: Arc<EntityLocks>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        config: SyncSettings,
    ) -> Self {
        Self {
            store: ReplicaStore::new(db.clone(), clock.clone()),
            queue: SyncQueue::new(db.clone(), clock.clone()),
            settings: SettingsStore::new(db.clone(), clock.clone()),
            db,
            locks,
            remote,
            clock,
            config,
        }
    }

    /// Run one push + pull cycle. Failures of single entries are recorded on
    /// the queue and never abort the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        self.push(&mut report).await?;
        self.pull(&mut report).await?;
        report.finished_at = self.clock.now_millis();
        self.settings.set(LAST_SYNC_TIME, &report.finished_at)?;
        info!(
            "Sync cycle finished: {} pushed, {} merged, {} deleted, {} pulled, {} deferred, {} failed, {} dead-lettered",
            report.pushed,
            report.merged,
            report.deleted,
            report.pulled,
            report.deferred,
            report.failed,
            report.dead_lettered
        );
        Ok(report)
    }

    async fn push(&self, report: &mut CycleReport) -> Result<()> {
        let entries = self.queue.drain()?;
        let mut blocked: HashSet<(EntityType, String)> = self.queue.dead_lettered_entities()?;
        let now = self.clock.now_millis();

        for entry in entries {
            let key = entry.entity_key();
            if blocked.contains(&key) || !entry.is_ready(now) {
                debug!(
                    "Deferring {} of {} {}",
                    entry.operation, entry.entity_type, entry.entity_id
                );
                report.deferred += 1;
                blocked.insert(key);
                continue;
            }

            // Earlier entries of this cycle may have rebased or removed it.
            let entry = match self.queue.get(&entry.id)? {
                Some(fresh) if !fresh.dead_lettered => fresh,
                _ => continue,
            };
            match self.push_entry(&entry).await {
                Ok(Pushed::Accepted) => report.pushed += 1,
                Ok(Pushed::Merged) => {
                    report.pushed += 1;
                    report.merged += 1;
                }
                Ok(Pushed::RemoteWins) => report.remote_wins += 1,
                Ok(Pushed::Deleted) => report.deleted += 1,
                Err(EntryFailure::Remote(err)) => {
                    blocked.insert(key);
                    self.record_failure(&entry, &err, report)?;
                }
                Err(EntryFailure::Local(err)) => {
                    warn!(
                        "Local write-back failed for {} {}: {}",
                        entry.entity_type, entry.entity_id, err
                    );
                    blocked.insert(key);
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn push_entry(&self, entry: &QueueEntry) -> std::result::Result<Pushed, EntryFailure> {
        let ty = entry.entity_type;
        let id = entry.entity_id.as_str();

        if entry.operation == Operation::Delete {
            match self.remote.delete(ty, id).await {
                Ok(()) | Err(RemoteError::NotFound) => {}
                Err(err) => return Err(EntryFailure::Remote(err)),
            }
            self.locks.with_entity(ty, id, || {
                self.db.transaction(|tx| {
                    ReplicaStore::remove_tombstone_in(tx, ty, id, entry.last_modified)?;
                    SyncQueue::complete_in(tx, &entry.id)?;
                    Ok(())
                })
            })?;
            debug!("Deleted {} {} remotely", ty, id);
            return Ok(Pushed::Deleted);
        }

        let remote = self.remote.fetch(ty, id).await.map_err(EntryFailure::Remote)?;
        let acknowledged = self
            .store
            .get_any(ty, id)?
            .and_then(|record| record.remote_updated_at);

        let conflict = remote.filter(|r| {
            // Unchanged since our last acknowledged write is not a conflict.
            r.updated_at > entry.last_modified && Some(r.updated_at) != acknowledged
        });

        let Some(remote) = conflict else {
            let ack = self
                .remote
                .upsert(ty, &entry.payload)
                .await
                .map_err(EntryFailure::Remote)?;
            self.locks.with_entity(ty, id, || {
                self.db.transaction(|tx| {
                    ReplicaStore::mark_synced_if_unchanged_in(
                        tx,
                        ty,
                        id,
                        entry.last_modified,
                        Some(ack.updated_at),
                    )?;
                    SyncQueue::complete_in(tx, &entry.id)?;
                    Ok(())
                })
            })?;
            debug!("Pushed {} of {} {}", entry.operation, ty, id);
            return Ok(Pushed::Accepted);
        };

        let resolution = resolve(ty, &entry.payload, entry.last_modified, &remote);
        let (outcome, acked) = match resolution.strategy {
            Strategy::RemoteWins => (Pushed::RemoteWins, None),
            Strategy::LocalWins | Strategy::Merged => {
                let ack = self
                    .remote
                    .upsert(ty, &resolution.resolved_version)
                    .await
                    .map_err(EntryFailure::Remote)?;
                let outcome = if resolution.strategy == Strategy::Merged {
                    Pushed::Merged
                } else {
                    Pushed::Accepted
                };
                (outcome, Some(ack.updated_at))
            }
        };
        self.locks.with_entity(ty, id, || {
            self.db.transaction(|tx| {
                let applied = ReplicaStore::apply_remote_version_in(
                    tx,
                    ty,
                    id,
                    entry.last_modified,
                    &resolution.resolved_version,
                    acked.unwrap_or(remote.updated_at),
                )?;
                if !applied {
                    debug!("{} {} changed locally during resolution, keeping local edit", ty, id);
                    if let Some(acked) = acked {
                        ReplicaStore::record_ack_in(tx, ty, id, acked)?;
                    }
                    if resolution.strategy == Strategy::Merged {
                        rebase_pending_in(tx, ty, id, &entry.id, &resolution.resolved_version)?;
                    }
                }
                SyncQueue::complete_in(tx, &entry.id)?;
                Ok(())
            })
        })?;
        info!("Resolved conflict on {} {} as {:?}", ty, id, resolution.strategy);
        Ok(outcome)
    }

    fn record_failure(
        &self,
        entry: &QueueEntry,
        err: &RemoteError,
        report: &mut CycleReport,
    ) -> Result<()> {
        let attempts = entry.retry_count + 1;
        if err.is_transient() && attempts < self.config.max_retries {
            let delay = self.config.backoff_delay(attempts);
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let next_attempt_at = self.clock.now_millis().saturating_add(delay_ms);
            self.queue.fail(&entry.id, &err.to_string(), next_attempt_at)?;
            warn!(
                "Sync of {} {} failed (attempt {}), retrying in {:?}: {}",
                entry.entity_type, entry.entity_id, attempts, delay, err
            );
            report.failed += 1;
        } else {
            self.queue.dead_letter(&entry.id, &err.to_string())?;
            warn!(
                "Dead-lettered {} of {} {} after {} attempt(s): {}",
                entry.operation, entry.entity_type, entry.entity_id, attempts, err
            );
            report.dead_lettered += 1;
        }
        Ok(())
    }

    async fn pull(&self, report: &mut CycleReport) -> Result<()> {
        for ty in EntityType::ALL {
            let key = pull_cursor_key(ty);
            let cursor: i64 = self.settings.get(&key)?.unwrap_or(0);
            let changes = match self.remote.changes_since(ty, cursor).await {
                Ok(changes) => changes,
                Err(err) => {
                    warn!("Pull of {} failed: {}", ty, err);
                    report.pull_errors += 1;
                    continue;
                }
            };
            let mut max_seen = cursor;
            for change in changes {
                max_seen = max_seen.max(change.updated_at);
                self.apply_change(ty, &change, report)?;
            }
            if max_seen > cursor {
                self.settings.set(&key, &max_seen)?;
            }
        }
        Ok(())
    }

    /// Apply one remote change through the remote path: no queue entry, and
    /// records with pending local changes are left for the push phase.
    fn apply_change(
        &self,
        ty: EntityType,
        change: &RemoteChange,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        self.locks.with_entity(ty, &change.id, || {
            self.db.transaction(|tx| {
                let local = ReplicaStore::get_any_in(tx, ty, &change.id)?;
                if let Some(local) = &local {
                    if !local.is_synced {
                        debug!("Skipping pulled {} {}: local changes pending", ty, change.id);
                        return Ok(());
                    }
                    if local.remote_updated_at.is_some_and(|seen| seen >= change.updated_at) {
                        return Ok(());
                    }
                }
                if change.deleted {
                    if ReplicaStore::remove_in(tx, ty, &change.id)? {
                        report.pulled_deletes += 1;
                    }
                    return Ok(());
                }
                let observed_at = next_stamp(now, local.map(|r| r.last_modified));
                ReplicaStore::put_in(
                    tx,
                    &ReplicaRecord::from_remote(
                        ty,
                        change.id.clone(),
                        change.payload.clone(),
                        observed_at,
                        change.updated_at,
                    ),
                )?;
                report.pulled += 1;
                Ok(())
            })
        })
    }
}

/// Fold a merged version into the entity's later queued snapshots and its
/// dirty replica row, so the next push does not drop what the merge kept.
fn rebase_pending_in(
    conn: &Connection,
    ty: EntityType,
    id: &str,
    merged_entry: &str,
    merged: &Value,
) -> Result<()> {
    for later in SyncQueue::pending_for_in(conn, ty, id)? {
        if later.id == merged_entry || later.operation == Operation::Delete {
            continue;
        }
        SyncQueue::set_payload_in(conn, &later.id, &rebase_plan(&later.payload, merged))?;
    }
    if let Some(mut record) = ReplicaStore::get_any_in(conn, ty, id)? {
        if !record.deleted {
            record.payload = rebase_plan(&record.payload, merged);
            let (sync_conflict, conflict_note) = conflict_marker(&record.payload);
            record.sync_conflict = sync_conflict;
            record.conflict_note = conflict_note;
            ReplicaStore::put_in(conn, &record)?;
        }
    }
    Ok(())
}

enum EntryFailure {
    Remote(RemoteError),
    Local(crate::error::SyncError),
}

impl From<crate::error::SyncError> for EntryFailure {
    fn from(err: crate::error::SyncError) -> Self {
        EntryFailure::Local(err)
    }
}
