use crate::clock::{Clock, SystemClock};
use crate::config::{retention_horizon, SyncSettings};
use crate::error::{Result, SyncError};
use crate::models::{ReplicaRecord, Syncable};
use crate::storage::settings::{LAST_SYNC_TIME, RETENTION_DAYS};
use crate::storage::{LocalDb, QueueEntry, ReplicaStore, SettingsStore, SyncQueue};
use crate::sync::{
    ChangeTracker, ConnectivityMonitor, EntityLocks, ReconciliationEngine, RemoteStore,
    SyncOutcome, SyncScheduler, SyncStatus,
};
use chrono::DateTime;
use pei_proto::EntityType;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Entry point of the sync layer: local CRUD, status and recovery tooling.
pub struct SyncManager {
    db: LocalDb,
    store: ReplicaStore,
    queue: SyncQueue,
    settings: SettingsStore,
    tracker: ChangeTracker,
    locks: Arc<EntityLocks>,
    monitor: Arc<ConnectivityMonitor>,
    scheduler: SyncScheduler,
    config: SyncSettings,
}

impl SyncManager {
    pub fn new(db: LocalDb, remote: Arc<dyn RemoteStore>, config: SyncSettings) -> Self {
        Self::with_clock(db, remote, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: LocalDb,
        remote: Arc<dyn RemoteStore>,
        config: SyncSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(EntityLocks::new());
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let engine = Arc::new(ReconciliationEngine::new(
            db.clone(),
            locks.clone(),
            remote,
            clock.clone(),
            config.clone(),
        ));
        Self {
            store: ReplicaStore::new(db.clone(), clock.clone()),
            queue: SyncQueue::new(db.clone(), clock.clone()),
            settings: SettingsStore::new(db.clone(), clock.clone()),
            tracker: ChangeTracker::new(db.clone(), locks.clone(), clock),
            scheduler: SyncScheduler::new(engine, monitor.clone()),
            db,
            locks,
            monitor,
            config,
        }
    }

    pub fn monitor(&self) -> Arc<ConnectivityMonitor> {
        self.monitor.clone()
    }

    pub fn create(&self, entity_type: EntityType, payload: Value) -> Result<ReplicaRecord> {
        let record = self.tracker.create(entity_type, payload)?;
        self.refresh_status()?;
        Ok(record)
    }

    pub fn update(&self, entity_type: EntityType, id: &str, partial: Value) -> Result<ReplicaRecord> {
        let record = self.tracker.update(entity_type, id, partial)?;
        self.refresh_status()?;
        Ok(record)
    }

    pub fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.tracker.delete(entity_type, id)?;
        self.refresh_status()?;
        Ok(())
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<ReplicaRecord>> {
        self.store.get(entity_type, id)
    }

    pub fn list(&self, entity_type: EntityType) -> Result<Vec<ReplicaRecord>> {
        self.store.list(entity_type)
    }

    pub fn create_typed<T: Syncable>(&self, value: &T) -> Result<T> {
        let record = self.create(T::ENTITY, serde_json::to_value(value)?)?;
        Ok(record.decode()?)
    }

    /// Write every field of `value` over the stored record with the same id
    pub fn update_typed<T: Syncable>(&self, value: &T) -> Result<T> {
        let record = self.update(T::ENTITY, value.id(), serde_json::to_value(value)?)?;
        Ok(record.decode()?)
    }

    pub fn get_typed<T: Syncable>(&self, id: &str) -> Result<Option<T>> {
        self.get(T::ENTITY, id)?
            .map(|record| record.decode().map_err(SyncError::from))
            .transpose()
    }

    pub fn list_typed<T: Syncable>(&self) -> Result<Vec<T>> {
        self.list(T::ENTITY)?
            .iter()
            .map(|record| record.decode().map_err(SyncError::from))
            .collect()
    }

    /// Records with local changes not yet confirmed by the backend
    pub fn pending_changes(&self) -> Result<usize> {
        self.store.pending_count()
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.refresh_status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.scheduler.subscribe()
    }

    /// Run a reconciliation cycle now. Fails with `Offline` without connectivity.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        let outcome = self.scheduler.sync_now().await;
        self.refresh_status()?;
        outcome
    }

    pub fn dead_letters(&self) -> Result<Vec<QueueEntry>> {
        self.queue.dead_letters()
    }

    /// Give a dead-lettered entry another round of attempts
    pub fn retry_dead_letter(&self, entry_id: &str) -> Result<()> {
        match self.queue.get(entry_id)? {
            Some(entry) if entry.dead_lettered => {
                self.queue.requeue(entry_id)?;
                info!(
                    "Requeued {} of {} {}",
                    entry.operation, entry.entity_type, entry.entity_id
                );
                self.refresh_status()?;
                Ok(())
            }
            _ => Err(SyncError::EntryNotFound(entry_id.to_string())),
        }
    }

    /// Abandon a queued change. When it was the entity's last pending entry the
    /// record is considered in sync again (a tombstone is revived).
    pub fn discard(&self, entry_id: &str) -> Result<QueueEntry> {
        let entry = self
            .queue
            .get(entry_id)?
            .ok_or_else(|| SyncError::EntryNotFound(entry_id.to_string()))?;
        let discarded = self
            .locks
            .with_entity(entry.entity_type, &entry.entity_id, || {
                self.db.transaction(|tx| {
                    let discarded = SyncQueue::discard_in(tx, entry_id)?;
                    if !SyncQueue::has_entries_for_in(tx, entry.entity_type, &entry.entity_id)? {
                        ReplicaStore::settle_in(tx, entry.entity_type, &entry.entity_id)?;
                    }
                    Ok(discarded)
                })
            })?;
        warn!(
            "Discarded {} of {} {}",
            discarded.operation, discarded.entity_type, discarded.entity_id
        );
        self.refresh_status()?;
        Ok(discarded)
    }

    /// Drop every queued change. Returns the number of entries removed.
    pub fn clear_queue(&self) -> Result<usize> {
        let removed = self.db.transaction(|tx| {
            let entries = SyncQueue::clear_in(tx)?;
            let entities: BTreeSet<_> = entries.iter().map(QueueEntry::entity_key).collect();
            for (entity_type, id) in &entities {
                ReplicaStore::settle_in(tx, *entity_type, id)?;
            }
            Ok(entries.len())
        })?;
        warn!("Cleared {} queued change(s)", removed);
        self.refresh_status()?;
        Ok(removed)
    }

    /// Retention window in days; a value stored in the settings table wins over the config file.
    pub fn retention_days(&self) -> Result<u32> {
        Ok(self
            .settings
            .get::<u32>(RETENTION_DAYS)?
            .unwrap_or(self.config.retention_days))
    }

    pub fn set_retention_days(&self, days: u32) -> Result<()> {
        self.settings.set(RETENTION_DAYS, &days)
    }

    /// Remove synced records older than the retention window
    pub fn sweep(&self) -> Result<BTreeMap<EntityType, usize>> {
        let days = self.retention_days()?;
        let removed = self.store.sweep_old_synced(retention_horizon(days))?;
        let total: usize = removed.values().sum();
        if total > 0 {
            info!("Swept {} synced record(s) older than {} days", total, days);
        }
        Ok(removed)
    }

    /// Stop the sync loop and cancel pending waits
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }

    /// Drive syncs until `shutdown`: after each reconnect, on every interval
    /// tick while online, and sweep old records periodically.
    pub async fn run(&self) -> Result<()> {
        let mut reconnects = self.monitor.reconnects();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeper = tokio::time::interval(SWEEP_INTERVAL);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reconnect_delay = Duration::from_millis(self.config.reconnect_delay_ms);

        info!("Sync loop started");
        loop {
            tokio::select! {
                _ = self.monitor.cancelled() => break,
                event = reconnects.next() => {
                    if event.is_none() {
                        break;
                    }
                    tokio::select! {
                        _ = self.monitor.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    self.sync_logged("reconnect").await;
                }
                _ = ticker.tick() => {
                    if self.monitor.is_online() {
                        self.sync_logged("interval").await;
                    }
                }
                _ = sweeper.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!("Retention sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Sync loop stopped");
        Ok(())
    }

    async fn sync_logged(&self, trigger: &str) {
        tokio::select! {
            _ = self.monitor.cancelled() => {}
            result = self.sync_now() => match result {
                Ok(SyncOutcome::Completed(report)) => {
                    debug!("Sync after {} finished: {:?}", trigger, report);
                }
                Ok(SyncOutcome::Coalesced) => {}
                Err(SyncError::Offline) => debug!("Skipping {} sync while offline", trigger),
                Err(e) => warn!("Sync after {} failed: {}", trigger, e),
            },
        }
    }

    fn refresh_status(&self) -> Result<SyncStatus> {
        let pending = self.store.pending_count()?;
        let dead_letters = self.queue.dead_letter_count()?;
        let last_sync: Option<i64> = self.settings.get(LAST_SYNC_TIME)?;
        let online = self.monitor.is_online();
        self.scheduler.publish(|status| {
            status.online = online;
            status.pending_changes = pending;
            status.dead_letters = dead_letters;
            if let Some(ms) = last_sync {
                status.last_sync = DateTime::from_timestamp_millis(ms);
            }
        });
        Ok(self.scheduler.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sync::InMemoryRemote;
    use serde_json::json;

    fn manager() -> (SyncManager, Arc<InMemoryRemote>) {
        let remote = Arc::new(InMemoryRemote::new());
        let manager = SyncManager::with_clock(
            LocalDb::open_in_memory().unwrap(),
            remote.clone(),
            SyncSettings::default(),
            Arc::new(ManualClock::new(1_000)),
        );
        (manager, remote)
    }

    #[test]
    fn test_status_counts_pending_changes() {
        let (manager, _) = manager();
        manager
            .create(EntityType::Student, json!({"id": "s1", "name": "Ana"}))
            .unwrap();
        let status = manager.status().unwrap();
        assert_eq!(status.pending_changes, 1);
        assert!(!status.online);
        assert!(status.last_sync.is_none());
        assert_eq!(manager.subscribe_status().borrow().pending_changes, 1);
    }

    #[tokio::test]
    async fn test_sync_now_offline_is_an_error() {
        let (manager, remote) = manager();
        manager
            .create(EntityType::Student, json!({"id": "s1", "name": "Ana"}))
            .unwrap();
        assert!(matches!(manager.sync_now().await, Err(SyncError::Offline)));
        assert_eq!(remote.count(EntityType::Student), 0);
        assert_eq!(manager.pending_changes().unwrap(), 1);
    }

    #[test]
    fn test_discard_settles_record_and_revives_tombstone() {
        let (manager, _) = manager();
        manager
            .create(EntityType::Student, json!({"id": "s1", "name": "Ana"}))
            .unwrap();
        manager.delete(EntityType::Student, "s1").unwrap();

        let entries = manager.queue.drain().unwrap();
        manager.discard(&entries[1].id).unwrap();
        // The insert is still pending, so the tombstone stays
        assert!(manager.get(EntityType::Student, "s1").unwrap().is_none());

        manager.discard(&entries[0].id).unwrap();
        let record = manager.get(EntityType::Student, "s1").unwrap().unwrap();
        assert!(record.is_synced);
        assert_eq!(manager.pending_changes().unwrap(), 0);
        assert!(matches!(
            manager.discard(&entries[0].id),
            Err(SyncError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_clear_queue_keeps_invariant() {
        let (manager, _) = manager();
        manager
            .create(EntityType::Goal, json!({"id": "g1", "description": "Read"}))
            .unwrap();
        manager
            .update(EntityType::Goal, "g1", json!({"notes": "weekly"}))
            .unwrap();
        assert_eq!(manager.clear_queue().unwrap(), 2);
        assert_eq!(manager.pending_changes().unwrap(), 0);
        assert_eq!(manager.queue.len().unwrap(), 0);
    }

    #[test]
    fn test_retention_override_from_settings() {
        let (manager, _) = manager();
        assert_eq!(manager.retention_days().unwrap(), 30);
        manager.set_retention_days(7).unwrap();
        assert_eq!(manager.retention_days().unwrap(), 7);
    }

    #[test]
    fn test_typed_round_trip() {
        let (manager, _) = manager();
        let student: crate::models::Student = serde_json::from_value(json!({
            "id": "s1",
            "name": "Ana",
            "school_id": "sc1",
            "tenant_id": "t1"
        }))
        .unwrap();
        let created = manager.create_typed(&student).unwrap();
        assert_eq!(created, student);
        let loaded: Option<crate::models::Student> = manager.get_typed("s1").unwrap();
        assert_eq!(loaded, Some(student.clone()));
        assert_eq!(manager.list_typed::<crate::models::Student>().unwrap().len(), 1);

        let renamed = crate::models::Student {
            name: "Ana Maria".to_string(),
            ..student
        };
        let updated = manager.update_typed(&renamed).unwrap();
        assert_eq!(updated.name, "Ana Maria");
        assert_eq!(manager.pending_changes().unwrap(), 1);
        assert_eq!(manager.queue.len().unwrap(), 2);
    }

    #[test]
    fn test_retry_requires_dead_letter() {
        let (manager, _) = manager();
        manager
            .create(EntityType::Student, json!({"id": "s1", "name": "Ana"}))
            .unwrap();
        let entry = manager.queue.drain().unwrap().remove(0);
        assert!(matches!(
            manager.retry_dead_letter(&entry.id),
            Err(SyncError::EntryNotFound(_))
        ));
        manager.queue.dead_letter(&entry.id, "rejected").unwrap();
        manager.retry_dead_letter(&entry.id).unwrap();
        assert!(manager.dead_letters().unwrap().is_empty());
    }
}
