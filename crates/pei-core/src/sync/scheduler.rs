use crate::error::{Result, SyncError};
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::engine::{CycleReport, ReconciliationEngine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Snapshot of the sync layer published to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub dead_letters: usize,
    pub last_error: Option<String>,
    pub last_report: Option<CycleReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Cycles ran; the report of the last one
    Completed(CycleReport),
    /// Another caller was already running a cycle and will run once more
    Coalesced,
}

#[derive(Default)]
struct Flight {
    running: bool,
    rerun: bool,
}

/// Clears the in-flight flag even if the running future is dropped.
struct FlightGuard<'a>(&'a Mutex<Flight>);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut flight = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        flight.running = false;
        flight.rerun = false;
    }
}

/// Runs at most one reconciliation cycle at a time.
pub struct SyncScheduler {
    engine: Arc<ReconciliationEngine>,
    monitor: Arc<ConnectivityMonitor>,
    flight: Mutex<Flight>,
    status: watch::Sender<SyncStatus>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, monitor: Arc<ConnectivityMonitor>) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            online: monitor.is_online(),
            ..SyncStatus::default()
        });
        Self {
            engine,
            monitor,
            flight: Mutex::new(Flight::default()),
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Update the published status in place
    pub fn publish(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(f);
    }

    /// Run a cycle now. A call arriving while a cycle runs makes the running
    /// caller loop once more and returns `Coalesced` immediately.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }
        {
            let mut flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
            if flight.running {
                flight.rerun = true;
                debug!("Sync already running, coalescing trigger");
                return Ok(SyncOutcome::Coalesced);
            }
            flight.running = true;
        }
        let _guard = FlightGuard(&self.flight);

        loop {
            self.publish(|s| {
                s.syncing = true;
                s.online = true;
            });
            let result = self.engine.run_cycle().await;
            let report = match result {
                Ok(report) => {
                    self.publish(|s| {
                        s.syncing = false;
                        s.last_sync = DateTime::from_timestamp_millis(report.finished_at);
                        s.last_error = None;
                        s.last_report = Some(report.clone());
                    });
                    report
                }
                Err(err) => {
                    warn!("Sync cycle aborted: {}", err);
                    self.publish(|s| {
                        s.syncing = false;
                        s.last_error = Some(err.to_string());
                    });
                    return Err(err);
                }
            };

            {
                // Decide under the lock so a trigger cannot slip in after the check.
                let mut flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
                if !std::mem::take(&mut flight.rerun) || !self.monitor.is_online() {
                    flight.running = false;
                    return Ok(SyncOutcome::Completed(report));
                }
            }
            debug!("Running coalesced sync cycle");
        }
    }
}
