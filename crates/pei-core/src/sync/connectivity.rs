use crate::error::{Result, SyncError};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkState {
    online: bool,
    /// Incremented on every offline -> online transition
    reconnects: u64,
}

/// Tracks whether the backend is reachable and wakes waiters when it becomes so.
pub struct ConnectivityMonitor {
    state: watch::Sender<LinkState>,
    shutdown: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(LinkState {
            online: initially_online,
            reconnects: 0,
        });
        let (shutdown, _) = watch::channel(false);
        Self { state, shutdown }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    /// Record the outcome of a probe. Only transitions are broadcast.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            if online {
                state.reconnects += 1;
            }
            true
        });
        if changed {
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    /// Resolves once online. Fails with `Cancelled` after `shutdown`.
    pub async fn await_connection(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(SyncError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stopped| *stopped) => Err(SyncError::Cancelled),
            res = state.wait_for(|s| s.online) => res.map(|_| ()).map_err(|_| SyncError::Cancelled),
        }
    }

    /// Stream of offline -> online transitions happening after this call.
    pub fn reconnects(&self) -> Reconnects {
        let rx = self.state.subscribe();
        let seen = rx.borrow().reconnects;
        Reconnects { rx, seen }
    }

    /// Stop the monitor; pending and future waits fail with `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once `shutdown` was called.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    }
}

pub struct Reconnects {
    rx: watch::Receiver<LinkState>,
    seen: u64,
}

impl Reconnects {
    /// Wait for the next reconnect. Several reconnects between two calls
    /// collapse into one event. None once the monitor is gone.
    pub async fn next(&mut self) -> Option<()> {
        loop {
            self.rx.changed().await.ok()?;
            let state = *self.rx.borrow_and_update();
            if state.reconnects != self.seen {
                self.seen = state.reconnects;
                return Some(());
            }
        }
    }
}
