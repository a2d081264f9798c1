use crate::remote::HttpRemote;
use pei_core::ConnectivityMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Polls the backend health endpoint and feeds the connectivity monitor.
pub struct ConnectivityProbe {
    remote: Arc<HttpRemote>,
    monitor: Arc<ConnectivityMonitor>,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(remote: Arc<HttpRemote>, monitor: Arc<ConnectivityMonitor>, interval: Duration) -> Self {
        Self {
            remote,
            monitor,
            interval,
        }
    }

    /// Probe once and report the result
    pub async fn check(&self) -> bool {
        let online = self.remote.is_reachable().await;
        debug!("Probed {}: {}", self.remote.health_url(), if online { "up" } else { "down" });
        self.monitor.set_online(online);
        online
    }

    /// Probe on every interval tick until the monitor shuts down
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.monitor.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthy_backend_goes_online() {
        let mut server = mockito::Server::new_async().await;
        let healthy = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let remote = Arc::new(HttpRemote::new(&server.url(), None, Duration::from_secs(2)).unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let probe = ConnectivityProbe::new(remote, monitor.clone(), Duration::from_millis(10));

        assert!(probe.check().await);
        assert!(monitor.is_online());
        healthy.assert_async().await;
    }

    #[tokio::test]
    async fn test_failing_backend_goes_offline() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(500)
            .create_async()
            .await;

        let remote = Arc::new(HttpRemote::new(&server.url(), None, Duration::from_secs(2)).unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let probe = ConnectivityProbe::new(remote, monitor.clone(), Duration::from_millis(10));

        assert!(!probe.check().await);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_spawned_probe_stops_on_shutdown() {
        let server = mockito::Server::new_async().await;
        let remote = Arc::new(HttpRemote::new(&server.url(), None, Duration::from_secs(2)).unwrap());
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let handle =
            ConnectivityProbe::new(remote, monitor.clone(), Duration::from_millis(10)).spawn();

        monitor.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
