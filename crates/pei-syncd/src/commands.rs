use crate::config::Config;
use crate::probe::ConnectivityProbe;
use crate::remote::{HttpRemote, LocalOnlyRemote};
use anyhow::{bail, Context, Result};
use pei_core::sync::RemoteStore;
use pei_core::{LocalDb, SyncManager, SyncOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sync manager wired to the configured backend
pub struct Daemon {
    manager: Arc<SyncManager>,
    http: Option<Arc<HttpRemote>>,
    config: Config,
}

impl Daemon {
    pub fn open(config: Config) -> Result<Self> {
        let db_path = config.database_path()?;
        let db = LocalDb::open(&db_path)
            .with_context(|| format!("Failed to open replica database: {}", db_path.display()))?;

        let http = match config.sync.server_url.as_deref() {
            Some(url) if !config.sync.is_local_only() => Some(Arc::new(HttpRemote::new(
                url,
                config.sync.api_token.clone(),
                Duration::from_secs(config.sync.request_timeout_seconds),
            )?)),
            _ => None,
        };
        let remote: Arc<dyn RemoteStore> = match &http {
            Some(http) => http.clone() as Arc<dyn RemoteStore>,
            None => Arc::new(LocalOnlyRemote),
        };
        let manager = Arc::new(SyncManager::new(db, remote, config.sync.clone()));
        Ok(Self {
            manager,
            http,
            config,
        })
    }

    fn probe(&self) -> Option<ConnectivityProbe> {
        self.http.as_ref().map(|http| {
            ConnectivityProbe::new(
                http.clone(),
                self.manager.monitor(),
                Duration::from_secs(self.config.sync.probe_interval_seconds.max(1)),
            )
        })
    }

    pub async fn run(&self) -> Result<()> {
        let probe = match self.probe() {
            Some(probe) => {
                info!(
                    "Syncing to server: {}",
                    self.config.sync.server_url.as_deref().unwrap_or_default()
                );
                Some(probe.spawn())
            }
            None => {
                info!("No server configured - running in local-only mode");
                None
            }
        };

        let manager = self.manager.clone();
        let mut looping = tokio::spawn(async move { manager.run().await });
        let result = tokio::select! {
            res = &mut looping => res,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, stopping pei-syncd");
                self.manager.shutdown();
                looping.await
            }
        };
        self.manager.shutdown();
        if let Some(probe) = probe {
            probe.await?;
        }
        result??;
        Ok(())
    }

    pub async fn sync_once(&self, json: bool) -> Result<()> {
        let Some(probe) = self.probe() else {
            bail!("No server configured - nothing to sync with");
        };
        if !probe.check().await {
            bail!("Backend is unreachable, local changes stay queued");
        }
        match self.manager.sync_now().await? {
            SyncOutcome::Completed(report) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    println!(
                        "Pushed {} ({} merged, {} remote wins), deleted {}, pulled {} (+{} deletions)",
                        report.pushed,
                        report.merged,
                        report.remote_wins,
                        report.deleted,
                        report.pulled,
                        report.pulled_deletes
                    );
                    if !report.is_clean() {
                        println!(
                            "{} failed, {} dead-lettered, {} deferred, {} pull error(s)",
                            report.failed, report.dead_lettered, report.deferred, report.pull_errors
                        );
                    }
                }
            }
            SyncOutcome::Coalesced => println!("A sync is already running"),
        }
        Ok(())
    }

    pub async fn status(&self, json: bool) -> Result<()> {
        if let Some(probe) = self.probe() {
            probe.check().await;
        }
        let status = self.manager.status()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        println!("Online:          {}", if status.online { "yes" } else { "no" });
        println!(
            "Last sync:       {}",
            status
                .last_sync
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
        println!("Pending changes: {}", status.pending_changes);
        println!("Dead letters:    {}", status.dead_letters);
        println!("Retention:       {} days", self.manager.retention_days()?);
        Ok(())
    }

    pub fn dead_letters(&self, json: bool) -> Result<()> {
        let entries = self.manager.dead_letters()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        if entries.is_empty() {
            println!("No dead letters");
        }
        for entry in entries {
            println!(
                "{}  {} {} {}  attempts={}  {}",
                entry.id,
                entry.operation,
                entry.entity_type,
                entry.entity_id,
                entry.retry_count,
                entry.last_error.unwrap_or_default()
            );
        }
        Ok(())
    }

    pub fn retry(&self, entry_id: &str) -> Result<()> {
        self.manager.retry_dead_letter(entry_id)?;
        println!("Requeued {entry_id}");
        Ok(())
    }

    pub fn discard(&self, entry_id: &str) -> Result<()> {
        let entry = self.manager.discard(entry_id)?;
        println!(
            "Discarded {} of {} {}",
            entry.operation, entry.entity_type, entry.entity_id
        );
        Ok(())
    }

    pub fn clear_queue(&self, yes: bool) -> Result<()> {
        if !yes {
            bail!("Refusing to drop queued changes without --yes");
        }
        let removed = self.manager.clear_queue()?;
        println!("Removed {removed} queued change(s)");
        Ok(())
    }

    pub fn sweep(&self, json: bool) -> Result<()> {
        let removed = self.manager.sweep()?;
        if json {
            let by_table: serde_json::Map<String, serde_json::Value> = removed
                .iter()
                .map(|(ty, count)| (ty.table().to_string(), serde_json::Value::from(*count)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&by_table)?);
        } else {
            for (ty, count) in removed {
                println!("{ty}: {count} removed");
            }
        }
        Ok(())
    }
}
