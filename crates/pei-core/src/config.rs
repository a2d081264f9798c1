use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the PEI sync layer
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PathsConfig {
    /// Directory holding the local replica database (defaults to ~/.local/share/pei)
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncSettings {
    /// Backend URL (if None, runs in local-only mode)
    pub server_url: Option<String>,

    /// Bearer token sent to the backend
    pub api_token: Option<String>,

    /// Periodic sync interval in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Synced records untouched for longer than this are swept from the replica
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Failed attempts before a queue entry is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Factor applied to the delay after every further failure
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for the retry delay, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// How often the connectivity probe checks the backend, in seconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,

    /// Timeout for a single remote request, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Grace period between regaining connectivity and starting a cycle
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoggingConfig {
    /// tracing-subscriber EnvFilter directive, overridden by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_sync_interval() -> u64 {
    300 // 5 minutes
}

fn default_retention_days() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_probe_interval() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            api_token: None,
            interval_seconds: default_sync_interval(),
            retention_days: default_retention_days(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            probe_interval_seconds: default_probe_interval(),
            request_timeout_seconds: default_request_timeout(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Age beyond which synced records are swept
pub fn retention_horizon(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * 24 * 60 * 60)
}

impl SyncSettings {
    /// Delay before the next attempt of an entry that has failed `retry_count` times.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32) as i32;
        let delay = self.backoff_base_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn is_local_only(&self) -> bool {
        self.server_url.as_deref().map_or(true, str::is_empty)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        // Check if config path is specified via environment variable
        if let Ok(custom_path) = std::env::var("PEI_SYNC_CONFIG") {
            return Self::load_from(&PathBuf::from(custom_path));
        }
        let config_path = Self::default_path()?;
        if !config_path.exists() {
            let default_config = Self::default();
            default_config.save_to(&config_path)?;
            return Ok(default_config);
        }
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to a specific path, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// ~/.config/pei/sync.toml regardless of platform
    pub fn default_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir.join(".config").join("pei").join("sync.toml"))
    }

    /// Directory for the replica database, using the default if not configured
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.paths.data_dir {
            return Ok(dir.clone());
        }
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir.join(".local").join("share").join("pei"))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("replica.db"))
    }

    /// Generate JSON schema for the configuration
    pub fn generate_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize schema to JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.interval_seconds, 300);
        assert_eq!(config.sync.retention_days, 30);
        assert_eq!(config.sync.max_retries, 5);
        assert!(config.sync.is_local_only());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_partial_sync_section() {
        let config: Config = toml::from_str(
            "[sync]\nserver_url = \"https://api.example.org\"\nmax_retries = 2\n",
        )
        .unwrap();
        assert_eq!(config.sync.max_retries, 2);
        assert_eq!(config.sync.backoff_base_ms, 2_000);
        assert!(!config.sync.is_local_only());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let settings = SyncSettings {
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
            ..SyncSettings::default()
        };
        assert_eq!(settings.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(settings.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(settings.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(settings.backoff_delay(4), Duration::from_millis(5_000));
        assert_eq!(settings.backoff_delay(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_retention_horizon_in_days() {
        assert_eq!(retention_horizon(30), Duration::from_secs(30 * 86_400));
        assert_eq!(retention_horizon(0), Duration::ZERO);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");
        let mut config = Config::default();
        config.sync.retention_days = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sync.retention_days, 7);
    }

    #[test]
    fn test_schema_mentions_sync_settings() {
        let schema = Config::generate_schema().unwrap();
        assert!(schema.contains("retention_days"));
    }
}
