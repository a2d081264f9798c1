use anyhow::{Context, Result};
pub use pei_core::Config;
use std::path::{Path, PathBuf};

/// Expand a leading `~/` to the home directory
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(raw))
    }
}

/// Load the daemon configuration, writing a default file when none exists yet
pub fn load_syncd_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Config::load();
    };
    if !path.exists() {
        let config = Config::default();
        config
            .save_to(path)
            .context("Failed to save default sync config")?;
        eprintln!("Created default sync config at: {}", path.display());
        return Ok(config);
    }
    Config::load_from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        let config = load_syncd_config(Some(&path)).unwrap();
        assert!(path.exists());
        assert!(config.sync.is_local_only());
    }

    #[test]
    fn test_existing_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[sync]\nserver_url = \"http://localhost:8080\"\n").unwrap();
        let config = load_syncd_config(Some(&path)).unwrap();
        assert_eq!(config.sync.server_url.as_deref(), Some("http://localhost:8080"));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/x.toml").unwrap(), PathBuf::from("/tmp/x.toml"));
        assert!(expand_path("~/x.toml").unwrap().ends_with("x.toml"));
    }
}
