//! Global CLI configuration
//!
//! Stored in ~/.netherlink/config.json. Every field is optional in the file;
//! missing ones fall back to the relay defaults.

use anyhow::{Context, Result};
use netherlink_relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Signaling rendezvous used when neither the flag nor the config names one
pub const DEFAULT_SIGNALING_ADDR: &str = "127.0.0.1:19140";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetherlinkConfig {
    pub relay: RelayConfig,
    /// Development session file (see `dev_session`)
    pub session_file: Option<PathBuf>,
    /// Address the TCP signaling rendezvous binds to
    pub signaling_addr: String,
}

impl Default for NetherlinkConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            session_file: None,
            signaling_addr: DEFAULT_SIGNALING_ADDR.to_string(),
        }
    }
}

/// ~/.netherlink, home of the config file and the server list
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".netherlink"))
}

pub struct ConfigManager;

impl ConfigManager {
    fn get_config_path() -> Result<PathBuf> {
        Ok(data_dir()?.join("config.json"))
    }

    pub fn load() -> Result<NetherlinkConfig> {
        Self::load_from(&Self::get_config_path()?)
    }

    /// Load from `path`, or the defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<NetherlinkConfig> {
        if !path.exists() {
            return Ok(NetherlinkConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: NetherlinkConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ConfigManager::load_from(&temp.path().join("config.json")).unwrap();
        assert!(config.session_file.is_none());
        assert_eq!(config.signaling_addr, DEFAULT_SIGNALING_ADDR);
        assert_eq!(config.relay.min_protocol, 818);
    }

    #[test]
    fn test_written_config_loads() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let mut config = NetherlinkConfig::default();
        config.session_file = Some(PathBuf::from("/tmp/session.json"));
        config.relay.drain_delay = Duration::from_millis(500);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = ConfigManager::load_from(&path).unwrap();
        assert_eq!(loaded.session_file, config.session_file);
        assert_eq!(loaded.relay.drain_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"relay": {"server_name": "Home"}}"#).unwrap();

        let loaded = ConfigManager::load_from(&path).unwrap();
        assert_eq!(loaded.relay.server_name, "Home");
        assert_eq!(loaded.relay.probe_count, 3);
        assert_eq!(loaded.signaling_addr, DEFAULT_SIGNALING_ADDR);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(ConfigManager::load_from(&path).is_err());
    }
}
