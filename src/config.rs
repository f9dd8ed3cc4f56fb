use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Configuration document the panel provisions alongside the agent.
///
/// The runtime socket path is not part of the document; it can be
/// overridden via `KSWINGS_DOCKER_SOCKET` and otherwise follows the
/// platform default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Port the control API and session channel listen on.
    pub port: u16,
    /// Shared secret gating both the HTTP API and the channel handshake.
    pub key: String,
    /// Agent version string reported to the panel.
    pub version: String,
    /// Root under which `storage/` and `volumes/` live.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AgentConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Config file {} is not valid JSON", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Optional runtime socket override from the environment.
    pub fn docker_socket() -> Option<String> {
        std::env::var("KSWINGS_DOCKER_SOCKET").ok()
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.root.join("storage")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn states_file(&self) -> PathBuf {
        self.storage_dir().join("states.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 3002, "key": "secret", "version": "0.3.0"}"#).unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.port, 3002);
        assert_eq!(config.key, "secret");
        assert_eq!(config.root, PathBuf::from("."));
        assert!(config.states_file().ends_with("storage/states.json"));
    }

    #[test]
    fn rejects_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(AgentConfig::load(&path).is_err());
    }
}
