use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::ConnectionDescriptor;

/// Environment variable consulted for a password before prompting.
pub const PASSWORD_ENV: &str = "ASKDB_PASSWORD";

/// Tunables shared by introspection and execution. Durations are whole
/// seconds on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub introspection_timeout_secs: u64,
    pub max_tables: u32,
    pub introspection_concurrency: usize,
    pub default_pipeline_limit: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            query_timeout_secs: 30,
            introspection_timeout_secs: 30,
            max_tables: 100,
            introspection_concurrency: 8,
            default_pipeline_limit: 100,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn introspection_timeout(&self) -> Duration {
        Duration::from_secs(self.introspection_timeout_secs)
    }

    pub fn config_path() -> PathBuf {
        config_dir().join("settings.toml")
    }

    /// Read settings from the default location, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid settings in {}", path.display()))
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("askdb")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedConnections {
    #[serde(default)]
    connections: Vec<ConnectionDescriptor>,
}

pub fn connections_path() -> PathBuf {
    config_dir().join("connections.toml")
}

pub fn load_saved_connections() -> Result<Vec<ConnectionDescriptor>> {
    load_connections_from(&connections_path())
}

pub fn load_connections_from(path: &Path) -> Result<Vec<ConnectionDescriptor>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(path)?;
    let saved: SavedConnections = toml::from_str(&content)
        .with_context(|| format!("invalid connections file {}", path.display()))?;
    Ok(saved.connections)
}

/// Persist descriptors. Passwords are never written.
pub fn save_connections_to(path: &Path, connections: &[ConnectionDescriptor]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let saved = SavedConnections {
        connections: connections.to_vec(),
    };
    std::fs::write(path, toml::to_string_pretty(&saved)?)?;
    Ok(())
}

/// Saved connection names match case-insensitively.
pub fn find_connection<'a>(
    connections: &'a [ConnectionDescriptor],
    name: &str,
) -> Option<&'a ConnectionDescriptor> {
    connections.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}
