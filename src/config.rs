/// Configuration management with TOML support.
///
/// Everything here has a working default so a node can start with no
/// configuration file at all; the CLI overrides individual fields.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::storage::DEFAULT_ROOT;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,
    /// Storage configuration
    pub storage: StorageSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the transport binds to.
    pub listen_addr: String,
    /// Peer addresses dialed at startup.
    pub bootstrap_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Filesystem root the node stores under.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is not set.
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                listen_addr: "0.0.0.0:3999".to_string(),
                bootstrap_nodes: vec![],
            },
            storage: StorageSettings {
                root: PathBuf::from(DEFAULT_ROOT),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> MeshResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| MeshError::Config(format!("cannot read {}: {err}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|err| MeshError::Config(format!("cannot parse {}: {err}", path.display())))
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> MeshResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
