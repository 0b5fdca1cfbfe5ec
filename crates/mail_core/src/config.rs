//! TOML configuration loading and the shared `[server]` section.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::server::ServerLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// The `[server]` section common to both daemons.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub socket_path: PathBuf,
    /// Client connections per worker; 0 means unlimited.
    #[serde(default = "default_max_use")]
    pub max_use: u32,
    /// Idle seconds before a worker exits; 0 disables the idle exit.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl ServerSettings {
    pub fn limits(&self) -> ServerLimits {
        ServerLimits {
            max_use: self.max_use,
            max_idle: Duration::from_secs(self.max_idle_secs),
        }
    }
}

fn default_max_use() -> u32 {
    100
}

fn default_max_idle_secs() -> u64 {
    100
}

/// Reads and deserializes one TOML config file.
pub fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
