use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use nodelease::LeaseConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tsidd.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("Error parsing configuration file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Invalid(#[from] nodelease::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// `redis://...` or `memory://`; unset means no store is configured
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub listen: SocketAddr,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8086)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub health: HealthConfig,
}

impl DaemonConfig {
    /// Read the configuration file.
    ///
    /// An explicitly named file must exist. Without one, the default path is
    /// tried and skipped only if it does not exist; any other read failure
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::read(path, false),
            None => Self::read(Path::new(DEFAULT_CONFIG_PATH), true),
        }
    }

    fn read(path: &Path, optional: bool) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<DaemonConfig>(&text).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if optional && e.kind() == io::ErrorKind::NotFound => DaemonConfig::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.lease.validate()?;
        Ok(config)
    }

    /// Command-line flags win over the file
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(endpoint) = &cli.store {
            self.store.endpoint = Some(endpoint.clone());
        }
        if cli.allow_degraded {
            self.lease.allow_degraded = true;
        }
    }
}
