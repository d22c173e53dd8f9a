use std::path::{Path, PathBuf};

use sessionbus_core::config::{self, BusConfig};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config {path}: {source}")]
    Load {
        path: PathBuf,
        source: sessionbus_core::Error,
    },

    #[error("Invalid store path: {0}")]
    InvalidStorePath(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings resolved from the command line.
/// Supported sources (in order of precedence):
/// - `--store` flag
/// - config file given with `--config` (JSON `BusConfig`)
/// - built-in defaults
#[derive(Debug, Clone)]
pub struct CliSettings {
    pub bus: BusConfig,
}

impl CliSettings {
    pub fn load(config_path: &Path, store: Option<&Path>) -> ConfigResult<Self> {
        let mut bus: BusConfig = if config_path.exists() {
            info!("Loading config from {}", config_path.display());
            config::from_file(config_path).map_err(|source| ConfigError::Load {
                path: config_path.to_path_buf(),
                source,
            })?
        } else {
            debug!("{} not found, using defaults", config_path.display());
            BusConfig::default()
        };

        if let Some(store) = store {
            if store.as_os_str().is_empty() {
                return Err(ConfigError::InvalidStorePath("empty path".to_string()));
            }
            bus.store.path = store.to_path_buf();
        }
        debug!("config: {:?}", bus);
        Ok(Self { bus })
    }

    pub fn store_path(&self) -> &Path {
        &self.bus.store.path
    }
}
