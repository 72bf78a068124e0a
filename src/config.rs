use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::realm::PoolingPolicy;
use crate::sync::DisconnectedAttributePolicy;

const DEFAULT_GRACE_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read engine config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid engine config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub pooling: PoolingPolicy,
    /// How long a disconnected instance keeps its realm instance and channel.
    pub grace_window_ms: u64,
    pub disconnected_attributes: DisconnectedAttributePolicy,
    /// Upper bound on concurrently live realms. `None` means unbounded.
    pub max_realms: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling: PoolingPolicy::default(),
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
            disconnected_attributes: DisconnectedAttributePolicy::default(),
            max_realms: None,
        }
    }
}

impl EngineConfig {
    /// Read the config at `config_path`, falling back to defaults when no path
    /// is given or the file does not exist.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_realms == Some(0) {
            return Err(ConfigError::Invalid(
                "max_realms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}
