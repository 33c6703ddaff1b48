//! Configuration module
//!
//! Handles loading and saving LanLink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::network::NetworkConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Beacon discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Peer transport settings
    #[serde(default)]
    pub transport: NetworkConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Friendly name announced to peers
    #[serde(default = "default_name")]
    pub name: String,
    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Locations `load_default` looks at, in order
    pub fn search_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("lanlink/config.toml")),
            Some(PathBuf::from("./lanlink.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Workshop PC".to_string(),
            debug: false,
        },
        discovery: DiscoveryConfig {
            app_id: "my-game".to_string(),
            group_id: "lobby".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
