// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration persistence (save/load).

use crate::config::CoreConfig;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Manages the configuration file.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Use the per-user config directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let project_dirs = ProjectDirs::from("", "", "rtlink").ok_or(ConfigError::NoConfigDir)?;
        Self::at(project_dirs.config_dir())
    }

    /// Use an explicit config directory, creating it if needed.
    pub fn at(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir)?;
        Ok(Self { config_dir })
    }

    /// Get the path to the main config file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Load the config, falling back to defaults if no file exists.
    pub fn load_config(&self) -> Result<CoreConfig, ConfigError> {
        let path = self.config_path();
        if path.exists() {
            debug!("Loading config from {}", path.display());
            let content = fs::read_to_string(&path)?;
            Ok(CoreConfig::from_toml(&content)?)
        } else {
            Ok(CoreConfig::default())
        }
    }

    /// Save the config.
    pub fn save_config(&self, config: &CoreConfig) -> Result<(), ConfigError> {
        let content = config.to_toml()?;
        fs::write(self.config_path(), content)?;
        Ok(())
    }
}
