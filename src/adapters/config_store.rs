use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::domain::{CoreConfig, CoreError};
use crate::ports::ConfigStore;

const APP_DIR: &str = "Parley";

/// TOML-based configuration store with OS-specific paths.
pub struct TomlConfigStore {
    data_dir: PathBuf,
    logs_dir: PathBuf,
}

impl TomlConfigStore {
    /// Create a store in the OS application directories.
    pub fn new() -> Result<Self, CoreError> {
        let data_dir = dirs::config_dir()
            .map(|p| p.join(APP_DIR))
            .ok_or_else(|| CoreError::Config("Could not find application data directory".to_string()))?;
        let logs_dir = dirs::data_local_dir()
            .map(|p| p.join(APP_DIR).join("logs"))
            .unwrap_or_else(|| data_dir.join("logs"));

        Self::at(data_dir, logs_dir)
    }

    /// Create a store rooted at explicit directories.
    pub fn at(data_dir: PathBuf, logs_dir: PathBuf) -> Result<Self, CoreError> {
        fs::create_dir_all(&data_dir)?;
        info!(data_dir = ?data_dir, "ConfigStore initialized");
        Ok(Self { data_dir, logs_dir })
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<CoreConfig, CoreError> {
        let config_path = self.config_path();

        if config_path.exists() {
            debug!(path = ?config_path, "Loading configuration");
            let content = fs::read_to_string(&config_path)?;
            let config: CoreConfig = toml::from_str(&content)?;
            info!(path = ?config_path, "Configuration loaded");
            Ok(config)
        } else {
            info!(path = ?config_path, "Configuration file not found, creating default");
            let config = CoreConfig::new();
            self.save(&config)?;
            Ok(config)
        }
    }

    fn save(&self, config: &CoreConfig) -> Result<(), CoreError> {
        let config_path = self.config_path();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&config_path, content)?;

        info!(path = ?config_path, "Configuration saved");
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn logs_dir(&self) -> PathBuf {
        self.logs_dir.clone()
    }
}
