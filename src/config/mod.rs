//! Configuration loading and validation.

pub mod loader;
pub mod model;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

pub use model::AppConfig;

/// Holds the validated configuration for the lifetime of the process.
pub struct ConfigManager {
    config: Arc<AppConfig>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager by loading and validating the config file.
    pub fn new(config_path: &Path) -> Result<Self> {
        let config = loader::load_and_validate(config_path)?;

        Ok(Self {
            config: Arc::new(config),
            config_path: config_path.to_path_buf(),
        })
    }

    /// Returns a shared reference to the configuration.
    pub fn get_config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    /// Returns the path to the configuration file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
