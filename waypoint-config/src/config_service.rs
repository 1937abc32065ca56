// ConfigService - layered configuration assembled from files, .env and prefixed variables

use crate::{ConfigManager, Result};
use std::ops::Deref;
use std::path::PathBuf;
use tracing::debug;

/// Read-only view over a fully loaded [`ConfigManager`].
///
/// Typed lookups (`get`, `get_or`, `get_string`, `has`) come from the
/// manager through `Deref`.
#[derive(Clone, Default)]
pub struct ConfigService {
    manager: ConfigManager,
}

impl ConfigService {
    pub fn builder() -> ConfigServiceBuilder {
        ConfigServiceBuilder::default()
    }

    /// String value with surrounding whitespace removed, or `None` when the
    /// key is missing, not a string or blank.
    pub fn get_non_empty(&self, key: &str) -> Option<String> {
        self.manager
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl From<ConfigManager> for ConfigService {
    fn from(manager: ConfigManager) -> Self {
        Self { manager }
    }
}

impl Deref for ConfigService {
    type Target = ConfigManager;

    fn deref(&self) -> &ConfigManager {
        &self.manager
    }
}

/// Collects configuration sources; later files override earlier ones and
/// prefixed environment variables override all files.
#[derive(Default)]
pub struct ConfigServiceBuilder {
    prefix: Option<String>,
    dotenv: Option<Option<PathBuf>>,
    files: Vec<PathBuf>,
}

impl ConfigServiceBuilder {
    /// Environment variable prefix, e.g. `WAYPOINT` for `WAYPOINT_ENV_NAME`
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Read a `.env` file (the default lookup when `path` is `None`).
    /// A missing file is not an error.
    pub fn load_dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.dotenv = Some(path);
        self
    }

    /// Format follows the extension (`.json` or `.toml`)
    pub fn add_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn build(self) -> Result<ConfigService> {
        let manager = match self.prefix {
            Some(prefix) => ConfigManager::with_prefix(prefix),
            None => ConfigManager::new(),
        };

        if let Some(path) = self.dotenv {
            if let Err(e) = manager.load_dotenv(path.as_deref()) {
                debug!(error = %e, "No .env file loaded");
            }
        }

        for path in &self.files {
            manager.load_file_auto(path)?;
            debug!(path = %path.display(), "Loaded configuration file");
        }

        Ok(ConfigService::from(manager))
    }
}
