//! Configuration management for Waypoint
//!
//! Values are loaded from files (JSON, TOML or `key=value`), optionally
//! overridden by environment variables, and looked up by dotted key
//! (`discovery.consul.hosts`). Any key can be watched for changes through
//! [`ConfigSource::subscribe`].
//!
//! ```rust,ignore
//! use waypoint_config::*;
//!
//! let config = ConfigService::builder()
//!     .with_prefix("WAYPOINT")
//!     .add_file("config.toml")
//!     .build()?;
//!
//! let hosts = config.get_or("discovery.consul.hosts", "http://localhost:8500".to_string());
//! ```

pub mod config_service;
pub mod env;
pub mod error;
pub mod loader;
pub mod source;
pub mod validation;

pub use config_service::{ConfigService, ConfigServiceBuilder};
pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use source::{ConfigCallback, ConfigSource};
pub use validation::{ConfigValidator, Validate};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Main configuration manager
#[derive(Clone)]
pub struct ConfigManager {
    values: Arc<RwLock<Map<String, Value>>>,
    env: Option<EnvLoader>,
    subscribers: Arc<RwLock<HashMap<String, Vec<ConfigCallback>>>>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self {
            values: Arc::new(RwLock::new(Map::new())),
            env: None,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create with environment variable prefix. Matching variables take
    /// precedence over loaded values.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            env: Some(EnvLoader::new(Some(prefix.into()))),
            ..Self::new()
        }
    }

    /// Load `.env` into the process environment
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok(); // Ignore if .env doesn't exist
        }
        Ok(())
    }

    /// Load configuration from file
    pub fn load_file(&self, path: impl AsRef<Path>, format: FileFormat) -> Result<()> {
        let data = ConfigLoader::new(format).load_file(path.as_ref())?;
        self.merge_value(data);
        debug!(path = %path.as_ref().display(), "Loaded configuration file");
        Ok(())
    }

    /// Load configuration from file, picking the format from its extension
    pub fn load_file_auto(&self, path: impl AsRef<Path>) -> Result<()> {
        let format = FileFormat::from_extension(
            path.as_ref()
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or_default(),
        )
        .ok_or_else(|| {
            ConfigError::LoadError(format!(
                "Unsupported configuration file: {}",
                path.as_ref().display()
            ))
        })?;
        self.load_file(path, format)
    }

    fn merge_value(&self, data: Value) {
        if let Value::Object(map) = data {
            merge_tables(&mut self.values.write(), map);
        }
    }

    /// Set a configuration value and notify subscribers of `key`
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        let notified = value_to_string(&json_value);

        {
            let mut values = self.values.write();
            insert_path(&mut values, key, json_value);
        }

        let callbacks = self
            .subscribers
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            callback(key, &notified);
        }

        Ok(())
    }

    /// Register a change callback for `key`
    pub fn subscribe(&self, key: &str, callback: ConfigCallback) {
        self.subscribers
            .write()
            .entry(key.to_string())
            .or_default()
            .push(callback);
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(ref env) = self.env {
            if let Ok(value) = env.load_var(key) {
                return Some(Value::String(value));
            }
        }

        let values = self.values.read();
        if let Some(value) = values.get(key) {
            return Some(value.clone());
        }

        let mut segments = key.split('.');
        let mut current = values.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current.clone())
    }

    /// Get a configuration value
    ///
    /// String values (as they arrive from environment variables) are also
    /// tried as JSON literals, so `"30"` reads as a number.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .lookup(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))?;

        match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => Ok(parsed),
            Err(e) => {
                if let Value::String(ref raw) = value {
                    if let Ok(literal) = serde_json::from_str::<Value>(raw) {
                        if let Ok(parsed) = serde_json::from_value(literal) {
                            return Ok(parsed);
                        }
                    }
                }
                Err(ConfigError::DeserializationError {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Get a configuration value with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Get a value rendered as a string; numbers and booleans are formatted
    pub fn get_string(&self, key: &str) -> Result<String> {
        match self.lookup(key) {
            Some(Value::Null) | None => Err(ConfigError::KeyNotFound(key.to_string())),
            Some(value) => Ok(value_to_string(&value)),
        }
    }

    /// Get an integer value
    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.get(key)
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Check if a key exists
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigSource for ConfigManager {
    async fn get_string(&self, key: &str) -> Option<String> {
        ConfigManager::get_string(self, key).ok()
    }

    fn subscribe(&self, key: &str, callback: ConfigCallback) {
        ConfigManager::subscribe(self, key, callback)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn insert_path(root: &mut Map<String, Value>, key: &str, value: Value) {
    // Keys with a leading slash are store paths, not dotted lookups.
    if key.starts_with('/') || !key.contains('.') {
        root.insert(key.to_string(), value);
        return;
    }

    let mut segments: Vec<&str> = key.split('.').collect();
    let last = segments.pop().unwrap_or(key);
    let mut current = root;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}

/// Tables merge key by key; any other value replaces what was there
fn merge_tables(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
