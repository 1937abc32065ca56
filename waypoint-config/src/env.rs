// Environment variable overrides

use crate::{ConfigError, Result};
use std::env;

/// Resolves configuration keys against environment variables.
///
/// A dotted key such as `discovery.start-retry-delay-ms` maps to
/// `<PREFIX>_DISCOVERY_START_RETRY_DELAY_MS`.
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Environment variable name for a configuration key
    pub fn var_name(&self, key: &str) -> String {
        let mapped: String = key
            .chars()
            .map(|c| match c {
                '.' | '-' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        match self.prefix {
            Some(ref prefix) => format!("{}_{}", prefix, mapped),
            None => mapped,
        }
    }

    /// Load the variable backing a configuration key
    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.var_name(key)).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}
