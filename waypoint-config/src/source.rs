//! Read-and-watch access to configuration values

use async_trait::async_trait;
use std::sync::Arc;

/// Change callback, invoked with `(key, new_value)`.
pub type ConfigCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A source of string configuration values that can push changes.
///
/// Callbacks may run on any task or thread and must not block.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Current value of `key`, or `None` when it is not set.
    async fn get_string(&self, key: &str) -> Option<String>;

    /// Invoke `callback` every time `key` changes.
    fn subscribe(&self, key: &str, callback: ConfigCallback);
}
