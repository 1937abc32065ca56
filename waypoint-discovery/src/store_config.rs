//! Configuration values kept in the coordination store
//!
//! [`StoreConfigSource`] serves [`ConfigSource`] reads straight from the
//! backend's key/value API and turns subscriptions into long-poll watch
//! tasks. Watch tasks live until the source is dropped.

use crate::registration::Backoff;
use crate::service::ServiceBackend;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use waypoint_config::{ConfigCallback, ConfigSource};

/// [`ConfigSource`] backed by a [`ServiceBackend`]
pub struct StoreConfigSource {
    backend: Arc<dyn ServiceBackend>,
    retry_start: Duration,
    retry_max: Duration,
    // Never written; dropping it ends every watch task
    shutdown: watch::Sender<()>,
}

impl StoreConfigSource {
    pub fn new(backend: Arc<dyn ServiceBackend>) -> Self {
        Self {
            backend,
            retry_start: Duration::from_millis(500),
            retry_max: Duration::from_secs(60),
            shutdown: watch::channel(()).0,
        }
    }

    /// Set the delays used after failed watch requests
    pub fn with_retry(mut self, start: Duration, max: Duration) -> Self {
        self.retry_start = start;
        self.retry_max = max;
        self
    }
}

#[async_trait]
impl ConfigSource for StoreConfigSource {
    async fn get_string(&self, key: &str) -> Option<String> {
        match self.backend.read_key(key).await {
            Ok(kv) => kv.value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read configuration key");
                None
            }
        }
    }

    fn subscribe(&self, key: &str, callback: ConfigCallback) {
        debug!(key, backend = self.backend.name(), "Watching configuration key");
        tokio::spawn(watch_key(
            Arc::clone(&self.backend),
            key.to_string(),
            callback,
            self.shutdown.subscribe(),
            Backoff::new(self.retry_start, self.retry_max),
        ));
    }
}

async fn watch_key(
    backend: Arc<dyn ServiceBackend>,
    key: String,
    callback: ConfigCallback,
    mut shutdown: watch::Receiver<()>,
    mut backoff: Backoff,
) {
    let mut index = 0;
    let mut last: Option<String> = None;

    loop {
        let result = tokio::select! {
            result = backend.watch_key(&key, index) => result,
            _ = shutdown.changed() => break,
        };

        let pause = match result {
            Ok(kv) => {
                backoff.reset();
                // Store indexes can go backwards after a restore; start over
                index = if kv.index < index { 0 } else { kv.index };

                // A deleted key reads as empty
                let value = kv.value.unwrap_or_default();
                // The first observation is always delivered so a subscriber
                // holding an older read catches up, even to a deleted key
                let changed = last.as_deref() != Some(value.as_str());
                if changed {
                    debug!(key = %key, value = %value, "Configuration key changed");
                    callback(&key, &value);
                }
                last = Some(value);

                // Without an index the next watch would not block
                if index == 0 { backoff.current() } else { Duration::ZERO }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    key = %key,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "Configuration watch failed"
                );
                delay
            }
        };

        if !pause.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    debug!(key = %key, "Configuration watch stopped");
}
