//! Registration lifecycle
//!
//! Each registered identity is owned by one background task that registers
//! the instance, heartbeats it every ping interval, and falls back to
//! re-registering with exponential backoff whenever a call fails.
//!
//! ```text
//! Unregistered ──register ok──▶ Registered ──heartbeat ok──▶ Registered
//!      ▲                            │
//!      │ stop                       │ any failure
//!      │                            ▼
//!      └──────────────────── FailedPendingRetry ──backoff──▶ register
//! ```

use crate::error::{DiscoveryError, Result};
use crate::service::{ServiceBackend, ServiceRegistration};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, info, warn};

/// Repeats of the same failure logged at `warn` before dropping to `debug`
const LOUD_REPEATS: u32 = 10;

/// Observable state of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
    FailedPendingRetry,
}

/// Exponential retry delay: doubles after each failure up to `max`, and
/// returns to `start` after a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    start: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff; a start delay above `max` is clamped to `max`
    pub fn new(start: Duration, max: Duration) -> Self {
        let start = start.min(max);
        Self {
            start,
            max,
            current: start,
        }
    }

    /// Delay the next failure will wait
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait after a failure; doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

/// Timing of the lifecycle loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationConfig {
    /// Wait between successful heartbeats
    pub ping_interval: Duration,

    /// First retry delay after a failure
    pub start_retry_delay: Duration,

    /// Upper bound of the retry delay
    pub max_retry_delay: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            start_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(15 * 60),
        }
    }
}

/// Logs a run of identical failures loudly first, then more quietly.
#[derive(Default)]
struct FailureLog {
    last: Option<String>,
    repeats: u32,
}

impl FailureLog {
    fn record(&mut self, id: &str, err: &DiscoveryError, retry_in: Duration) {
        let retry_ms = retry_in.as_millis() as u64;
        let level = self.level(err);
        let repeats = self.repeats;
        if level == Level::ERROR {
            error!(id, error = %err, retry_ms, "Service registration failed");
        } else if level == Level::WARN {
            warn!(id, error = %err, retry_ms, repeats, "Service registration still failing");
        } else {
            debug!(id, error = %err, retry_ms, repeats, "Service registration still failing");
        }
    }

    /// Counts `err` against the current run and picks its log level.
    /// Only transient failures go quiet; a rejected request stays visible.
    fn level(&mut self, err: &DiscoveryError) -> Level {
        let message = err.to_string();
        if self.last.as_deref() == Some(message.as_str()) {
            self.repeats = self.repeats.saturating_add(1);
        } else {
            self.last = Some(message);
            self.repeats = 0;
        }

        match self.repeats {
            0 => Level::ERROR,
            n if n <= LOUD_REPEATS || !err.is_transient() => Level::WARN,
            _ => Level::DEBUG,
        }
    }

    fn clear(&mut self) {
        self.last = None;
        self.repeats = 0;
    }
}

/// Handle to a running registration loop
///
/// Dropping the handle ends the loop after its current backend call but
/// leaves the record to expire by TTL; [`stop`](Self::stop) also deletes it.
pub struct RegistrationHandle {
    registration: ServiceRegistration,
    backend: Arc<dyn ServiceBackend>,
    stop: watch::Sender<bool>,
    state: watch::Receiver<RegistrationState>,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn id(&self) -> &str {
        self.registration.id()
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    /// Current state
    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }

    /// Stop the loop and delete the record.
    ///
    /// An in-flight backend call is allowed to finish first, so a register
    /// racing the stop cannot leave a record behind.
    pub async fn stop(self) -> Result<()> {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(id = %self.registration.id(), error = %e, "Registration task ended abnormally");
        }

        self.backend.deregister(&self.registration).await?;
        info!(id = %self.registration.id(), "Service deregistered");
        Ok(())
    }
}

/// Start the lifecycle loop for `registration`
pub fn spawn(
    backend: Arc<dyn ServiceBackend>,
    registration: ServiceRegistration,
    config: RegistrationConfig,
) -> RegistrationHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(RegistrationState::Unregistered);

    info!(
        id = %registration.id(),
        name = %registration.identity.name,
        environment = %registration.identity.environment,
        version = %registration.identity.version,
        backend = backend.name(),
        "Starting service registration"
    );

    let task = tokio::spawn(run(
        Arc::clone(&backend),
        registration.clone(),
        config,
        stop_rx,
        state_tx,
    ));

    RegistrationHandle {
        registration,
        backend,
        stop: stop_tx,
        state: state_rx,
        task,
    }
}

async fn run(
    backend: Arc<dyn ServiceBackend>,
    registration: ServiceRegistration,
    config: RegistrationConfig,
    mut stop: watch::Receiver<bool>,
    state: watch::Sender<RegistrationState>,
) {
    let id = registration.id().to_string();
    let mut backoff = Backoff::new(config.start_retry_delay, config.max_retry_delay);
    let mut failures = FailureLog::default();
    let mut registered = false;

    loop {
        if *stop.borrow() {
            break;
        }

        let result = if registered {
            backend.refresh(&registration).await
        } else {
            register_once(backend.as_ref(), &registration).await
        };

        let delay = match result {
            Ok(()) => {
                let first = !registered;
                registered = true;
                backoff.reset();
                failures.clear();
                state.send_replace(RegistrationState::Registered);

                if first {
                    info!(id = %id, "Service registered");
                    // Heartbeat right away rather than after a full interval
                    Duration::ZERO
                } else {
                    debug!(id = %id, "Heartbeat sent");
                    config.ping_interval
                }
            }
            Err(e) => {
                registered = false;
                state.send_replace(RegistrationState::FailedPendingRetry);
                let delay = backoff.next_delay();
                failures.record(&id, &e, delay);
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // Either a stop request or a dropped handle
            _ = stop.changed() => break,
        }
    }

    state.send_replace(RegistrationState::Unregistered);
    debug!(id = %id, "Registration loop stopped");
}

async fn register_once(
    backend: &dyn ServiceBackend,
    registration: &ServiceRegistration,
) -> Result<()> {
    let identity = &registration.identity;

    if identity.singleton {
        match backend.is_registered(registration).await {
            Ok(true) => {
                return Err(DiscoveryError::SingletonConflict {
                    name: identity.name.clone(),
                    environment: identity.environment.clone(),
                    version: identity.version.clone(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                warn!(id = %identity.id, error = %e, "Singleton check failed, registering anyway");
            }
        }
    }

    backend.register(registration).await
}
