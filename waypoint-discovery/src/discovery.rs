//! Discovery facade
//!
//! [`Discovery`] ties one backend to one registration slot and one
//! discovery engine, using settings read once at construction.

use crate::consul::ConsulDiscovery;
use crate::error::{DiscoveryError, Result};
use crate::etcd::EtcdDiscovery;
use crate::registration::{self, RegistrationHandle, RegistrationState};
use crate::resolver::{DiscoverOptions, ServiceResolver};
use crate::service::{BackendKind, ServiceBackend, ServiceIdentity, ServiceRegistration};
use crate::settings::Settings;
use crate::store_config::StoreConfigSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use waypoint_config::{ConfigService, ConfigSource, Validate};

/// Prefix of environment variables overriding configuration keys
pub const ENV_PREFIX: &str = "WAYPOINT";

/// How to build a [`Discovery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// `consul` or `etcd`
    pub backend: String,

    /// Configuration file (JSON, TOML or `.env` style)
    pub config_path: Option<PathBuf>,
}

impl DiscoveryOptions {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

/// Registration request; unset fields come from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    pub name: Option<String>,
    /// Seconds
    pub ttl: Option<u64>,
    /// Seconds
    pub ping_interval: Option<u64>,
    pub environment: Option<String>,
    pub version: Option<String>,
    pub singleton: bool,
}

impl RegisterOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn with_ping_interval(mut self, seconds: u64) -> Self {
        self.ping_interval = Some(seconds);
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

/// Service registration and discovery client
///
/// # Examples
///
/// ```rust,ignore
/// use waypoint_discovery::*;
///
/// let discovery = Discovery::new(DiscoveryOptions::new("consul").with_config_path("app.toml"))?;
///
/// let id = discovery
///     .register_service(RegisterOptions::new("billing").with_version("1.4.0"))
///     .await?;
///
/// let url = discovery
///     .discover_service(DiscoverOptions::new("customer-service").with_version("^1.0.0"))
///     .await?;
///
/// discovery.deregister_service().await?;
/// ```
pub struct Discovery {
    backend: Arc<dyn ServiceBackend>,
    settings: Settings,
    resolver: ServiceResolver,
    registration: Mutex<Option<RegistrationHandle>>,
}

impl Discovery {
    /// Load configuration and connect to the chosen backend
    pub fn new(options: DiscoveryOptions) -> Result<Self> {
        let kind: BackendKind = options.backend.parse()?;

        let mut builder = ConfigService::builder()
            .with_prefix(ENV_PREFIX)
            .load_dotenv(None);
        if let Some(path) = options.config_path {
            builder = builder.add_file(path);
        }
        let config = builder.build()?;

        let settings = Settings::from_config(&config);
        if let Err(e) = settings.validate() {
            warn!(error = %e, "Discovery configuration looks wrong");
        }

        let backend: Arc<dyn ServiceBackend> = match kind {
            BackendKind::Consul => {
                let host = settings
                    .consul_hosts
                    .split(',')
                    .next()
                    .map(str::trim)
                    .unwrap_or_default();
                Arc::new(ConsulDiscovery::new(host)?)
            }
            BackendKind::Etcd => Arc::new(EtcdDiscovery::new(&settings.etcd_hosts)?),
        };

        let source = StoreConfigSource::new(Arc::clone(&backend)).with_retry(
            Duration::from_millis(settings.start_retry_delay_ms),
            Duration::from_millis(settings.max_retry_delay_ms),
        );

        info!(backend = %kind, environment = %settings.environment, "Discovery client ready");
        Ok(Self::with_backend(backend, Arc::new(source), settings))
    }

    /// Build around an existing backend and configuration source
    pub fn with_backend(
        backend: Arc<dyn ServiceBackend>,
        config_source: Arc<dyn ConfigSource>,
        settings: Settings,
    ) -> Self {
        let resolver = ServiceResolver::new(
            Arc::clone(&backend),
            config_source,
            settings.environment.clone(),
        );

        Self {
            backend,
            settings,
            resolver,
            registration: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn ServiceBackend> {
        &self.backend
    }

    /// Start registering this process and return its instance id.
    ///
    /// The id is returned before the first registration completes. A
    /// registration already running on this client is stopped first.
    pub async fn register_service(&self, options: RegisterOptions) -> Result<String> {
        let ping_interval = options.ping_interval;
        let registration = self.registration_for(options)?;

        let mut config = self.settings.registration_config();
        if let Some(seconds) = ping_interval {
            config.ping_interval = Duration::from_secs(seconds);
        }

        let mut slot = self.registration.lock().await;
        if let Some(previous) = slot.take() {
            let previous_id = previous.id().to_string();
            if let Err(e) = previous.stop().await {
                warn!(id = %previous_id, error = %e, "Failed to deregister previous registration");
            }
        }

        let id = registration.id().to_string();
        *slot = Some(registration::spawn(
            Arc::clone(&self.backend),
            registration,
            config,
        ));
        Ok(id)
    }

    /// Stop heartbeating and delete this process's record
    pub async fn deregister_service(&self) -> Result<()> {
        let handle = self
            .registration
            .lock()
            .await
            .take()
            .ok_or(DiscoveryError::NotRegistered)?;
        handle.stop().await
    }

    /// Resolve a service into a URL
    pub async fn discover_service(&self, options: DiscoverOptions) -> Result<String> {
        self.resolver.discover(&options).await
    }

    /// State of the current registration, if any
    pub async fn registration_state(&self) -> Option<watch::Receiver<RegistrationState>> {
        self.registration
            .lock()
            .await
            .as_ref()
            .map(RegistrationHandle::subscribe_state)
    }

    fn registration_for(&self, options: RegisterOptions) -> Result<ServiceRegistration> {
        let settings = &self.settings;
        let name = non_blank(options.name)
            .or_else(|| settings.name.clone())
            .ok_or_else(|| {
                DiscoveryError::InvalidConfiguration(
                    "a service name is required (register option or `name` key)".to_string(),
                )
            })?;

        let ttl = options.ttl.unwrap_or(settings.ttl);
        let ping = options.ping_interval.unwrap_or(settings.ping_interval);
        if ping >= ttl {
            warn!(name = %name, ping, ttl, "Ping interval is not shorter than the TTL");
        }

        Ok(ServiceRegistration {
            identity: ServiceIdentity {
                id: self.backend.new_instance_id(&name),
                environment: non_blank(options.environment)
                    .unwrap_or_else(|| settings.environment.clone()),
                version: non_blank(options.version).unwrap_or_else(|| settings.version.clone()),
                singleton: options.singleton,
                name,
            },
            ttl: Duration::from_secs(ttl),
            protocol: settings.consul_protocol.clone(),
            address: settings.address.clone(),
            port: settings.port,
            base_url: settings.base_url.clone(),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
