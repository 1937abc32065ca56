//! Service registration and discovery for Waypoint
//!
//! Registers a process in Consul or etcd, keeps it alive with TTL
//! heartbeats, and resolves other services by name, environment and
//! NPM-style version range into a URL.
//!
//! ## Features
//!
//! - **Registration** - Background heartbeat loop with exponential backoff
//! - **Discovery** - Highest matching version, random instance selection
//! - **Gateways** - Per-version gateway URLs watched in the store
//! - **Fallback** - Last known good URL when the store is unreachable
//! - **Multiple Backends** - Consul, etcd, or in-memory
//!
//! ## Quick Start
//!
//! ### In-Memory Discovery (Testing)
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waypoint_config::ConfigManager;
//! use waypoint_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InMemoryBackend::new();
//!     backend.insert_instance("dev", "orders", "orders-1", "1.2.0", "http://10.0.0.3:8080");
//!
//!     let discovery = Discovery::with_backend(
//!         Arc::new(backend),
//!         Arc::new(ConfigManager::new()),
//!         Settings::default(),
//!     );
//!
//!     let url = discovery
//!         .discover_service(DiscoverOptions::new("orders").with_version("^1.0.0"))
//!         .await?;
//!     println!("orders at {}", url);
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Consul
//!
//! ```rust,ignore
//! use waypoint_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let discovery = Discovery::new(DiscoveryOptions::new("consul").with_config_path("app.toml"))?;
//!
//!     discovery
//!         .register_service(RegisterOptions::new("billing").with_version("1.4.0"))
//!         .await?;
//!
//!     let url = discovery
//!         .discover_service(DiscoverOptions::new("customer-service"))
//!         .await?;
//!
//!     discovery.deregister_service().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Settings are read by dotted key (`discovery.consul.hosts`, `env.name`,
//! `server.base-url`, ...). Files written for KumuluzEE services keep
//! working: each key is also looked up under the `kumuluzee.` prefix
//! (`kumuluzee.discovery.ttl`) when the plain key is absent. Environment
//! variables with the `WAYPOINT_` prefix override both.

pub mod consul;
pub mod discovery;
pub mod error;
pub mod etcd;
pub mod gateway;
pub mod memory;
pub mod registration;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod store_config;
pub mod version;

pub use consul::ConsulDiscovery;
pub use discovery::{Discovery, DiscoveryOptions, ENV_PREFIX, RegisterOptions};
pub use error::{DiscoveryError, Result};
pub use etcd::EtcdDiscovery;
pub use gateway::{GATEWAY_URL_KEY, GatewayCache};
pub use memory::{InMemoryBackend, Operation};
pub use registration::{
    Backoff, RegistrationConfig, RegistrationHandle, RegistrationState,
};
pub use resolver::{AccessType, DiscoverOptions, DiscoveredInstance, ServiceResolver};
pub use service::{
    BackendKind, InstanceRecord, KeyValue, ServiceBackend, ServiceIdentity, ServiceRegistration,
    service_namespace,
};
pub use settings::Settings;
pub use store_config::StoreConfigSource;
pub use version::{VersionSelector, parse_version, resolve};
