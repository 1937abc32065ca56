//! Service identities and the backend contract

use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Key namespace of one version of a service:
/// `/environments/{env}/services/{name}/{version}`
pub fn service_namespace(environment: &str, name: &str, version: &str) -> String {
    format!("/environments/{}/services/{}/{}", environment, name, version)
}

/// Identity of a registered service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    /// Instance ID (unique per instance)
    pub id: String,

    /// Service name
    pub name: String,

    /// Environment (dev, test, prod, ...)
    pub environment: String,

    /// Semantic version
    pub version: String,

    /// Refuse to register while another healthy instance of the same
    /// name, environment and version exists
    pub singleton: bool,
}

impl ServiceIdentity {
    /// Namespace of this identity's version
    pub fn namespace(&self) -> String {
        service_namespace(&self.environment, &self.name, &self.version)
    }
}

/// Everything a backend needs to write an instance record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub identity: ServiceIdentity,

    /// Record time-to-live
    pub ttl: Duration,

    /// URL scheme advertised for the instance (`http` or `https`)
    pub protocol: String,

    /// Advertised address; backends fall back to their own notion of the
    /// host when unset
    pub address: Option<String>,

    /// Advertised port
    pub port: u16,

    /// Full advertised URL, required by key/value style backends
    pub base_url: Option<String>,
}

impl ServiceRegistration {
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// URL other services should use to reach this instance
    pub fn advertised_url(&self) -> Option<String> {
        if let Some(ref url) = self.base_url {
            return Some(url.clone());
        }
        self.address
            .as_ref()
            .map(|address| format!("{}://{}:{}", self.protocol, address, self.port))
    }
}

/// One instance as reported by a backend query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,

    /// Version tag as stored, not yet parsed
    pub version: String,

    /// Direct URL of the instance
    pub url: String,

    pub healthy: bool,
}

/// A single key read from the store
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    /// `None` when the key does not exist
    pub value: Option<String>,

    /// Store index the read was served at; pass it to
    /// [`ServiceBackend::watch_key`] to wait for the next change
    pub index: u64,
}

/// Coordination store operations used by registration and discovery
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Generate an instance ID for a new registration of `service_name`
    fn new_instance_id(&self, service_name: &str) -> String {
        let _ = service_name;
        uuid::Uuid::new_v4().to_string()
    }

    /// Create the instance record
    async fn register(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Refresh the record's TTL; fails if the record is gone
    async fn refresh(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Remove the record and any check state
    async fn deregister(&self, registration: &ServiceRegistration) -> Result<()>;

    /// All instances of a service in an environment, any version
    async fn query(&self, environment: &str, service_name: &str) -> Result<Vec<InstanceRecord>>;

    /// Whether another healthy instance with the same name, environment
    /// and version exists
    async fn is_registered(&self, registration: &ServiceRegistration) -> Result<bool>;

    /// Read a single key
    async fn read_key(&self, key: &str) -> Result<KeyValue>;

    /// Wait until `key` changes after `index`, or until the backend's poll
    /// window ends, and return its state at that point
    async fn watch_key(&self, key: &str, index: u64) -> Result<KeyValue>;
}

/// Supported coordination stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Consul,
    Etcd,
}

impl FromStr for BackendKind {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "consul" => Ok(BackendKind::Consul),
            "etcd" => Ok(BackendKind::Etcd),
            _ => Err(DiscoveryError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Consul => write!(f, "consul"),
            BackendKind::Etcd => write!(f, "etcd"),
        }
    }
}
