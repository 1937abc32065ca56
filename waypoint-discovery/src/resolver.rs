//! Discovery engine
//!
//! Resolves a service name, environment and version selector into one URL:
//! query the backend, keep healthy instances with parseable versions, pick
//! the highest version satisfying the selector, choose one of its instances
//! at random, and prefer the version's gateway when asked to. The last
//! successful answer per service is kept and served when the backend fails
//! or nothing matches.

use crate::error::{DiscoveryError, Result};
use crate::gateway::GatewayCache;
use crate::service::{ServiceBackend, service_namespace};
use crate::version::{VersionSelector, parse_version};
use dashmap::DashMap;
use rand::Rng;
use semver::Version;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use waypoint_config::ConfigSource;

/// How the caller wants to reach the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessType {
    /// Through the version's gateway when one is configured
    #[default]
    Gateway,
    /// Straight to an instance
    Direct,
}

impl FromStr for AccessType {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gateway" => Ok(AccessType::Gateway),
            "direct" => Ok(AccessType::Direct),
            other => Err(DiscoveryError::InvalidConfiguration(format!(
                "unknown access type {:?} (expected \"gateway\" or \"direct\")",
                other
            ))),
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Gateway => write!(f, "gateway"),
            AccessType::Direct => write!(f, "direct"),
        }
    }
}

/// Discovery request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverOptions {
    pub service_name: String,

    /// Defaults to the resolver's environment
    pub environment: Option<String>,

    /// Version selector, `*` when unset
    pub version: Option<String>,

    pub access_type: AccessType,
}

impl DiscoverOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            environment: None,
            version: None,
            access_type: AccessType::default(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_version(mut self, selector: impl Into<String>) -> Self {
        self.version = Some(selector.into());
        self
    }

    pub fn with_access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }
}

/// A healthy instance with a parsed version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    pub id: String,
    pub version: Version,
    pub direct_url: String,
}

/// Discovery engine shared by all discoveries of a facade
pub struct ServiceResolver {
    backend: Arc<dyn ServiceBackend>,
    gateways: GatewayCache,
    last_known_good: DashMap<(String, String), String>,
    default_environment: String,
}

impl ServiceResolver {
    /// Create a resolver; `config_source` serves the gateway URL keys
    pub fn new(
        backend: Arc<dyn ServiceBackend>,
        config_source: Arc<dyn ConfigSource>,
        default_environment: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            gateways: GatewayCache::new(config_source),
            last_known_good: DashMap::new(),
            default_environment: default_environment.into(),
        }
    }

    pub fn gateways(&self) -> &GatewayCache {
        &self.gateways
    }

    /// Last URL successfully returned for a service
    pub fn last_known_good(&self, environment: &str, service_name: &str) -> Option<String> {
        self.last_known_good
            .get(&(environment.to_string(), service_name.to_string()))
            .map(|url| url.value().clone())
    }

    /// Resolve `options` into a URL
    pub async fn discover(&self, options: &DiscoverOptions) -> Result<String> {
        let environment = options
            .environment
            .as_deref()
            .map(str::trim)
            .filter(|env| !env.is_empty())
            .unwrap_or(&self.default_environment);
        let name = options.service_name.as_str();
        let raw_selector = options
            .version
            .as_deref()
            .map(str::trim)
            .filter(|selector| !selector.is_empty())
            .unwrap_or("*");
        let selector: VersionSelector = raw_selector.parse()?;
        let key = (environment.to_string(), name.to_string());

        let records = match self.backend.query(environment, name).await {
            Ok(records) => records,
            Err(e) => return self.fall_back(&key, e),
        };

        let instances: Vec<DiscoveredInstance> = records
            .into_iter()
            .filter(|record| record.healthy)
            .filter_map(|record| match parse_version(&record.version) {
                Ok(version) => Some(DiscoveredInstance {
                    id: record.id,
                    version,
                    direct_url: record.url,
                }),
                Err(e) => {
                    warn!(
                        service = name,
                        id = %record.id,
                        version = %record.version,
                        error = %e,
                        "Skipping instance with unparseable version"
                    );
                    None
                }
            })
            .collect();

        if instances.is_empty() {
            return self.fall_back(&key, DiscoveryError::ServiceNotFound(name.to_string()));
        }

        let Some(resolved) = selector.best_match(instances.iter().map(|i| &i.version)) else {
            return self.fall_back(
                &key,
                DiscoveryError::NoMatchingVersion {
                    service: name.to_string(),
                    selector: raw_selector.to_string(),
                },
            );
        };

        let candidates: Vec<&DiscoveredInstance> = instances
            .iter()
            .filter(|i| &i.version == resolved)
            .collect();
        let chosen = candidates[rand::rng().random_range(0..candidates.len())];

        let versions: BTreeSet<&Version> = instances.iter().map(|i| &i.version).collect();
        let mut gateway_url = String::new();
        for version in versions {
            let url = self
                .gateways
                .get_or_create(&service_namespace(environment, name, &version.to_string()))
                .await;
            if version == resolved {
                gateway_url = url;
            }
        }

        let url = match options.access_type {
            AccessType::Gateway if !gateway_url.is_empty() => gateway_url,
            _ => chosen.direct_url.clone(),
        };

        debug!(
            service = name,
            environment,
            version = %resolved,
            instance = %chosen.id,
            url = %url,
            "Discovered service"
        );

        self.last_known_good.insert(key, url.clone());
        Ok(url)
    }

    fn fall_back(&self, key: &(String, String), err: DiscoveryError) -> Result<String> {
        match self.last_known_good.get(key) {
            Some(url) => {
                warn!(
                    environment = %key.0,
                    service = %key.1,
                    error = %err,
                    url = %url.as_str(),
                    "Discovery failed, using last known good URL"
                );
                Ok(url.value().clone())
            }
            None => Err(err),
        }
    }
}
