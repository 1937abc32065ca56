//! Consul service discovery implementation
//!
//! Instances are agent services named `{env}-{name}` with a TTL check
//! `check-{id}`, tagged with the URL scheme and `version={semver}`.

use crate::error::{DiscoveryError, Result};
use crate::service::{InstanceRecord, KeyValue, ServiceBackend, ServiceRegistration};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const VERSION_TAG: &str = "version";
const DEREGISTER_CRITICAL_AFTER: &str = "10s";
const INDEX_HEADER: &str = "X-Consul-Index";

/// Consul service discovery client
pub struct ConsulDiscovery {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    watch_wait: Duration,
}

impl ConsulDiscovery {
    /// Create new Consul discovery client
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use waypoint_discovery::ConsulDiscovery;
    ///
    /// let consul = ConsulDiscovery::new("http://localhost:8500")?;
    /// ```
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        url::Url::parse(&base_url).map_err(|e| {
            DiscoveryError::InvalidConfiguration(format!("Consul address {:?}: {}", base_url, e))
        })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()?,
            request_timeout: Duration::from_secs(10),
            watch_wait: Duration::from_secs(60),
        })
    }

    /// Set the timeout for ordinary requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set how long a key watch blocks on the server
    pub fn with_watch_wait(mut self, wait: Duration) -> Self {
        self.watch_wait = wait;
        self
    }

    /// Consul service name of a service in an environment
    pub fn service_name(environment: &str, name: &str) -> String {
        format!("{}-{}", environment, name)
    }

    fn check_id(instance_id: &str) -> String {
        format!("check-{}", instance_id)
    }

    async fn healthy_entries(&self, service: &str) -> Result<Vec<HealthEntry>> {
        let url = format!("{}/v1/health/service/{}", self.base_url, service);

        let response = self
            .client
            .get(&url)
            .query(&[("passing", "true")])
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::from_response(response).await);
        }

        Ok(response.json().await?)
    }

    async fn get_key(&self, key: &str, index: Option<u64>) -> Result<KeyValue> {
        let url = format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'));

        let mut request = self.client.get(&url);
        request = match index {
            Some(index) => request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", self.watch_wait.as_secs())),
                ])
                .timeout(self.watch_wait + Duration::from_secs(10)),
            None => request.timeout(self.request_timeout),
        };

        let response = request.send().await?;
        let header_index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(KeyValue {
                value: None,
                index: header_index.unwrap_or_default(),
            });
        }
        if !response.status().is_success() {
            return Err(DiscoveryError::from_response(response).await);
        }

        let entries: Vec<KvEntry> = response.json().await?;
        let entry = entries.into_iter().next();
        let value = match entry.as_ref().and_then(|e| e.value.as_deref()) {
            Some(encoded) => {
                let bytes = general_purpose::STANDARD.decode(encoded).map_err(|e| {
                    DiscoveryError::InvalidConfiguration(format!("Consul KV {}: {}", key, e))
                })?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            None => entry.as_ref().map(|_| String::new()),
        };

        Ok(KeyValue {
            value,
            index: header_index
                .or_else(|| entry.map(|e| e.modify_index))
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: NodeDetail,
    #[serde(rename = "Service")]
    service: ServiceDetail,
}

#[derive(Debug, Deserialize)]
struct NodeDetail {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ServiceDetail {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex", default)]
    modify_index: u64,
}

impl HealthEntry {
    fn tags(&self) -> &[String] {
        self.service.tags.as_deref().unwrap_or_default()
    }

    fn into_record(self) -> InstanceRecord {
        let mut version = String::new();
        let mut scheme = "http";
        for tag in self.tags() {
            if tag.starts_with(VERSION_TAG) {
                version = tag.split('=').nth(1).unwrap_or_default().to_string();
            } else if tag == "https" {
                scheme = "https";
            }
        }

        // Without an explicit address the service lives on its node
        let address = if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        };

        InstanceRecord {
            url: format!("{}://{}:{}", scheme, address, self.service.port),
            id: self.service.id,
            version,
            healthy: true,
        }
    }
}

#[async_trait]
impl ServiceBackend for ConsulDiscovery {
    fn name(&self) -> &'static str {
        "consul"
    }

    fn new_instance_id(&self, service_name: &str) -> String {
        format!("{}-{}", service_name, uuid::Uuid::new_v4())
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let identity = &registration.identity;

        let mut payload = serde_json::json!({
            "ID": identity.id,
            "Name": Self::service_name(&identity.environment, &identity.name),
            "Port": registration.port,
            "Tags": [
                registration.protocol,
                format!("{}={}", VERSION_TAG, identity.version),
            ],
            "Check": {
                "CheckID": Self::check_id(&identity.id),
                "TTL": format!("{}s", registration.ttl.as_secs()),
                "DeregisterCriticalServiceAfter": DEREGISTER_CRITICAL_AFTER,
            },
        });

        if let Some(ref address) = registration.address {
            payload["Address"] = serde_json::json!(address);
        }

        let response = self
            .client
            .put(&url)
            .json(&payload)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            info!(id = %identity.id, "Registered service with Consul");
            Ok(())
        } else {
            let error = DiscoveryError::from_response(response).await;
            Err(DiscoveryError::RegistrationFailed(error.to_string()))
        }
    }

    async fn refresh(&self, registration: &ServiceRegistration) -> Result<()> {
        let id = registration.id();
        let url = format!(
            "{}/v1/agent/check/update/{}",
            self.base_url,
            Self::check_id(id)
        );

        let payload = serde_json::json!({
            "Status": "passing",
            "Output": format!(
                "serviceid={} time={}",
                id,
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
        });

        let response = self
            .client
            .put(&url)
            .json(&payload)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            debug!(id, "TTL update");
            Ok(())
        } else {
            Err(DiscoveryError::from_response(response).await)
        }
    }

    async fn deregister(&self, registration: &ServiceRegistration) -> Result<()> {
        let id = registration.id();
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);

        let response = self
            .client
            .put(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            info!(id, "Deregistered service from Consul");
            Ok(())
        } else {
            let error = DiscoveryError::from_response(response).await;
            Err(DiscoveryError::DeregistrationFailed(error.to_string()))
        }
    }

    async fn query(&self, environment: &str, service_name: &str) -> Result<Vec<InstanceRecord>> {
        let entries = self
            .healthy_entries(&Self::service_name(environment, service_name))
            .await?;

        let instances: Vec<InstanceRecord> =
            entries.into_iter().map(HealthEntry::into_record).collect();

        debug!(
            "Discovered {} instances of service {}",
            instances.len(),
            service_name
        );
        Ok(instances)
    }

    async fn is_registered(&self, registration: &ServiceRegistration) -> Result<bool> {
        let identity = &registration.identity;
        let version_tag = format!("{}={}", VERSION_TAG, identity.version);

        let entries = self
            .healthy_entries(&Self::service_name(&identity.environment, &identity.name))
            .await?;

        Ok(entries
            .iter()
            .any(|e| e.service.id != identity.id && e.tags().contains(&version_tag)))
    }

    async fn read_key(&self, key: &str) -> Result<KeyValue> {
        self.get_key(key, None).await
    }

    async fn watch_key(&self, key: &str, index: u64) -> Result<KeyValue> {
        if index == 0 {
            return self.get_key(key, None).await;
        }
        self.get_key(key, Some(index)).await
    }
}
