//! etcd service discovery implementation
//!
//! Uses the v2 keys API. Each instance is a TTL directory
//! `/environments/{env}/services/{name}/{version}/instances/{id}` holding a
//! `url` key and, optionally, a `status` key (`disabled` hides it).

use crate::error::{DiscoveryError, Result};
use crate::service::{InstanceRecord, KeyValue, ServiceBackend, ServiceRegistration};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

const INDEX_HEADER: &str = "X-Etcd-Index";
const INSTANCES_DIR: &str = "instances";

/// etcd service discovery client
pub struct EtcdDiscovery {
    endpoints: Vec<String>,
    client: reqwest::Client,
    request_timeout: Duration,
    watch_timeout: Duration,
}

impl EtcdDiscovery {
    /// Create new etcd discovery client from a comma separated endpoint list
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use waypoint_discovery::EtcdDiscovery;
    ///
    /// let etcd = EtcdDiscovery::new("http://etcd-1:2379,http://etcd-2:2379")?;
    /// ```
    pub fn new(hosts: &str) -> Result<Self> {
        let endpoints = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| {
                url::Url::parse(h)
                    .map(|_| h.trim_end_matches('/').to_string())
                    .map_err(|e| {
                        DiscoveryError::InvalidConfiguration(format!(
                            "etcd endpoint {:?}: {}",
                            h, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if endpoints.is_empty() {
            return Err(DiscoveryError::InvalidConfiguration(
                "no etcd endpoints configured".to_string(),
            ));
        }

        Ok(Self {
            endpoints,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()?,
            request_timeout: Duration::from_secs(10),
            watch_timeout: Duration::from_secs(60),
        })
    }

    /// Set the timeout for ordinary requests
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set how long a key watch waits before re-reading
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Configured endpoints
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn instance_dir(registration: &ServiceRegistration) -> String {
        format!(
            "{}/{}/{}",
            registration.identity.namespace(),
            INSTANCES_DIR,
            registration.id()
        )
    }

    fn keys_url(endpoint: &str, key: &str) -> String {
        if key.starts_with('/') {
            format!("{}/v2/keys{}", endpoint, key)
        } else {
            format!("{}/v2/keys/{}", endpoint, key)
        }
    }

    /// Send to the first endpoint that answers
    async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match build(endpoint).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() => {
                    debug!(endpoint, error = %e, "etcd endpoint unreachable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_error {
            Some(e) => Err(e.into()),
            None => Err(DiscoveryError::InvalidConfiguration(
                "no etcd endpoints configured".to_string(),
            )),
        }
    }

    async fn set_form(&self, key: &str, form: &[(&str, String)]) -> Result<()> {
        let response = self
            .send(|endpoint| {
                self.client
                    .put(Self::keys_url(endpoint, key))
                    .form(form)
                    .timeout(self.request_timeout)
            })
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DiscoveryError::from_response(response).await)
        }
    }

    /// Recursive read; `None` when the directory does not exist
    async fn get_tree(&self, key: &str) -> Result<Option<EtcdNode>> {
        let response = self
            .send(|endpoint| {
                self.client
                    .get(Self::keys_url(endpoint, key))
                    .query(&[("recursive", "true")])
                    .timeout(self.request_timeout)
            })
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DiscoveryError::from_response(response).await);
        }

        let body: EtcdResponse = response.json().await?;
        Ok(body.node)
    }

    async fn read_response(response: reqwest::Response) -> Result<KeyValue> {
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

        let body: EtcdResponse = response.json().await?;
        let deleted = matches!(
            body.action.as_deref(),
            Some("delete" | "expire" | "compareAndDelete")
        );
        let node = body.node.unwrap_or_default();

        Ok(KeyValue {
            value: if deleted { None } else { node.value },
            index: node.modified_index.max(header_index.unwrap_or_default()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: Option<String>,
    node: Option<EtcdNode>,
}

#[derive(Debug, Default, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: String,
    value: Option<String>,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

impl EtcdNode {
    fn base_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    fn child(&self, name: &str) -> Option<&EtcdNode> {
        self.nodes.iter().find(|n| n.base_name() == name)
    }

    fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|n| n.value.as_deref())
    }

    /// Instance directory to record; `version` comes from the parent path
    fn to_record(&self, version: &str) -> InstanceRecord {
        let url = self.child_value("url").unwrap_or_default();
        let disabled = self.child_value("status") == Some("disabled");

        InstanceRecord {
            id: self.base_name().to_string(),
            version: version.to_string(),
            url: url.to_string(),
            healthy: !url.is_empty() && !disabled,
        }
    }
}

/// Flatten `{name}/{version}/instances/{id}` into records
fn records_from_tree(service: &EtcdNode) -> Vec<InstanceRecord> {
    service
        .nodes
        .iter()
        .flat_map(|version_node| {
            let version = version_node.base_name();
            version_node
                .child(INSTANCES_DIR)
                .map(|instances| {
                    instances
                        .nodes
                        .iter()
                        .map(|instance| instance.to_record(version))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })
        .collect()
}

#[async_trait]
impl ServiceBackend for EtcdDiscovery {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let dir = Self::instance_dir(registration);
        let ttl = registration.ttl.as_secs().to_string();

        let url = match registration.base_url {
            Some(ref url) => url.clone(),
            None => {
                error!(
                    id = registration.id(),
                    "No base URL provided; set server.base-url so other services can reach this instance"
                );
                String::new()
            }
        };

        self.set_form(&dir, &[("dir", "true".to_string()), ("ttl", ttl)])
            .await
            .map_err(|e| DiscoveryError::RegistrationFailed(e.to_string()))?;

        self.set_form(&format!("{}/url", dir), &[("value", url)])
            .await
            .map_err(|e| DiscoveryError::RegistrationFailed(e.to_string()))?;

        info!(id = registration.id(), key = %dir, "Registered service with etcd");
        Ok(())
    }

    async fn refresh(&self, registration: &ServiceRegistration) -> Result<()> {
        let dir = Self::instance_dir(registration);

        self.set_form(
            &dir,
            &[
                ("dir", "true".to_string()),
                ("ttl", registration.ttl.as_secs().to_string()),
                ("prevExist", "true".to_string()),
                ("refresh", "true".to_string()),
            ],
        )
        .await?;

        debug!(id = registration.id(), "TTL update");
        Ok(())
    }

    async fn deregister(&self, registration: &ServiceRegistration) -> Result<()> {
        let dir = Self::instance_dir(registration);

        let response = self
            .send(|endpoint| {
                self.client
                    .delete(Self::keys_url(endpoint, &dir))
                    .query(&[("recursive", "true"), ("dir", "true")])
                    .timeout(self.request_timeout)
            })
            .await?;

        if response.status().is_success() {
            info!(id = registration.id(), "Deregistered service from etcd");
            Ok(())
        } else {
            let error = DiscoveryError::from_response(response).await;
            Err(DiscoveryError::DeregistrationFailed(error.to_string()))
        }
    }

    async fn query(&self, environment: &str, service_name: &str) -> Result<Vec<InstanceRecord>> {
        let key = format!("/environments/{}/services/{}/", environment, service_name);

        let instances = match self.get_tree(&key).await? {
            Some(service) => records_from_tree(&service),
            None => Vec::new(),
        };

        debug!(
            "Discovered {} instances of service {}",
            instances.len(),
            service_name
        );
        Ok(instances)
    }

    async fn is_registered(&self, registration: &ServiceRegistration) -> Result<bool> {
        let key = format!(
            "{}/{}/",
            registration.identity.namespace(),
            INSTANCES_DIR
        );

        let Some(instances) = self.get_tree(&key).await? else {
            return Ok(false);
        };

        Ok(instances
            .nodes
            .iter()
            .map(|instance| instance.to_record(&registration.identity.version))
            .any(|record| record.healthy && record.id != registration.id()))
    }

    async fn read_key(&self, key: &str) -> Result<KeyValue> {
        let response = self
            .send(|endpoint| {
                self.client
                    .get(Self::keys_url(endpoint, key))
                    .timeout(self.request_timeout)
            })
            .await?;

        Self::read_response(response).await
    }

    async fn watch_key(&self, key: &str, index: u64) -> Result<KeyValue> {
        if index == 0 {
            return self.read_key(key).await;
        }

        let wait_index = (index + 1).to_string();
        let result = self
            .send(|endpoint| {
                self.client
                    .get(Self::keys_url(endpoint, key))
                    .query(&[("wait", "true"), ("waitIndex", wait_index.as_str())])
                    .timeout(self.watch_timeout)
            })
            .await;

        match result {
            Ok(response) if response.status().is_success() => Self::read_response(response).await,
            // Timed out, index cleared or key missing: resynchronise with a plain read
            Ok(_) => self.read_key(key).await,
            Err(DiscoveryError::HttpError(e)) if e.is_timeout() => self.read_key(key).await,
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> EtcdNode {
        serde_json::from_value(serde_json::json!({
            "key": "/environments/dev/services/orders",
            "dir": true,
            "nodes": [
                {
                    "key": "/environments/dev/services/orders/1.0.0",
                    "dir": true,
                    "nodes": [
                        {"key": "/environments/dev/services/orders/1.0.0/gatewayUrl", "value": "http://gw"},
                        {
                            "key": "/environments/dev/services/orders/1.0.0/instances",
                            "dir": true,
                            "nodes": [
                                {
                                    "key": "/environments/dev/services/orders/1.0.0/instances/a",
                                    "dir": true,
                                    "nodes": [
                                        {"key": "/environments/dev/services/orders/1.0.0/instances/a/url", "value": "http://10.0.0.5:8080"}
                                    ]
                                },
                                {
                                    "key": "/environments/dev/services/orders/1.0.0/instances/b",
                                    "dir": true,
                                    "nodes": [
                                        {"key": "/environments/dev/services/orders/1.0.0/instances/b/url", "value": "http://10.0.0.6:8080"},
                                        {"key": "/environments/dev/services/orders/1.0.0/instances/b/status", "value": "disabled"}
                                    ]
                                }
                            ]
                        }
                    ]
                },
                {
                    "key": "/environments/dev/services/orders/2.0.0",
                    "dir": true,
                    "nodes": [
                        {
                            "key": "/environments/dev/services/orders/2.0.0/instances",
                            "dir": true,
                            "nodes": [
                                {"key": "/environments/dev/services/orders/2.0.0/instances/c", "dir": true}
                            ]
                        }
                    ]
                },
                {"key": "/environments/dev/services/orders/3.0.0", "dir": true}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_etcd_discovery_creation() {
        let etcd = EtcdDiscovery::new("http://etcd-1:2379, http://etcd-2:2379/").unwrap();
        assert_eq!(etcd.endpoints(), ["http://etcd-1:2379", "http://etcd-2:2379"]);

        assert!(EtcdDiscovery::new("").is_err());
        assert!(EtcdDiscovery::new("not a url").is_err());
    }

    #[test]
    fn test_records_from_tree() {
        let records = records_from_tree(&tree());
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].version, "1.0.0");
        assert_eq!(records[0].url, "http://10.0.0.5:8080");
        assert!(records[0].healthy);

        // disabled
        assert_eq!(records[1].id, "b");
        assert!(!records[1].healthy);

        // no url yet
        assert_eq!(records[2].id, "c");
        assert_eq!(records[2].version, "2.0.0");
        assert!(!records[2].healthy);
    }

    #[test]
    fn test_keys_url() {
        assert_eq!(
            EtcdDiscovery::keys_url("http://etcd:2379", "/environments/dev"),
            "http://etcd:2379/v2/keys/environments/dev"
        );
        assert_eq!(
            EtcdDiscovery::keys_url("http://etcd:2379", "environments/dev"),
            "http://etcd:2379/v2/keys/environments/dev"
        );
    }
}
