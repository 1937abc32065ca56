//! In-memory backend (for testing and local development)
//!
//! Behaves like a store with TTL records: `refresh` fails once a record is
//! gone, and instances written by other processes can be seeded directly.
//! Failures can be injected per operation.

use crate::error::{DiscoveryError, Result};
use crate::service::{InstanceRecord, KeyValue, ServiceBackend, ServiceRegistration};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Backend operations, for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    Refresh,
    Deregister,
    Query,
    IsRegistered,
    ReadKey,
    WatchKey,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    environment: String,
    name: String,
    record: InstanceRecord,
}

#[derive(Default)]
struct Inner {
    instances: RwLock<HashMap<String, StoredInstance>>,
    keys: RwLock<HashMap<String, KeyValue>>,
    failures: Mutex<HashMap<Operation, usize>>,
    unavailable: Mutex<bool>,
    calls: Mutex<HashMap<Operation, usize>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// In-memory service backend
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
    revision: Arc<watch::Sender<u64>>,
}

struct InFlight<'a>(&'a Inner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryBackend {
    /// Create new in-memory backend
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            // Starts above zero so a watch from index 0 returns at once
            revision: Arc::new(watch::channel(1).0),
        }
    }

    /// Make the next `count` calls of `operation` fail
    pub fn fail_next(&self, operation: Operation, count: usize) {
        *self.inner.failures.lock().entry(operation).or_default() += count;
    }

    /// Make every operation fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.inner.unavailable.lock() = unavailable;
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Number of calls made for `operation`
    pub fn calls(&self, operation: Operation) -> usize {
        self.inner.calls.lock().get(&operation).copied().unwrap_or_default()
    }

    /// Highest number of calls that were in progress at the same time
    pub fn max_concurrent_calls(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Seed an instance as if another process registered it
    pub fn insert_instance(
        &self,
        environment: &str,
        name: &str,
        id: &str,
        version: &str,
        url: &str,
    ) {
        self.inner.instances.write().insert(
            id.to_string(),
            StoredInstance {
                environment: environment.to_string(),
                name: name.to_string(),
                record: InstanceRecord {
                    id: id.to_string(),
                    version: version.to_string(),
                    url: url.to_string(),
                    healthy: true,
                },
            },
        );
    }

    /// Mark an instance healthy or failing
    pub fn set_healthy(&self, id: &str, healthy: bool) {
        if let Some(instance) = self.inner.instances.write().get_mut(id) {
            instance.record.healthy = healthy;
        }
    }

    /// Drop an instance as if its TTL expired
    pub fn expire(&self, id: &str) {
        self.inner.instances.write().remove(id);
    }

    /// Whether an instance record exists
    pub fn contains(&self, id: &str) -> bool {
        self.inner.instances.read().contains_key(id)
    }

    /// Number of stored instances
    pub fn count(&self) -> usize {
        self.inner.instances.read().len()
    }

    /// Write a key and wake watchers
    pub fn set_key(&self, key: &str, value: Option<&str>) {
        let index = *self.revision.borrow() + 1;
        self.inner.keys.write().insert(
            key.to_string(),
            KeyValue {
                value: value.map(str::to_string),
                index,
            },
        );
        // Publish only after the write is visible to readers
        self.revision.send_replace(index);
    }

    async fn enter(&self, operation: Operation) -> Result<InFlight<'_>> {
        *self.inner.calls.lock().entry(operation).or_default() += 1;

        let current = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.inner);

        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = {
            let mut failures = self.inner.failures.lock();
            match failures.get_mut(&operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if injected || *self.inner.unavailable.lock() {
            return Err(DiscoveryError::Backend {
                status: 503,
                message: format!("{:?} unavailable", operation),
            });
        }

        Ok(guard)
    }

    fn read(&self, key: &str) -> KeyValue {
        let keys = self.inner.keys.read();
        match keys.get(key) {
            Some(kv) => kv.clone(),
            None => KeyValue {
                value: None,
                index: *self.revision.borrow(),
            },
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let _call = self.enter(Operation::Register).await?;
        let identity = &registration.identity;

        self.inner.instances.write().insert(
            identity.id.clone(),
            StoredInstance {
                environment: identity.environment.clone(),
                name: identity.name.clone(),
                record: InstanceRecord {
                    id: identity.id.clone(),
                    version: identity.version.clone(),
                    url: registration.advertised_url().unwrap_or_default(),
                    healthy: true,
                },
            },
        );
        Ok(())
    }

    async fn refresh(&self, registration: &ServiceRegistration) -> Result<()> {
        let _call = self.enter(Operation::Refresh).await?;

        if self.contains(registration.id()) {
            Ok(())
        } else {
            Err(DiscoveryError::Backend {
                status: 404,
                message: format!("instance {} not found", registration.id()),
            })
        }
    }

    async fn deregister(&self, registration: &ServiceRegistration) -> Result<()> {
        let _call = self.enter(Operation::Deregister).await?;

        self.inner
            .instances
            .write()
            .remove(registration.id())
            .ok_or_else(|| DiscoveryError::ServiceNotFound(registration.id().to_string()))?;
        Ok(())
    }

    async fn query(&self, environment: &str, service_name: &str) -> Result<Vec<InstanceRecord>> {
        let _call = self.enter(Operation::Query).await?;

        let instances = self.inner.instances.read();
        let mut records: Vec<InstanceRecord> = instances
            .values()
            .filter(|s| s.environment == environment && s.name == service_name)
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(records)
    }

    async fn is_registered(&self, registration: &ServiceRegistration) -> Result<bool> {
        let _call = self.enter(Operation::IsRegistered).await?;
        let identity = &registration.identity;

        Ok(self.inner.instances.read().values().any(|s| {
            s.environment == identity.environment
                && s.name == identity.name
                && s.record.version == identity.version
                && s.record.id != identity.id
                && s.record.healthy
        }))
    }

    async fn read_key(&self, key: &str) -> Result<KeyValue> {
        let _call = self.enter(Operation::ReadKey).await?;
        Ok(self.read(key))
    }

    async fn watch_key(&self, key: &str, index: u64) -> Result<KeyValue> {
        // Long polls are not counted as in flight while they wait
        drop(self.enter(Operation::WatchKey).await?);

        let mut revision = self.revision.subscribe();
        loop {
            let current = self.read(key);
            if current.index > index {
                return Ok(current);
            }
            if revision.changed().await.is_err() {
                return Ok(current);
            }
        }
    }
}
