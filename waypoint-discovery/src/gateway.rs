//! Gateway URL watch cache
//!
//! One entry per `/environments/{env}/services/{name}/{version}` namespace.
//! The first lookup of a namespace reads its `gatewayUrl` key and subscribes
//! to changes; later lookups only read memory. Entries are never evicted.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::info;
use waypoint_config::ConfigSource;

/// Key holding the gateway URL inside a version namespace
pub const GATEWAY_URL_KEY: &str = "gatewayUrl";

struct GatewayWatch {
    url: RwLock<String>,
    ready: OnceCell<()>,
}

/// Cache of gateway URLs kept fresh by config subscriptions
pub struct GatewayCache {
    source: Arc<dyn ConfigSource>,
    entries: DashMap<String, Arc<GatewayWatch>>,
}

impl GatewayCache {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            entries: DashMap::new(),
        }
    }

    /// Gateway URL for `namespace`, creating its watch on first use.
    /// Empty when no gateway is configured.
    pub async fn get_or_create(&self, namespace: &str) -> String {
        let watch = Arc::clone(
            self.entries
                .entry(namespace.to_string())
                .or_insert_with(|| {
                    Arc::new(GatewayWatch {
                        url: RwLock::new(String::new()),
                        ready: OnceCell::new(),
                    })
                })
                .value(),
        );

        watch
            .ready
            .get_or_init(|| self.start_watch(namespace, &watch))
            .await;

        let url = watch.url.read().clone();
        url
    }

    /// Cached value without creating a watch
    pub fn cached(&self, namespace: &str) -> Option<String> {
        self.entries
            .get(namespace)
            .filter(|watch| watch.ready.initialized())
            .map(|watch| watch.url.read().clone())
    }

    /// Number of namespaces being watched
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn start_watch(&self, namespace: &str, watch: &Arc<GatewayWatch>) {
        let key = format!("{}/{}", namespace, GATEWAY_URL_KEY);
        info!(namespace, "Creating a gatewayUrl watch");

        let initial = self.source.get_string(&key).await.unwrap_or_default();
        *watch.url.write() = initial;

        let entry: Weak<GatewayWatch> = Arc::downgrade(watch);
        let namespace = namespace.to_string();
        self.source.subscribe(
            &key,
            Arc::new(move |_key: &str, value: &str| {
                if let Some(watch) = entry.upgrade() {
                    info!(namespace = %namespace, value, "Updated gatewayUrl");
                    *watch.url.write() = value.to_string();
                }
            }),
        );
    }
}
