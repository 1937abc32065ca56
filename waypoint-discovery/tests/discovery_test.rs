//! Facade behaviour over the in-memory backend

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use waypoint_config::ConfigManager;
use waypoint_discovery::*;

fn discovery(backend: &InMemoryBackend, settings: Settings) -> Discovery {
    Discovery::with_backend(
        Arc::new(backend.clone()),
        Arc::new(ConfigManager::new()),
        settings,
    )
}

fn settings() -> Settings {
    Settings {
        base_url: Some("http://billing.internal:9000".into()),
        start_retry_delay_ms: 100,
        max_retry_delay_ms: 2_000,
        ..Settings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_register_returns_id_and_heartbeats() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(&backend, settings());

    let id = discovery
        .register_service(RegisterOptions::new("billing"))
        .await
        .unwrap();
    assert!(!id.is_empty());

    let mut state = discovery.registration_state().await.unwrap();
    state
        .wait_for(|s| *s == RegistrationState::Registered)
        .await
        .unwrap();
    assert!(backend.contains(&id));

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(backend.calls(Operation::Register), 1);
    assert_eq!(backend.calls(Operation::Refresh), 3);

    let url = discovery
        .discover_service(DiscoverOptions::new("billing").with_version("1.0.0"))
        .await
        .unwrap();
    assert_eq!(url, "http://billing.internal:9000");
}

#[tokio::test(start_paused = true)]
async fn test_register_options_override_settings() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(
        &backend,
        Settings {
            name: Some("from-config".into()),
            ..settings()
        },
    );

    discovery
        .register_service(
            RegisterOptions::new("billing")
                .with_environment("prod")
                .with_version("2.1.0")
                .with_ping_interval(5)
                .with_ttl(15),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(backend.calls(Operation::Refresh), 3);

    let url = discovery
        .discover_service(
            DiscoverOptions::new("billing")
                .with_environment("prod")
                .with_version("^2.0.0"),
        )
        .await
        .unwrap();
    assert_eq!(url, "http://billing.internal:9000");
    assert!(backend.query("dev", "from-config").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_name_falls_back_to_configuration() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(
        &backend,
        Settings {
            name: Some("from-config".into()),
            ..settings()
        },
    );

    discovery
        .register_service(RegisterOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.query("dev", "from-config").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_blank_register_options_use_settings() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(
        &backend,
        Settings {
            environment: "staging".into(),
            version: "3.1.0".into(),
            ..settings()
        },
    );

    discovery
        .register_service(
            RegisterOptions::new("billing")
                .with_environment("")
                .with_version(" "),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let records = backend.query("staging", "billing").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, "3.1.0");
    assert!(backend.query("", "billing").await.unwrap().is_empty());

    let url = discovery
        .discover_service(DiscoverOptions::new("billing").with_environment(""))
        .await
        .unwrap();
    assert_eq!(url, "http://billing.internal:9000");
}

#[tokio::test]
async fn test_register_without_name_fails() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(&backend, settings());

    let err = discovery
        .register_service(RegisterOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::InvalidConfiguration(_)));
    assert!(discovery.registration_state().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deregister_twice() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(&backend, settings());

    let id = discovery
        .register_service(RegisterOptions::new("billing"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(backend.contains(&id));

    discovery.deregister_service().await.unwrap();
    assert!(!backend.contains(&id));

    let deregisters = backend.calls(Operation::Deregister);
    let err = discovery.deregister_service().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NotRegistered));
    assert_eq!(backend.calls(Operation::Deregister), deregisters);
}

#[tokio::test(start_paused = true)]
async fn test_reregister_replaces_previous_identity() {
    let backend = InMemoryBackend::new();
    let discovery = discovery(&backend, settings());

    let first = discovery
        .register_service(RegisterOptions::new("billing"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = discovery
        .register_service(RegisterOptions::new("billing").with_version("1.1.0"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_ne!(first, second);
    assert!(!backend.contains(&first));
    assert!(backend.contains(&second));
    assert_eq!(backend.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_singleton_blocked_by_live_instance() {
    let backend = InMemoryBackend::new();
    backend.insert_instance("dev", "scheduler", "sched-0", "1.0.0", "http://10.0.0.2:9000");
    let discovery = discovery(&backend, settings());

    let id = discovery
        .register_service(RegisterOptions::new("scheduler").singleton())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!backend.contains(&id));
    assert_eq!(
        *discovery.registration_state().await.unwrap().borrow(),
        RegistrationState::FailedPendingRetry
    );
}

#[tokio::test]
async fn test_discovery_survives_backend_outage() {
    let backend = InMemoryBackend::new();
    backend.insert_instance("dev", "orders", "o-1", "1.0.0", "http://10.0.0.1:8080");
    let discovery = discovery(&backend, settings());
    let options = DiscoverOptions::new("orders");

    let url = discovery.discover_service(options.clone()).await.unwrap();
    backend.set_unavailable(true);
    assert_eq!(discovery.discover_service(options).await.unwrap(), url);
}

#[tokio::test]
async fn test_gateway_from_store_config_source() {
    let backend = InMemoryBackend::new();
    backend.insert_instance("dev", "orders", "o-1", "1.0.0", "http://10.0.0.1:8080");
    backend.set_key(
        "/environments/dev/services/orders/1.0.0/gatewayUrl",
        Some("http://gw.example.com/orders"),
    );

    let source = StoreConfigSource::new(Arc::new(backend.clone()));
    let discovery = Discovery::with_backend(Arc::new(backend.clone()), Arc::new(source), settings());

    let options = DiscoverOptions::new("orders");
    assert_eq!(
        discovery.discover_service(options.clone()).await.unwrap(),
        "http://gw.example.com/orders"
    );

    backend.set_key(
        "/environments/dev/services/orders/1.0.0/gatewayUrl",
        Some("http://gw-2.example.com/orders"),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        discovery.discover_service(options).await.unwrap(),
        "http://gw-2.example.com/orders"
    );
}

#[test]
fn test_new_rejects_unknown_backend() {
    let err = Discovery::new(DiscoveryOptions::new("zookeeper")).err().unwrap();
    assert!(matches!(err, DiscoveryError::UnknownBackend(_)));
}

#[test]
fn test_new_reads_config_file() {
    let path = std::env::temp_dir().join(format!(
        "waypoint-discovery-{}-app.toml",
        std::process::id()
    ));
    fs::write(
        &path,
        r#"
            name = "billing"
            version = "1.4.0"

            [env]
            name = "staging"

            [discovery]
            ttl = 40
            ping-interval = 10

            [discovery.etcd]
            hosts = "http://etcd-1:2379, http://etcd-2:2379"
        "#,
    )
    .unwrap();

    let discovery = Discovery::new(DiscoveryOptions::new("etcd").with_config_path(&path)).unwrap();
    fs::remove_file(&path).ok();

    let settings = discovery.settings();
    assert_eq!(settings.name.as_deref(), Some("billing"));
    assert_eq!(settings.environment, "staging");
    assert_eq!(settings.ttl, 40);
    assert_eq!(settings.ping_interval, 10);
    assert_eq!(discovery.backend().name(), "etcd");

    let consul = Discovery::new(DiscoveryOptions::new("Consul")).unwrap();
    assert_eq!(consul.backend().name(), "consul");
    assert_eq!(consul.settings().consul_hosts, "http://localhost:8500");
}
