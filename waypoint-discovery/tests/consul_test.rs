//! Consul adapter against a mock agent

use base64::{Engine as _, engine::general_purpose};
use serde_json::json;
use std::time::Duration;
use waypoint_discovery::*;
use wiremock::matchers::{body_json, body_partial_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registration(id: &str) -> ServiceRegistration {
    ServiceRegistration {
        identity: ServiceIdentity {
            id: id.to_string(),
            name: "billing".into(),
            environment: "dev".into(),
            version: "1.4.0".into(),
            singleton: false,
        },
        ttl: Duration::from_secs(30),
        protocol: "http".into(),
        address: Some("10.0.0.7".into()),
        port: 9000,
        base_url: None,
    }
}

fn health_entry(id: &str, address: &str, port: u16, tags: &[&str]) -> serde_json::Value {
    json!({
        "Node": {"Node": "node-1", "Address": "192.168.1.10"},
        "Service": {
            "ID": id,
            "Service": "dev-orders",
            "Address": address,
            "Port": port,
            "Tags": tags,
        },
        "Checks": [],
    })
}

#[tokio::test]
async fn test_register_payload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_json(json!({
            "ID": "billing-1",
            "Name": "dev-billing",
            "Port": 9000,
            "Address": "10.0.0.7",
            "Tags": ["http", "version=1.4.0"],
            "Check": {
                "CheckID": "check-billing-1",
                "TTL": "30s",
                "DeregisterCriticalServiceAfter": "10s",
            },
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    consul.register(&registration("billing-1")).await.unwrap();
}

#[tokio::test]
async fn test_register_omits_unset_address() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(json!({"ID": "billing-1", "Name": "dev-billing"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut reg = registration("billing-1");
    reg.address = None;
    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    consul.register(&reg).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("Address").is_none());
}

#[tokio::test]
async fn test_register_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(500).set_body_string("agent unavailable"))
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    let err = consul.register(&registration("billing-1")).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::RegistrationFailed(ref m) if m.contains("agent unavailable")));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_heartbeat_updates_ttl_check() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/update/check-billing-1"))
        .and(body_partial_json(json!({"Status": "passing"})))
        .and(body_string_contains("serviceid=billing-1 time="))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    consul.refresh(&registration("billing-1")).await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_for_unknown_check_fails() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/update/check-billing-1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Unknown check"))
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    let err = consul.refresh(&registration("billing-1")).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Backend { status: 404, .. }));
}

#[tokio::test]
async fn test_deregister() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/billing-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    consul.deregister(&registration("billing-1")).await.unwrap();
}

#[tokio::test]
async fn test_query_builds_urls_from_tags_and_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/dev-orders"))
        .and(query_param("passing", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            health_entry("orders-a", "10.0.0.5", 8080, &["http", "version=1.0.0"]),
            health_entry("orders-b", "", 8443, &["https", "version=1.2.0"]),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    let records = consul.query("dev", "orders").await.unwrap();

    assert_eq!(
        records,
        vec![
            InstanceRecord {
                id: "orders-a".into(),
                version: "1.0.0".into(),
                url: "http://10.0.0.5:8080".into(),
                healthy: true,
            },
            InstanceRecord {
                id: "orders-b".into(),
                version: "1.2.0".into(),
                url: "https://192.168.1.10:8443".into(),
                healthy: true,
            },
        ]
    );
}

#[tokio::test]
async fn test_singleton_check_ignores_self_and_other_versions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/dev-billing"))
        .and(query_param("passing", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            health_entry("billing-1", "10.0.0.7", 9000, &["http", "version=1.4.0"]),
            health_entry("billing-old", "10.0.0.8", 9000, &["http", "version=1.3.0"]),
        ])))
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    assert!(!consul.is_registered(&registration("billing-1")).await.unwrap());
    assert!(consul.is_registered(&registration("billing-2")).await.unwrap());
}

#[tokio::test]
async fn test_read_and_watch_key() {
    let server = MockServer::start().await;
    let key = "/environments/dev/services/orders/1.0.0/gatewayUrl";

    Mock::given(method("GET"))
        .and(path("/v1/kv/environments/dev/services/orders/1.0.0/gatewayUrl"))
        .and(query_param("index", "7"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "9")
                .set_body_json(json!([{
                    "Key": "environments/dev/services/orders/1.0.0/gatewayUrl",
                    "Value": general_purpose::STANDARD.encode("http://gw-2"),
                    "ModifyIndex": 9,
                }])),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/kv/environments/dev/services/orders/1.0.0/gatewayUrl"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Consul-Index", "7")
                .set_body_json(json!([{
                    "Key": "environments/dev/services/orders/1.0.0/gatewayUrl",
                    "Value": general_purpose::STANDARD.encode("http://gw-1"),
                    "ModifyIndex": 7,
                }])),
        )
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri())
        .unwrap()
        .with_watch_wait(Duration::from_secs(1));

    let current = consul.read_key(key).await.unwrap();
    assert_eq!(current.value.as_deref(), Some("http://gw-1"));
    assert_eq!(current.index, 7);

    let changed = consul.watch_key(key, current.index).await.unwrap();
    assert_eq!(changed.value.as_deref(), Some("http://gw-2"));
    assert_eq!(changed.index, 9);
}

#[tokio::test]
async fn test_missing_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/gatewayUrl"))
        .respond_with(ResponseTemplate::new(404).insert_header("X-Consul-Index", "3"))
        .mount(&server)
        .await;

    let consul = ConsulDiscovery::new(server.uri()).unwrap();
    let kv = consul.read_key("gatewayUrl").await.unwrap();
    assert_eq!(kv, KeyValue { value: None, index: 3 });
}
