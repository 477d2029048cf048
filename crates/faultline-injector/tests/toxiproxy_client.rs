//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Toxiproxy REST client against a mocked controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use faultline_injector::{
    FaultConfiguration, FaultError, FaultInjector, FaultType, Interceptor, Proxy, ProxyBackend,
    Toxic, ToxiproxyClient,
};
use serde_json::json;
use wiremock::matchers::{body_json, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> ToxiproxyClient {
    ToxiproxyClient::new(server.uri(), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn create_proxy_posts_definition() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/proxies"))
        .and(body_json(json!({
            "name": "bridge_latency_1",
            "listen": "127.0.0.1:0",
            "upstream": "127.0.0.1:8080",
            "enabled": true
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .create_proxy(&Proxy::new("bridge_latency_1", "127.0.0.1:0", "127.0.0.1:8080"))
        .await
        .unwrap();
}

#[tokio::test]
async fn toxic_lifecycle_hits_expected_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/proxies/api/toxics"))
        .and(body_json(json!({
            "name": "api_latency",
            "type": "latency",
            "stream": "downstream",
            "toxicity": 1.0,
            "attributes": {"latency": 100, "jitter": 10}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/proxies/api/toxics/api_latency"))
        .and(body_json(json!({"attributes": {"latency": 200, "jitter": 20}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/proxies/api"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let toxic = Toxic::downstream("api_latency", "latency")
        .with_attribute("latency", 100)
        .with_attribute("jitter", 10);
    client.add_toxic("api", &toxic).await.unwrap();
    let raised = toxic
        .with_attribute("latency", 200)
        .with_attribute("jitter", 20);
    client.update_toxic("api", &raised).await.unwrap();
    client.delete_proxy("api").await.unwrap();
}

#[tokio::test]
async fn list_proxies_returns_names() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/proxies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "api": {"name": "api", "listen": "127.0.0.1:1", "upstream": "127.0.0.1:2", "enabled": true},
            "db": {"name": "db", "listen": "127.0.0.1:3", "upstream": "127.0.0.1:4", "enabled": true}
        })))
        .mount(&server)
        .await;

    assert_eq!(
        client(&server).list_proxies().await.unwrap(),
        vec!["api".to_string(), "db".to_string()]
    );
}

#[tokio::test]
async fn error_statuses_map_to_request_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/proxies"))
        .respond_with(ResponseTemplate::new(409).set_body_string("proxy already exists"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/proxies/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .create_proxy(&Proxy::new("dup", "127.0.0.1:0", "127.0.0.1:1"))
        .await
        .unwrap_err();
    match err {
        FaultError::ProxyRequest(message) => assert!(message.contains("409")),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(
        client.delete_proxy("missing").await,
        Err(FaultError::ProxyRequest(_))
    ));
}

#[tokio::test]
async fn unreachable_controller_is_unavailable() {
    let client = ToxiproxyClient::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
    assert!(matches!(
        client.ping().await,
        Err(FaultError::ProxyUnavailable(_))
    ));
}

#[tokio::test]
async fn injector_drives_the_http_backend_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("2.9.0"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/proxies"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/proxies/bridge_bandwidth_[0-9a-f]{8}_1/toxics$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path_regex(r"^/proxies/bridge_bandwidth_[0-9a-f]{8}_1$"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let injector = FaultInjector::builder()
        .proxy_backend(Arc::new(client(&server)))
        .interceptor(Arc::new(Interceptor::new()))
        .build();
    let config = FaultConfiguration::new(FaultType::BandwidthLimit, "bridge", 0.5)
        .with_param("port", 8080);
    let result = injector.inject_fault(config).await.unwrap();
    assert_eq!(
        result.artifacts[0].identifier,
        format!("bridge_bandwidth_{}", result.fault_id.resource_suffix())
    );
    assert!(injector.remove_fault(result.fault_id).await);
}
