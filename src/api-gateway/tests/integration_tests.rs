//! Integration tests for the gateway and service mesh
//!
//! Upstream services are wiremock servers answering both the health probe
//! and forwarded calls.

use api_gateway::{
    ApiError, CircuitBreaker, CircuitState, GatewayRequest, HttpMethod, ServiceMesh,
};
use gradmesh_security::RequestContext;
use gradmesh_shared::{topics, CircuitBreakerConfig, GatewayConfig, MeshConfig, RouteConfig};
use pretty_assertions::assert_eq;
use serde_json::json;
use service_discovery::ServiceRegistration;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn registration(name: &str, server: &MockServer) -> ServiceRegistration {
    let address = server.address();
    ServiceRegistration::new(name, address.ip().to_string(), address.port())
}

fn mesh_config(failure_threshold: u32) -> MeshConfig {
    MeshConfig {
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold,
            recovery_timeout_seconds: 60,
        },
        gateway: GatewayConfig {
            upstream_timeout_seconds: 1,
            routes: vec![RouteConfig {
                prefix: "/api/orders".to_string(),
                service: "order-service".to_string(),
            }],
        },
        ..MeshConfig::default()
    }
}

async fn mesh_with(server: &MockServer, failure_threshold: u32) -> ServiceMesh {
    let mesh = ServiceMesh::builder(mesh_config(failure_threshold))
        .build()
        .unwrap();
    mesh.register(registration("order-service", server))
        .await
        .unwrap();
    mesh.health_monitor().check_all().await;
    mesh
}

#[tokio::test(start_paused = true)]
async fn test_breaker_six_failures_then_half_open_trial() {
    let breaker = CircuitBreaker::new(
        "order-service",
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
        },
    );

    let mut checks = Vec::new();
    for _ in 0..6 {
        let allowed = breaker.allow();
        checks.push(allowed);
        if allowed {
            breaker.on_failure();
        }
    }
    assert_eq!(checks, vec![true, true, true, true, true, false]);
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.allow(), "seventh check admits the trial call");
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(!breaker.allow(), "only one trial at a time");

    breaker.on_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_forwards_to_healthy_instance_and_publishes_completion() {
    let server = upstream().await;
    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let mesh = mesh_with(&server, 5).await;
    let mut completed = mesh.events().subscribe(topics::REQUEST_COMPLETED);

    let response = mesh
        .route(GatewayRequest::new(HttpMethod::Post, "/api/orders").with_payload(json!({"sku": "A1"})))
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.body, json!({"id": 7}));
    assert_eq!(response.service, "order-service");

    let event = completed.recv().await.unwrap();
    assert_eq!(event.payload["status"], 201);
    assert_eq!(event.payload["service"], "order-service");
}

#[tokio::test]
async fn test_server_errors_open_circuit_and_fail_fast() {
    let server = upstream().await;
    Mock::given(path_regex("^/api/orders"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let mesh = mesh_with(&server, 3).await;
    for _ in 0..3 {
        let err = mesh
            .route(GatewayRequest::new(HttpMethod::Get, "/api/orders/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UpstreamError { status: Some(500), .. }));
    }

    // No network call once open; the mock's expectation of 3 verifies this
    let err = mesh
        .route(GatewayRequest::new(HttpMethod::Get, "/api/orders/1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ServiceUnavailable { .. }));
    assert_eq!(err.status_code().as_u16(), 503);

    let status = mesh.status().await;
    assert_eq!(status.circuits[0].state, CircuitState::Open);
    assert_eq!(status.circuits[0].rejected_calls, 1);
}

#[tokio::test]
async fn test_client_errors_do_not_trip_breaker() {
    let server = upstream().await;
    Mock::given(path("/api/orders/404"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such order"))
        .mount(&server)
        .await;

    let mesh = mesh_with(&server, 1).await;
    for _ in 0..3 {
        match mesh
            .route(GatewayRequest::new(HttpMethod::Get, "/api/orders/404"))
            .await
        {
            Err(ApiError::UpstreamError { status, message, .. }) => {
                assert_eq!(status, Some(404));
                assert_eq!(message, "no such order");
            }
            other => panic!("expected UpstreamError, got {:?}", other),
        }
    }
    assert_eq!(mesh.breakers().breaker("order-service").state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_slow_upstream_times_out_and_counts_as_failure() {
    let server = upstream().await;
    Mock::given(path("/api/orders/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mesh = mesh_with(&server, 5).await;
    let err = mesh
        .route(GatewayRequest::new(HttpMethod::Get, "/api/orders/slow"))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::UpstreamTimeout { timeout_ms: 1000, .. }));
    assert_eq!(mesh.breakers().breaker("order-service").failure_count(), 1);
}

#[tokio::test]
async fn test_security_short_circuits_before_routing() {
    let server = upstream().await;
    Mock::given(path_regex("^/api/orders"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mesh = mesh_with(&server, 5).await;
    let mut blocked = mesh.events().subscribe(topics::SECURITY_THREAT_BLOCKED);

    let ctx = RequestContext::new("203.0.113.50".parse().unwrap(), "POST", "/api/orders")
        .with_payload("sku=A1' OR 1=1 --");
    let err = mesh.handle(ctx).await.unwrap_err();

    assert!(matches!(err, ApiError::ThreatBlocked { .. }));
    assert_eq!(err.status_code().as_u16(), 403);
    assert_eq!(blocked.recv().await.unwrap().payload["path"], "/api/orders");
}

#[tokio::test]
async fn test_unknown_route_and_unregistered_service() {
    let server = upstream().await;
    let mesh = mesh_with(&server, 5).await;

    let err = mesh
        .route(GatewayRequest::new(HttpMethod::Get, "/api/unknown"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ServiceNotFound { .. }));

    mesh.gateway().add_route("/api/invoices", "invoice-service").unwrap();
    let err = mesh
        .route(GatewayRequest::new(HttpMethod::Get, "/api/invoices/1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ServiceNotFound { .. }));
    assert_eq!(mesh.breakers().breaker("invoice-service").failure_count(), 0);
}
