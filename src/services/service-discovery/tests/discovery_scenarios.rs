//! Scenario tests for the registry, HTTP health monitor and load balancer
//!
//! Upstream services are stood up with wiremock so the health probes issue
//! real HTTP requests.

use gradmesh_shared::{
    EventBus, HealthCheckConfig, InMemoryKvStore, LoadBalancingStrategy, RegistryConfig,
};
use pretty_assertions::assert_eq;
use service_discovery::{
    HealthMonitor, LoadBalancer, LoadBalancerImpl, ServiceRegistration, ServiceRegistry,
    ServiceRegistryImpl, ServiceStatus,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn new_registry() -> Arc<dyn ServiceRegistry> {
    Arc::new(ServiceRegistryImpl::new(
        RegistryConfig::default(),
        Arc::new(InMemoryKvStore::new()),
        Arc::new(EventBus::default()),
    ))
}

async fn upstream(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health/"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn registration_for(name: &str, server: &MockServer) -> ServiceRegistration {
    let address = server.address();
    ServiceRegistration::new(name, address.ip().to_string(), address.port())
}

#[tokio::test]
async fn test_order_service_routes_only_to_healthy_instance() {
    let healthy = upstream(200).await;
    let failing = upstream(503).await;

    let registry = new_registry();
    registry
        .register(registration_for("order-service", &healthy))
        .await
        .unwrap();
    registry
        .register(registration_for("order-service", &failing))
        .await
        .unwrap();

    let monitor = HealthMonitor::with_http_probe(HealthCheckConfig::default(), registry.clone())
        .unwrap();
    monitor.check_all().await;

    let lb = LoadBalancerImpl::new(registry.clone(), LoadBalancingStrategy::RoundRobin);
    let expected_port = healthy.address().port();
    for _ in 0..10 {
        let picked = lb.pick("order-service").await.unwrap();
        assert_eq!(picked.port, expected_port);
    }

    let instances = registry.get("order-service").await.unwrap();
    let failing_port = failing.address().port();
    let failing_info = instances
        .iter()
        .find(|info| info.port == failing_port)
        .unwrap();
    assert_eq!(failing_info.status, ServiceStatus::Unhealthy);
}

#[tokio::test]
async fn test_slow_probe_times_out_and_marks_unhealthy() {
    let slow = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health/"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&slow)
        .await;

    let registry = new_registry();
    let info = registry
        .register(registration_for("user-service", &slow))
        .await
        .unwrap();

    let config = HealthCheckConfig {
        timeout_seconds: 1,
        ..HealthCheckConfig::default()
    };
    let monitor = HealthMonitor::with_http_probe(config, registry.clone()).unwrap();

    let result = monitor.check_service_health(&info.instance_id).await.unwrap();
    assert_eq!(result.status, ServiceStatus::Unhealthy);
    assert!(registry.healthy_instances().await.is_empty());
}

#[tokio::test]
async fn test_recovered_instance_is_healthy_again_only_after_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health/"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = new_registry();
    let info = registry
        .register(registration_for("project-service", &server))
        .await
        .unwrap();
    let monitor = HealthMonitor::with_http_probe(HealthCheckConfig::default(), registry.clone())
        .unwrap();

    monitor.check_all().await;
    let after_failure = registry.get_instance(&info.instance_id).await.unwrap();
    assert_eq!(after_failure.status, ServiceStatus::Unhealthy);

    monitor.check_all().await;
    let after_success = registry.get_instance(&info.instance_id).await.unwrap();
    assert_eq!(after_success.status, ServiceStatus::Healthy);
    assert!(after_success.last_response_time_ms.is_some());
}
