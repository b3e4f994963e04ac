//! Service router for routing requests to downstream microservices

use crate::{
    error::{ApiError, Result},
    services::circuit_breaker::CircuitBreakerRegistry,
};
use gradmesh_shared::{topics, EventBus, GatewayConfig, RouteConfig};
use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_discovery::{LoadBalancer, ServiceInfo};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Methods the gateway forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(ApiError::configuration(format!("unsupported method {}", other))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request to forward
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    pub path: String,
    pub payload: Option<Value>,
    pub headers: HashMap<String, String>,
}

impl GatewayRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            payload: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Successful upstream answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
    pub service: String,
    pub instance_id: String,
    pub duration_ms: u64,
}

/// Path-prefix router forwarding to load-balanced, breaker-guarded services
pub struct ApiGateway {
    routes: RwLock<Vec<RouteConfig>>,
    http_client: Client,
    upstream_timeout: Duration,
    load_balancer: Arc<dyn LoadBalancer>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
}

impl ApiGateway {
    pub fn new(
        config: &GatewayConfig,
        load_balancer: Arc<dyn LoadBalancer>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.upstream_timeout())
            .build()
            .map_err(|e| ApiError::configuration(format!("HTTP client: {}", e)))?;

        let gateway = Self {
            routes: RwLock::new(Vec::new()),
            http_client,
            upstream_timeout: config.upstream_timeout(),
            load_balancer,
            breakers,
            events,
        };
        for route in &config.routes {
            gateway.add_route(&route.prefix, &route.service)?;
        }
        Ok(gateway)
    }

    /// Add or replace a route
    pub fn add_route(&self, prefix: &str, service: &str) -> Result<()> {
        if !prefix.starts_with('/') {
            return Err(ApiError::configuration(format!(
                "route prefix must start with '/': {}",
                prefix
            )));
        }
        if service.trim().is_empty() {
            return Err(ApiError::configuration("route service must not be empty"));
        }

        let prefix = normalize_prefix(prefix);
        let mut routes = self.routes.write();
        routes.retain(|r| r.prefix != prefix);
        routes.push(RouteConfig {
            prefix,
            service: service.to_string(),
        });
        // Longest prefix first
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then(a.prefix.cmp(&b.prefix)));
        Ok(())
    }

    pub fn remove_route(&self, prefix: &str) -> bool {
        let prefix = normalize_prefix(prefix);
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.prefix != prefix);
        routes.len() != before
    }

    pub fn routes(&self) -> Vec<RouteConfig> {
        self.routes.read().clone()
    }

    /// Target service for a path by longest matching prefix
    pub fn resolve(&self, path: &str) -> Option<String> {
        let path = path.split('?').next().unwrap_or(path);
        self.routes
            .read()
            .iter()
            .find(|route| prefix_matches(&route.prefix, path))
            .map(|route| route.service.clone())
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Resolve, gate, pick and forward one request
    pub async fn route(&self, request: GatewayRequest) -> Result<GatewayResponse> {
        let service = self
            .resolve(&request.path)
            .ok_or_else(|| ApiError::service_not_found(&request.path))?;

        let result = self.forward(&service, &request).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.error_type(),
        };
        metrics::counter!(
            "gateway_requests_total",
            "service" => service.clone(),
            "outcome" => outcome
        )
        .increment(1);

        match &result {
            Ok(response) => {
                self.events.emit(
                    topics::REQUEST_COMPLETED,
                    json!({
                        "service": service,
                        "instance_id": response.instance_id,
                        "method": request.method.as_str(),
                        "path": request.path,
                        "status": response.status,
                        "duration_ms": response.duration_ms,
                    }),
                );
            }
            Err(err) => {
                self.events.emit(
                    topics::REQUEST_FAILED,
                    json!({
                        "service": service,
                        "method": request.method.as_str(),
                        "path": request.path,
                        "error": err.error_type(),
                        "message": err.to_string(),
                    }),
                );
            }
        }
        result
    }

    async fn forward(&self, service: &str, request: &GatewayRequest) -> Result<GatewayResponse> {
        let breaker = self.breakers.breaker(service);
        let permit = breaker.try_acquire().ok_or_else(|| {
            warn!(service, "Circuit breaker is open, failing fast");
            ApiError::service_unavailable(service, "circuit open")
        })?;

        let instance = match self.load_balancer.pick(service).await {
            Ok(instance) => instance,
            Err(err) => {
                permit.release();
                return Err(ApiError::from_discovery(service, err));
            }
        };

        debug!(service, instance = %instance.instance_id, path = %request.path, "Forwarding request");
        let started = Instant::now();
        let outcome = timeout(self.upstream_timeout, self.send(&instance, request)).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("gateway_upstream_duration_ms", "service" => service.to_string())
            .record(duration_ms as f64);

        match outcome {
            Err(_) => {
                permit.failure();
                warn!(service, instance = %instance.instance_id, "Upstream call timed out");
                Err(ApiError::UpstreamTimeout {
                    service: service.to_string(),
                    timeout_ms: self.upstream_timeout.as_millis() as u64,
                })
            }
            Ok(Err(err)) => {
                permit.failure();
                let timed_out = err.is_timeout();
                warn!(service, instance = %instance.instance_id, error = %err, "Upstream call failed");
                if timed_out {
                    Err(ApiError::UpstreamTimeout {
                        service: service.to_string(),
                        timeout_ms: self.upstream_timeout.as_millis() as u64,
                    })
                } else {
                    Err(ApiError::UpstreamError {
                        service: service.to_string(),
                        status: None,
                        message: err.to_string(),
                    })
                }
            }
            Ok(Ok((status, body))) if (200..300).contains(&status) => {
                permit.success();
                Ok(GatewayResponse {
                    status,
                    body,
                    service: service.to_string(),
                    instance_id: instance.instance_id,
                    duration_ms,
                })
            }
            Ok(Ok((status, body))) => {
                // The dependency answered; only server errors count against it
                if status >= 500 {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(ApiError::UpstreamError {
                    service: service.to_string(),
                    status: Some(status),
                    message: match body {
                        Value::String(text) => text,
                        other => other.to_string(),
                    },
                })
            }
        }
    }

    async fn send(
        &self,
        instance: &ServiceInfo,
        request: &GatewayRequest,
    ) -> std::result::Result<(u16, Value), reqwest::Error> {
        let url = format!("{}{}", instance.base_url(), request.path);
        let mut builder = self.http_client.request(request.method.into(), &url);
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Prefix match on a path-segment boundary
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
