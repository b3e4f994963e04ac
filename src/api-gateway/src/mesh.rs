//! Service mesh composition root
//!
//! Builds the registry, health monitor, load balancer, circuit breakers,
//! gateway and security pipeline explicitly and owns their background tasks.

use crate::error::{ApiError, Result};
use crate::services::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::services::router::{ApiGateway, GatewayRequest, GatewayResponse};

use gradmesh_security::{RequestContext, SecurityManager};
use gradmesh_shared::{EventBus, InMemoryKvStore, KvStore, MeshConfig, RouteConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_discovery::{
    HealthMonitor, HealthMonitoringStats, HealthProbe, HttpHealthProbe, LoadBalancer,
    LoadBalancerImpl, RegistryStatistics, ServiceDiscoveryError, ServiceInfo,
    ServiceRegistration, ServiceRegistry, ServiceRegistryImpl,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mesh-wide status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshStatus {
    pub environment: String,
    pub running: bool,
    pub background_tasks: usize,
    pub registry: RegistryStatistics,
    pub health: HealthMonitoringStats,
    pub circuits: Vec<CircuitBreakerSnapshot>,
    pub routes: Vec<RouteConfig>,
}

/// Assembles a [`ServiceMesh`]; every collaborator can be replaced
pub struct MeshBuilder {
    config: MeshConfig,
    store: Option<Arc<dyn KvStore>>,
    events: Option<Arc<EventBus>>,
    probe: Option<Arc<dyn HealthProbe>>,
    security: Option<Arc<SecurityManager>>,
    security_enabled: bool,
}

impl MeshBuilder {
    /// Shared key-value store for registry snapshots
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Liveness probe used by the health monitor
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self.security_enabled = true;
        self
    }

    /// Route requests without the security pipeline
    pub fn without_security(mut self) -> Self {
        self.security = None;
        self.security_enabled = false;
        self
    }

    pub fn build(self) -> Result<ServiceMesh> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ApiError::configuration(e.to_string()))?;
        let events = self.events.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryKvStore::new()) as Arc<dyn KvStore>);

        let registry: Arc<dyn ServiceRegistry> = Arc::new(ServiceRegistryImpl::new(
            config.registry.clone(),
            store,
            events.clone(),
        ));

        let probe: Arc<dyn HealthProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(
                HttpHealthProbe::new(&config.health_check)
                    .map_err(|e| ApiError::configuration(e.to_string()))?,
            ),
        };
        let monitor = Arc::new(HealthMonitor::new(
            config.health_check.clone(),
            registry.clone(),
            probe,
        ));

        let load_balancer: Arc<dyn LoadBalancer> = Arc::new(LoadBalancerImpl::new(
            registry.clone(),
            config.load_balancer.strategy,
        ));
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone()).with_events(events.clone()),
        );
        let gateway = ApiGateway::new(
            &config.gateway,
            load_balancer.clone(),
            breakers.clone(),
            events.clone(),
        )?;

        let security = match (self.security, self.security_enabled) {
            (Some(security), _) => Some(security),
            (None, true) => Some(Arc::new(
                SecurityManager::new(config.security.clone())?.with_events(events.clone()),
            )),
            (None, false) => None,
        };

        Ok(ServiceMesh {
            config,
            events,
            registry,
            monitor,
            load_balancer,
            breakers,
            gateway,
            security,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled mesh façade handed to request handlers
pub struct ServiceMesh {
    config: MeshConfig,
    events: Arc<EventBus>,
    registry: Arc<dyn ServiceRegistry>,
    monitor: Arc<HealthMonitor>,
    load_balancer: Arc<dyn LoadBalancer>,
    breakers: Arc<CircuitBreakerRegistry>,
    gateway: ApiGateway,
    security: Option<Arc<SecurityManager>>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceMesh {
    pub fn builder(config: MeshConfig) -> MeshBuilder {
        MeshBuilder {
            config,
            store: None,
            events: None,
            probe: None,
            security: None,
            security_enabled: true,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.load_balancer
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }

    pub fn security(&self) -> Option<&Arc<SecurityManager>> {
        self.security.as_ref()
    }

    /// Register (or refresh) a service instance
    pub async fn register(&self, registration: ServiceRegistration) -> Result<ServiceInfo> {
        let name = registration.name.clone();
        self.registry
            .register(registration)
            .await
            .map_err(|err| match err {
                ServiceDiscoveryError::Validation(message) => ApiError::configuration(message),
                other => ApiError::from_discovery(&name, other),
            })
    }

    pub async fn deregister(&self, name: &str, host: &str, port: u16) -> Result<ServiceInfo> {
        self.registry
            .deregister(name, host, port)
            .await
            .map_err(|err| ApiError::from_discovery(name, err))
    }

    /// Route a request without security evaluation
    pub async fn route(&self, request: GatewayRequest) -> Result<GatewayResponse> {
        self.gateway.route(request).await
    }

    /// Security pipeline first, then routing
    pub async fn handle(&self, ctx: RequestContext) -> Result<GatewayResponse> {
        if let Some(security) = &self.security {
            security.evaluate_request(&ctx)?;
        }

        let mut request = GatewayRequest::new(ctx.method.parse()?, ctx.path.clone());
        if let Some(payload) = &ctx.payload {
            request = request.with_payload(
                serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.clone())),
            );
        }
        request = request.with_header("x-request-id", ctx.request_id.to_string());
        if let Some(user_id) = &ctx.user_id {
            request = request.with_header("x-user-id", user_id.clone());
        }

        self.gateway.route(request).await
    }

    /// Start the health monitor under `cancel`; later calls are ignored
    pub fn start(&self, cancel: CancellationToken) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Service mesh already started");
            return;
        }

        let token = self.cancel.clone();
        // Either token stops the mesh
        self.spawn_background({
            let token = token.clone();
            async move {
                cancel.cancelled().await;
                token.cancel();
            }
        });

        let monitor = self.monitor.clone();
        self.spawn_background(async move { monitor.run(token).await });
        info!(environment = %self.config.environment, "Service mesh started");
    }

    /// Run a future as a mesh background task, stopped by [`ServiceMesh::shutdown`]
    pub fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Token cancelled when the mesh shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and await every background task
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        info!(tasks = count, "Service mesh stopped");
    }

    pub async fn status(&self) -> MeshStatus {
        let background_tasks = self.tasks.lock().iter().filter(|t| !t.is_finished()).count();
        MeshStatus {
            environment: self.config.environment.clone(),
            running: !self.cancel.is_cancelled() && background_tasks > 0,
            background_tasks,
            registry: self.registry.statistics().await,
            health: self.monitor.stats(),
            circuits: self.breakers.snapshots(),
            routes: self.gateway.routes(),
        }
    }
}
