//! Service Discovery Library
//!
//! GradMesh service registry, health monitoring and load balancing.
//!
//! - **Registry**: instances keyed by `{name}@{host}:{port}`, mirrored into the
//!   shared key-value store so lookups survive the loss of the local map
//! - **Health checking**: periodic HTTP liveness probes with per-probe timeouts
//! - **Load balancing**: round-robin, least-loaded, first-available and random
//!
//! # Quick Start
//!
//! ```no_run
//! use gradmesh_shared::{EventBus, InMemoryKvStore, MeshConfig};
//! use service_discovery::{
//!     HealthMonitor, LoadBalancer, LoadBalancerImpl, ServiceRegistration, ServiceRegistry,
//!     ServiceRegistryImpl,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::default();
//!     let registry: Arc<dyn ServiceRegistry> = Arc::new(ServiceRegistryImpl::new(
//!         config.registry.clone(),
//!         Arc::new(InMemoryKvStore::new()),
//!         Arc::new(EventBus::default()),
//!     ));
//!
//!     registry
//!         .register(ServiceRegistration::new("user-service", "localhost", 8001))
//!         .await?;
//!
//!     let monitor = Arc::new(HealthMonitor::with_http_probe(
//!         config.health_check.clone(),
//!         registry.clone(),
//!     )?);
//!     let cancel = CancellationToken::new();
//!     tokio::spawn({
//!         let cancel = cancel.clone();
//!         async move { monitor.run(cancel).await }
//!     });
//!
//!     let lb = LoadBalancerImpl::new(registry, config.load_balancer.strategy);
//!     let _instance = lb.pick("user-service").await;
//!
//!     cancel.cancel();
//!     Ok(())
//! }
//! ```

use gradmesh_shared::SharedError;
use thiserror::Error;

pub mod health;
pub mod load_balancer;
pub mod models;
pub mod registry;

// Re-export commonly used types
pub use health::{HealthMonitor, HealthMonitoringStats, HealthProbe, HttpHealthProbe};
pub use load_balancer::{LoadBalancer, LoadBalancerImpl, LoadBalancerStats};
pub use models::{
    instance_id, HealthCheckResult, ProbeOutcome, RegistryStatistics, ServiceInfo,
    ServiceRegistration, ServiceStatus,
};
pub use registry::{ServiceRegistry, ServiceRegistryImpl};

/// Service Discovery library errors
#[derive(Error, Debug)]
pub enum ServiceDiscoveryError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No healthy instance available for service: {0}")]
    NoHealthyInstance(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] SharedError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Result type alias for the service discovery library
pub type Result<T> = std::result::Result<T, ServiceDiscoveryError>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version recorded when a registration does not name one
pub const DEFAULT_SERVICE_VERSION: &str = "1.0.0";

/// Utility functions and helpers
pub mod utils {
    use crate::models::ServiceRegistration;
    use crate::ServiceDiscoveryError;

    /// Validate service name according to RFC 1123
    pub fn validate_service_name(name: &str) -> Result<(), ServiceDiscoveryError> {
        if name.is_empty() || name.len() > 63 {
            return Err(ServiceDiscoveryError::Validation(format!(
                "service name must be 1-63 characters: {:?}",
                name
            )));
        }

        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ServiceDiscoveryError::Validation(format!(
                "service name may only contain alphanumerics and '-': {:?}",
                name
            )));
        }

        if name.starts_with('-') || name.ends_with('-') {
            return Err(ServiceDiscoveryError::Validation(format!(
                "service name may not start or end with '-': {:?}",
                name
            )));
        }

        Ok(())
    }

    /// Validate a full registration request
    pub fn validate_registration(
        registration: &ServiceRegistration,
    ) -> Result<(), ServiceDiscoveryError> {
        validate_service_name(&registration.name)?;

        if registration.host.trim().is_empty() {
            return Err(ServiceDiscoveryError::Validation(
                "host must not be empty".to_string(),
            ));
        }
        if registration.port == 0 {
            return Err(ServiceDiscoveryError::Validation(
                "port must be non-zero".to_string(),
            ));
        }
        if registration.version.trim().is_empty() {
            return Err(ServiceDiscoveryError::Validation(
                "version must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        health::{HealthMonitor, HealthMonitoringStats, HealthProbe},
        load_balancer::{LoadBalancer, LoadBalancerImpl},
        models::{ServiceInfo, ServiceRegistration, ServiceStatus},
        registry::{ServiceRegistry, ServiceRegistryImpl},
        utils, Result, ServiceDiscoveryError,
    };
}
