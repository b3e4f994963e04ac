//! GradMesh API Gateway Library
//!
//! Path-prefix routing to load-balanced, circuit-breaker-guarded services,
//! and the [`ServiceMesh`] composition root that wires the registry, health
//! monitor, gateway and security pipeline together.
//!
//! ```no_run
//! use api_gateway::{GatewayRequest, HttpMethod, ServiceMesh};
//! use gradmesh_shared::MeshConfig;
//! use service_discovery::ServiceRegistration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> api_gateway::Result<()> {
//! let mesh = ServiceMesh::builder(MeshConfig::default()).build()?;
//! mesh.register(ServiceRegistration::new("user-service", "localhost", 8001)).await?;
//!
//! let cancel = CancellationToken::new();
//! mesh.start(cancel.clone());
//!
//! let response = mesh
//!     .route(GatewayRequest::new(HttpMethod::Get, "/api/users/42"))
//!     .await?;
//! println!("{} from {}", response.status, response.instance_id);
//!
//! mesh.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod mesh;
pub mod services;

// Re-export main types and functions for external use
pub use error::{ApiError, ErrorResponse, Result};
pub use mesh::{MeshBuilder, MeshStatus, ServiceMesh};
pub use services::circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState,
};
pub use services::router::{ApiGateway, GatewayRequest, GatewayResponse, HttpMethod};
