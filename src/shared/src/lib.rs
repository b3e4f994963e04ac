//! Shared configuration, key-value store and event bus for the GradMesh control plane

pub mod config;
pub mod events;
pub mod kv;

pub use self::config::{
    AutoscalerConfig, CacheConfig, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig,
    LoadBalancerConfig, LoadBalancingStrategy, LogFormat, MeshConfig, ObservabilityConfig,
    RegistryConfig, RouteConfig, SecurityConfig,
};
pub use self::events::{topics, EventBus, MeshEvent};
pub use self::kv::{InMemoryKvStore, KvStore};

#[cfg(feature = "redis")]
pub use self::kv::RedisKvStore;

/// Errors raised by the shared infrastructure
#[derive(Debug, thiserror::Error)]
pub enum SharedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::config::ConfigError> for SharedError {
    fn from(err: ::config::ConfigError) -> Self {
        SharedError::Config(err.to_string())
    }
}

pub type SharedResult<T> = Result<T, SharedError>;
