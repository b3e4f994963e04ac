//! Shared configuration types for the GradMesh control plane
//!
//! Every component takes its own section of [`MeshConfig`] so that the
//! composition root can load a single document and hand the pieces out.
//! Durations are stored as integer seconds (or milliseconds where noted)
//! and exposed through `Duration` accessors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::SharedError;

/// Top-level configuration for the whole control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Deployment environment name
    pub environment: String,
    /// Service registry settings
    pub registry: RegistryConfig,
    /// Health monitor settings
    pub health_check: HealthCheckConfig,
    /// Load balancer settings
    pub load_balancer: LoadBalancerConfig,
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// API gateway settings
    pub gateway: GatewayConfig,
    /// Multi-tier cache settings
    pub cache: CacheConfig,
    /// Autoscaler settings
    pub autoscaler: AutoscalerConfig,
    /// Security pipeline settings
    pub security: SecurityConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

/// Service registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TTL of the registry snapshot written to the shared store
    pub snapshot_ttl_seconds: u64,
    /// Age after which a healthy status is no longer trusted
    pub stale_after_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_seconds: 300,
            stale_after_seconds: 90,
        }
    }
}

impl RegistryConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the background health monitor
    pub enabled: bool,
    /// Probe interval in seconds
    pub interval_seconds: u64,
    /// Probe timeout in seconds
    pub timeout_seconds: u64,
    /// Liveness path appended to `http://{host}:{port}`
    pub path: String,
    /// Successful probes slower than this are reported as degraded
    pub degraded_threshold_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            timeout_seconds: 5,
            path: "/health/".to_string(),
            degraded_threshold_ms: 2000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn degraded_threshold(&self) -> Duration {
        Duration::from_millis(self.degraded_threshold_ms)
    }
}

/// Instance selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Rotate over the healthy set
    RoundRobin,
    /// Lowest last observed response time
    LeastLoaded,
    /// First healthy instance in id order
    FirstAvailable,
    /// Uniform random choice
    Random,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaking
    pub enabled: bool,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing a trial call
    pub recovery_timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

/// A single path-prefix route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix, e.g. `/api/users`
    pub prefix: String,
    /// Target service name in the registry
    pub service: String,
}

/// API gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Deadline for a forwarded call in seconds
    pub upstream_timeout_seconds: u64,
    /// Static route table
    pub routes: Vec<RouteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let route = |prefix: &str, service: &str| RouteConfig {
            prefix: prefix.to_string(),
            service: service.to_string(),
        };

        Self {
            upstream_timeout_seconds: 10,
            routes: vec![
                route("/api/users", "user-service"),
                route("/api/students", "student-service"),
                route("/api/advisors", "advisor-service"),
                route("/api/projects", "project-service"),
                route("/api/milestones", "milestone-service"),
            ],
        }
    }
}

impl GatewayConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }
}

/// Multi-tier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prefix for tier keys in the shared store
    pub key_prefix: String,
    pub l1_ttl_seconds: u64,
    pub l2_ttl_seconds: u64,
    pub l3_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache".to_string(),
            l1_ttl_seconds: 300,
            l2_ttl_seconds: 3600,
            l3_ttl_seconds: 86400,
        }
    }
}

/// Autoscaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    pub initial_instances: u32,
    /// Minimum seconds between two scaling actions
    pub cooldown_seconds: u64,
    /// Seconds between two metric collections
    pub evaluation_interval_seconds: u64,
    /// Number of samples kept in memory
    pub history_size: usize,
    /// CPU percentage above which capacity is added
    pub scale_up_cpu: f64,
    /// Memory percentage above which capacity is added
    pub scale_up_memory: f64,
    pub scale_up_response_time_ms: f64,
    /// CPU percentage below which capacity may be removed
    pub scale_down_cpu: f64,
    pub scale_down_memory: f64,
    pub scale_down_response_time_ms: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            initial_instances: 1,
            cooldown_seconds: 300,
            evaluation_interval_seconds: 60,
            history_size: 100,
            scale_up_cpu: 80.0,
            scale_up_memory: 85.0,
            scale_up_response_time_ms: 1000.0,
            scale_down_cpu: 30.0,
            scale_down_memory: 40.0,
            scale_down_response_time_ms: 200.0,
        }
    }
}

impl AutoscalerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds)
    }
}

/// Security pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Threat score at or above which a request is blocked
    pub threat_block_threshold: u32,
    /// Seconds an offending IP stays on the block-list
    pub block_duration_seconds: u64,
    /// Failed logins from one IP before brute-force scoring kicks in
    pub max_failed_logins: u32,
    /// Denials per user before an access anomaly is raised
    pub denial_alert_threshold: u32,
    /// Maximum retained audit events
    pub audit_max_entries: usize,
    /// Minimum accepted password length
    pub min_password_length: usize,
    /// Base64-encoded 32-byte AES-256-GCM key
    pub encryption_key: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            threat_block_threshold: 50,
            block_duration_seconds: 3600,
            max_failed_logins: 5,
            denial_alert_threshold: 10,
            audit_max_entries: 10_000,
            min_password_length: 12,
            encryption_key: None,
        }
    }
}

impl SecurityConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_seconds)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs
    Json,
    /// Pretty formatted logs for development
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl MeshConfig {
    /// Load configuration from config files and `GRADMESH__*` environment variables
    pub fn from_env() -> Result<Self, SharedError> {
        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let builder = config::Config::builder()
            .set_default("environment", environment.clone())?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::File::with_name(&format!("config/environments/{}", environment))
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("GRADMESH").separator("__"));

        let config: MeshConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings before any component is built
    pub fn validate(&self) -> Result<(), SharedError> {
        let scaler = &self.autoscaler;
        if scaler.min_instances > scaler.max_instances {
            return Err(SharedError::Config(format!(
                "autoscaler.min_instances ({}) exceeds max_instances ({})",
                scaler.min_instances, scaler.max_instances
            )));
        }
        if scaler.initial_instances < scaler.min_instances
            || scaler.initial_instances > scaler.max_instances
        {
            return Err(SharedError::Config(
                "autoscaler.initial_instances must lie within [min_instances, max_instances]"
                    .to_string(),
            ));
        }
        if scaler.scale_down_cpu >= scaler.scale_up_cpu
            || scaler.scale_down_memory >= scaler.scale_up_memory
            || scaler.scale_down_response_time_ms >= scaler.scale_up_response_time_ms
        {
            return Err(SharedError::Config(
                "autoscaler scale-down thresholds must be below scale-up thresholds".to_string(),
            ));
        }
        if scaler.history_size == 0 {
            return Err(SharedError::Config(
                "autoscaler.history_size must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(SharedError::Config(
                "circuit_breaker.failure_threshold must be positive".to_string(),
            ));
        }
        if self.health_check.timeout_seconds == 0 || self.health_check.interval_seconds == 0 {
            return Err(SharedError::Config(
                "health_check interval and timeout must be positive".to_string(),
            ));
        }
        if self.gateway.upstream_timeout_seconds == 0 {
            return Err(SharedError::Config(
                "gateway.upstream_timeout_seconds must be positive".to_string(),
            ));
        }
        for route in &self.gateway.routes {
            if route.prefix.is_empty() || route.service.is_empty() {
                return Err(SharedError::Config(format!(
                    "route {:?} must have a non-empty prefix and service",
                    route
                )));
            }
        }
        if self.security.threat_block_threshold == 0 {
            return Err(SharedError::Config(
                "security.threat_block_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Check if the environment is development
    pub fn is_development(&self) -> bool {
        self.environment.is_empty() || self.environment == "development"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.health_check.timeout(), Duration::from_secs(5));
        assert_eq!(config.health_check.interval(), Duration::from_secs(30));
        assert_eq!(config.gateway.upstream_timeout(), Duration::from_secs(10));
        assert_eq!(config.autoscaler.history_size, 100);
    }

    #[test]
    fn test_rejects_inverted_instance_bounds() {
        let mut config = MeshConfig::default();
        config.autoscaler.min_instances = 5;
        config.autoscaler.max_instances = 2;
        assert!(matches!(config.validate(), Err(SharedError::Config(_))));
    }

    #[test]
    fn test_rejects_overlapping_scaling_thresholds() {
        let mut config = MeshConfig::default();
        config.autoscaler.scale_down_cpu = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_route() {
        let mut config = MeshConfig::default();
        config.gateway.routes.push(RouteConfig {
            prefix: String::new(),
            service: "orphan".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_falls_back_to_defaults() {
        let json = r#"{ "circuit_breaker": { "failure_threshold": 3 } }"#;
        let config: MeshConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout_seconds, 60);
        assert_eq!(config.cache.l1_ttl_seconds, 300);
        assert_eq!(
            config.load_balancer.strategy,
            LoadBalancingStrategy::RoundRobin
        );
    }
}
