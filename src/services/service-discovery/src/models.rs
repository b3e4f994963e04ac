//! Service Discovery Models
//!
//! Core data structures for the registry, health monitor and load balancer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Service status enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Last probe succeeded within the degraded threshold
    Healthy,
    /// Last probe failed or timed out
    Unhealthy,
    /// Last probe succeeded but slowly
    Degraded,
    /// Registered but not probed yet
    Unknown,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Registration request issued by the host process at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Service name (e.g., "user-service")
    pub name: String,
    /// Network address where the instance is running
    pub host: String,
    /// Port the instance listens on
    pub port: u16,
    /// Service version
    pub version: String,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            version: crate::DEFAULT_SERVICE_VERSION.to_string(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn instance_id(&self) -> String {
        instance_id(&self.name, &self.host, self.port)
    }
}

/// Build the registry key of an instance
pub fn instance_id(name: &str, host: &str, port: u16) -> String {
    format!("{}@{}:{}", name, host, port)
}

/// A registered service instance as seen by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// `{name}@{host}:{port}`
    pub instance_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    /// Wall-clock time of the last probe
    pub last_check_time: Option<DateTime<Utc>>,
    /// Response time of the last probe in milliseconds
    pub last_response_time_ms: Option<u64>,
    /// Monotonic time of the last successful probe
    #[serde(skip)]
    pub last_success_at: Option<Instant>,
}

impl ServiceInfo {
    pub fn from_registration(registration: &ServiceRegistration) -> Self {
        Self {
            instance_id: registration.instance_id(),
            name: registration.name.clone(),
            host: registration.host.clone(),
            port: registration.port,
            version: registration.version.clone(),
            status: ServiceStatus::Unknown,
            registered_at: Utc::now(),
            last_check_time: None,
            last_response_time_ms: None,
            last_success_at: None,
        }
    }

    /// Base URL of the instance
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Healthy and confirmed by a probe no older than `stale_after`
    pub fn is_serviceable(&self, now: Instant, stale_after: Duration) -> bool {
        self.status == ServiceStatus::Healthy
            && self
                .last_success_at
                .map_or(false, |at| now.saturating_duration_since(at) <= stale_after)
    }
}

/// Raw result of a single liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Endpoint answered 200
    Success { response_time: Duration },
    /// Endpoint answered with another status or the transport failed
    Failure {
        reason: String,
        response_time: Option<Duration>,
    },
    /// Probe exceeded its deadline
    Timeout,
}

/// Health check result recorded into the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub instance_id: String,
    pub status: ServiceStatus,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Classify a probe outcome; slow successes are reported as degraded
    pub fn from_outcome(
        instance_id: &str,
        outcome: ProbeOutcome,
        degraded_threshold: Duration,
    ) -> Self {
        let (status, response_time, error_message) = match outcome {
            ProbeOutcome::Success { response_time } if response_time > degraded_threshold => {
                (ServiceStatus::Degraded, Some(response_time), None)
            }
            ProbeOutcome::Success { response_time } => {
                (ServiceStatus::Healthy, Some(response_time), None)
            }
            ProbeOutcome::Failure {
                reason,
                response_time,
            } => (ServiceStatus::Unhealthy, response_time, Some(reason)),
            ProbeOutcome::Timeout => (
                ServiceStatus::Unhealthy,
                None,
                Some("health check timed out".to_string()),
            ),
        };

        Self {
            instance_id: instance_id.to_string(),
            status,
            response_time_ms: response_time.map(|rt| rt.as_millis() as u64),
            error_message,
            checked_at: Utc::now(),
        }
    }
}

/// Counts of registered instances per status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryStatistics {
    pub total_instances: usize,
    pub total_services: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}
