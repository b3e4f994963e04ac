//! Error handling for the API Gateway
//!
//! Error taxonomy of the routing path and its HTTP status mapping.

use gradmesh_security::SecurityError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use service_discovery::ServiceDiscoveryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Main error type for the API Gateway
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No service found for {target}")]
    ServiceNotFound { target: String },

    #[error("Service unavailable: {service}: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Upstream {service} did not answer within {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    #[error("Upstream {service} failed: {message}")]
    UpstreamError {
        service: String,
        /// Upstream status when one was received
        status: Option<u16>,
        message: String,
    },

    #[error("Request blocked: {threat_type} (score {score})")]
    ThreatBlocked { score: u32, threat_type: String },

    #[error("Source address blocked: {ip}")]
    IpBlocked { ip: String },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

/// Standardized error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ApiError {
    pub fn service_not_found(target: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            target: target.into(),
        }
    }

    pub fn service_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a discovery failure for `service` onto the gateway taxonomy
    pub fn from_discovery(service: &str, err: ServiceDiscoveryError) -> Self {
        match err {
            ServiceDiscoveryError::ServiceNotFound(_) => Self::service_not_found(service),
            ServiceDiscoveryError::NoHealthyInstance(_) => {
                Self::service_unavailable(service, "no healthy instance")
            }
            other => Self::internal(other.to_string()),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            ApiError::ThreatBlocked { .. }
            | ApiError::IpBlocked { .. }
            | ApiError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            ApiError::Configuration(_) | ApiError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error type string for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::ServiceNotFound { .. } => "service_not_found",
            ApiError::ServiceUnavailable { .. } => "service_unavailable",
            ApiError::UpstreamTimeout { .. } => "upstream_timeout",
            ApiError::UpstreamError { .. } => "upstream_error",
            ApiError::ThreatBlocked { .. } => "threat_blocked",
            ApiError::IpBlocked { .. } => "ip_blocked",
            ApiError::PermissionDenied { .. } => "permission_denied",
            ApiError::Configuration(_) => "configuration_error",
            ApiError::Internal { .. } => "internal_error",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error_type().to_string(),
            message: self.to_string(),
            status: self.status_code().as_u16(),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl From<SecurityError> for ApiError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::ThreatBlocked { score, threat_type } => {
                ApiError::ThreatBlocked { score, threat_type }
            }
            SecurityError::IpBlocked(ip) => ApiError::IpBlocked { ip },
            err @ SecurityError::PermissionDenied { .. } => ApiError::PermissionDenied {
                message: err.to_string(),
            },
            SecurityError::Configuration(message) => ApiError::Configuration(message),
            other => ApiError::internal(other.to_string()),
        }
    }
}
