//! Security Error Types and Handling
//!
//! Error types for threat analysis, authorization, encryption and audit
//! operations, with severity classification for alerting.

use thiserror::Error;

/// Main security error type
#[derive(Error, Debug)]
pub enum SecurityError {
    // Threat detection errors
    #[error("Request blocked: {threat_type} (score {score})")]
    ThreatBlocked { score: u32, threat_type: String },

    #[error("IP address blocked: {0}")]
    IpBlocked(String),

    #[error("Threat analysis failed: {0}")]
    ThreatAnalysis(String),

    // Authorization errors
    #[error("Permission denied: {user_id} may not {action} {resource}")]
    PermissionDenied {
        user_id: String,
        resource: String,
        action: String,
    },

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Permission not found: {0}")]
    PermissionNotFound(String),

    // Encryption errors
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Encryption key not configured")]
    KeyNotConfigured,

    // Password errors
    #[error("Password hashing failed: {0}")]
    PasswordHashing(String),

    #[error("Password policy violation: {0}")]
    PasswordPolicy(String),

    #[error("Invalid token signature")]
    InvalidTokenSignature,

    // Input validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("Security configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for security operations
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Security error classification for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl SecurityError {
    /// Get the severity level of the security error
    pub fn severity(&self) -> SecurityErrorSeverity {
        match self {
            SecurityError::ThreatBlocked { .. } | SecurityError::Decryption(_) => {
                SecurityErrorSeverity::Critical
            }

            SecurityError::IpBlocked(_)
            | SecurityError::PermissionDenied { .. }
            | SecurityError::InvalidTokenSignature => SecurityErrorSeverity::High,

            SecurityError::PasswordPolicy(_)
            | SecurityError::InvalidInput(_)
            | SecurityError::RoleNotFound(_)
            | SecurityError::PermissionNotFound(_) => SecurityErrorSeverity::Medium,

            _ => SecurityErrorSeverity::Low,
        }
    }

    /// Check if the error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self.severity(),
            SecurityErrorSeverity::High | SecurityErrorSeverity::Critical
        )
    }

    /// Get error code for external systems
    pub fn error_code(&self) -> &'static str {
        match self {
            SecurityError::ThreatBlocked { .. } => "SEC001",
            SecurityError::IpBlocked(_) => "SEC002",
            SecurityError::ThreatAnalysis(_) => "SEC003",
            SecurityError::PermissionDenied { .. } => "SEC010",
            SecurityError::RoleNotFound(_) => "SEC011",
            SecurityError::PermissionNotFound(_) => "SEC012",
            SecurityError::Encryption(_) => "SEC020",
            SecurityError::Decryption(_) => "SEC021",
            SecurityError::InvalidKeyFormat(_) => "SEC022",
            SecurityError::KeyNotConfigured => "SEC023",
            SecurityError::PasswordHashing(_) => "SEC030",
            SecurityError::PasswordPolicy(_) => "SEC031",
            SecurityError::InvalidTokenSignature => "SEC032",
            SecurityError::InvalidInput(_) => "SEC040",
            SecurityError::Configuration(_) => "SEC050",
            SecurityError::Serialization(_) => "SEC051",
        }
    }
}

impl From<serde_json::Error> for SecurityError {
    fn from(err: serde_json::Error) -> Self {
        SecurityError::Serialization(err.to_string())
    }
}

impl From<argon2::password_hash::Error> for SecurityError {
    fn from(err: argon2::password_hash::Error) -> Self {
        SecurityError::PasswordHashing(err.to_string())
    }
}

impl From<base64::DecodeError> for SecurityError {
    fn from(err: base64::DecodeError) -> Self {
        SecurityError::InvalidKeyFormat(err.to_string())
    }
}

impl From<regex::Error> for SecurityError {
    fn from(err: regex::Error) -> Self {
        SecurityError::Configuration(format!("Invalid pattern: {}", err))
    }
}
