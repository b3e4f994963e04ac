//! # GradMesh Security Pipeline
//!
//! Request-scoped security for the service mesh.
//!
//! ## Features
//!
//! - **Threat Detection**: weighted signature scoring, brute-force tracking and an IP block-list
//! - **Access Control**: role bindings with attribute conditions and denial anomaly detection
//! - **Encryption**: Argon2id credentials, token signing and AES-256-GCM data encryption
//! - **Audit**: bounded security log with pluggable compliance checks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gradmesh_security::{RequestContext, SecurityConfig, SecurityManager};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let security = SecurityManager::new(SecurityConfig::default())?;
//!
//! let ctx = RequestContext::new("10.0.0.7".parse()?, "GET", "/api/projects/7")
//!     .with_user("s-1", "student")
//!     .with_attribute("owner_id", serde_json::json!("s-1"));
//! let analysis = security.evaluate_request(&ctx)?;
//! assert_eq!(analysis.score, 0);
//! # Ok(())
//! # }
//! ```

pub mod access_control;
pub mod audit;
pub mod encryption;
pub mod errors;
pub mod failure_window;
pub mod models;
pub mod service;
pub mod threat_detection;

pub use gradmesh_shared::SecurityConfig;

pub use access_control::{
    AccessControl, AccessControlStats, AccessDecision, ConditionOperator, Permission,
    PermissionCondition,
};
pub use audit::{
    AuditEvent, AuditLevel, AuditLogEntry, ComplianceCheck, ComplianceContext, ComplianceReport,
    ComplianceResult, SecurityAudit,
};
pub use encryption::{EncryptedData, EncryptionManager};
pub use errors::{SecurityError, SecurityErrorSeverity, SecurityResult};
pub use models::{RequestContext, SecurityEvent, ThreatAnalysis, ThreatLevel};
pub use service::{AccessTarget, SecurityManager};
pub use threat_detection::{ThreatDetector, ThreatStats};
