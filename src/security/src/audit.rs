//! Audit Module
//!
//! Bounded security audit log plus named compliance checks run over it.

use crate::models::{SecurityEvent, ThreatLevel};

use chrono::{DateTime, Utc};
use gradmesh_shared::SecurityConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditLevel {
    /// Informational events
    Info,
    /// Warning events
    Warn,
    /// Error events
    Error,
    /// Critical security events
    Critical,
}

impl From<ThreatLevel> for AuditLevel {
    fn from(level: ThreatLevel) -> Self {
        match level {
            ThreatLevel::Low => AuditLevel::Info,
            ThreatLevel::Medium => AuditLevel::Warn,
            ThreatLevel::High => AuditLevel::Error,
            ThreatLevel::Critical => AuditLevel::Critical,
        }
    }
}

/// Audited occurrences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEvent {
    /// Output of threat detection or anomaly detection
    Security(SecurityEvent),
    /// One access check, granted or denied
    Authorization {
        user_id: String,
        role: String,
        resource: String,
        action: String,
        granted: bool,
        reason: String,
    },
    /// Login attempt outcome
    Authentication {
        user_id: Option<String>,
        source_ip: IpAddr,
        success: bool,
    },
    /// Security policy violations
    PolicyViolation { policy: String, details: String },
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique event ID
    pub id: String,
    /// Timestamp when event occurred
    pub timestamp: DateTime<Utc>,
    /// Event severity level
    pub level: AuditLevel,
    /// Event details
    pub event: AuditEvent,
    /// Request ID for correlation
    pub request_id: Option<String>,
    /// Additional context information
    pub context: HashMap<String, String>,
}

impl AuditLogEntry {
    /// Create a new audit log entry
    pub fn new(level: AuditLevel, event: AuditEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            event,
            request_id: None,
            context: HashMap::new(),
        }
    }

    /// Add request ID for correlation
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Add context information
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn security(event: SecurityEvent) -> Self {
        Self::new(event.severity.into(), AuditEvent::Security(event))
    }

    pub fn authorization(
        user_id: &str,
        role: &str,
        resource: &str,
        action: &str,
        granted: bool,
        reason: impl Into<String>,
    ) -> Self {
        let level = if granted { AuditLevel::Info } else { AuditLevel::Warn };
        Self::new(
            level,
            AuditEvent::Authorization {
                user_id: user_id.to_string(),
                role: role.to_string(),
                resource: resource.to_string(),
                action: action.to_string(),
                granted,
                reason: reason.into(),
            },
        )
    }

    pub fn authentication(user_id: Option<String>, source_ip: IpAddr, success: bool) -> Self {
        let level = if success { AuditLevel::Info } else { AuditLevel::Warn };
        Self::new(
            level,
            AuditEvent::Authentication {
                user_id,
                source_ip,
                success,
            },
        )
    }

    pub fn as_security_event(&self) -> Option<&SecurityEvent> {
        match &self.event {
            AuditEvent::Security(event) => Some(event),
            _ => None,
        }
    }
}

/// Inputs a compliance check may inspect
#[derive(Debug, Clone, Default)]
pub struct ComplianceContext {
    pub min_password_length: usize,
    pub encryption_configured: bool,
    /// Users at or above the denial alert threshold with their counts
    pub anomalous_users: Vec<(String, u32)>,
    pub entries: Vec<AuditLogEntry>,
}

/// Outcome of one compliance check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub check: String,
    pub passed: bool,
    pub issues: Vec<String>,
}

impl ComplianceResult {
    pub fn from_issues(check: &str, issues: Vec<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: issues.is_empty(),
            issues,
        }
    }
}

/// Aggregate of all compliance checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub passed: bool,
    pub results: Vec<ComplianceResult>,
}

impl ComplianceReport {
    pub fn result(&self, check: &str) -> Option<&ComplianceResult> {
        self.results.iter().find(|r| r.check == check)
    }
}

/// Named compliance check
pub trait ComplianceCheck: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, context: &ComplianceContext) -> ComplianceResult;
}

/// Minimum password length must be at least the required floor
pub struct PasswordPolicyCheck {
    pub required_length: usize,
}

impl PasswordPolicyCheck {
    pub fn new(required_length: usize) -> Self {
        Self { required_length }
    }
}

impl ComplianceCheck for PasswordPolicyCheck {
    fn name(&self) -> &str {
        "password_policy"
    }

    fn run(&self, context: &ComplianceContext) -> ComplianceResult {
        let mut issues = Vec::new();
        if context.min_password_length < self.required_length {
            issues.push(format!(
                "minimum password length {} is below {}",
                context.min_password_length, self.required_length
            ));
        }
        ComplianceResult::from_issues(self.name(), issues)
    }
}

/// Reversible encryption needs a configured key
pub struct EncryptionConfiguredCheck;

impl ComplianceCheck for EncryptionConfiguredCheck {
    fn name(&self) -> &str {
        "encryption_configured"
    }

    fn run(&self, context: &ComplianceContext) -> ComplianceResult {
        let mut issues = Vec::new();
        if !context.encryption_configured {
            issues.push("no data encryption key configured".to_string());
        }
        ComplianceResult::from_issues(self.name(), issues)
    }
}

/// Every critical threat must have been blocked
pub struct CriticalThreatsBlockedCheck;

impl ComplianceCheck for CriticalThreatsBlockedCheck {
    fn name(&self) -> &str {
        "critical_threats_blocked"
    }

    fn run(&self, context: &ComplianceContext) -> ComplianceResult {
        let issues = context
            .entries
            .iter()
            .filter_map(AuditLogEntry::as_security_event)
            .filter(|event| event.severity == ThreatLevel::Critical && !event.blocked)
            .map(|event| format!("critical {} event {} was not blocked", event.threat_type, event.id))
            .collect();
        ComplianceResult::from_issues(self.name(), issues)
    }
}

/// No user may sit above the denial alert threshold
pub struct AccessDenialAnomaliesCheck;

impl ComplianceCheck for AccessDenialAnomaliesCheck {
    fn name(&self) -> &str {
        "access_denial_anomalies"
    }

    fn run(&self, context: &ComplianceContext) -> ComplianceResult {
        let issues = context
            .anomalous_users
            .iter()
            .map(|(user, count)| format!("user {} has {} access denials", user, count))
            .collect();
        ComplianceResult::from_issues(self.name(), issues)
    }
}

/// Security audit service
pub struct SecurityAudit {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    max_entries: usize,
    checks: RwLock<Vec<Box<dyn ComplianceCheck>>>,
}

impl SecurityAudit {
    /// Create an audit log with the built-in compliance checks registered
    ///
    /// `required_password_length` is the floor the password policy check
    /// holds the enforced minimum length to.
    pub fn new(max_entries: usize, required_password_length: usize) -> Self {
        let checks: Vec<Box<dyn ComplianceCheck>> = vec![
            Box::new(PasswordPolicyCheck::new(required_password_length)),
            Box::new(EncryptionConfiguredCheck),
            Box::new(CriticalThreatsBlockedCheck),
            Box::new(AccessDenialAnomaliesCheck),
        ];
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries: max_entries.max(1),
            checks: RwLock::new(checks),
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.audit_max_entries, config.min_password_length)
    }

    /// Append an entry, dropping the oldest past capacity
    pub fn record(&self, entry: AuditLogEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub fn record_event(&self, event: SecurityEvent) {
        self.record(AuditLogEntry::security(event));
    }

    pub fn register_check(&self, check: Box<dyn ComplianceCheck>) {
        self.checks.write().push(check);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Most recent entries, newest last
    pub fn recent(&self, limit: usize) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Recorded security events at or above a severity
    pub fn security_events(&self, min_severity: ThreatLevel) -> Vec<SecurityEvent> {
        self.entries
            .lock()
            .iter()
            .filter_map(AuditLogEntry::as_security_event)
            .filter(|event| event.severity >= min_severity)
            .cloned()
            .collect()
    }

    /// Run every registered check against the supplied context
    pub fn run_compliance_checks(&self, mut context: ComplianceContext) -> ComplianceReport {
        context.entries = self.entries();
        let results: Vec<ComplianceResult> = self
            .checks
            .read()
            .iter()
            .map(|check| check.run(&context))
            .collect();

        let passed = results.iter().all(|r| r.passed);
        for failed in results.iter().filter(|r| !r.passed) {
            warn!(check = %failed.check, issues = ?failed.issues, "Compliance check failed");
        }
        info!(checks = results.len(), passed, "Compliance checks completed");

        ComplianceReport {
            generated_at: Utc::now(),
            passed,
            results,
        }
    }
}
