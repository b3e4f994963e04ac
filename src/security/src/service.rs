//! Main Security Service
//!
//! `SecurityManager` composes threat detection, access control, encryption
//! and auditing into a single request-scoped pipeline.

use crate::access_control::{AccessControl, AccessDecision};
use crate::audit::{
    AuditEvent, AuditLevel, AuditLogEntry, ComplianceContext, ComplianceReport, SecurityAudit,
};
use crate::encryption::EncryptionManager;
use crate::errors::{SecurityError, SecurityResult};
use crate::models::{RequestContext, SecurityEvent, ThreatAnalysis};
use crate::threat_detection::ThreatDetector;

use gradmesh_shared::{topics, EventBus, SecurityConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Access target derived from a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTarget {
    pub resource: String,
    pub action: String,
}

impl AccessTarget {
    /// `/api/projects/42` with `PUT` becomes resource `projects`, action `write`
    pub fn from_request(ctx: &RequestContext) -> Self {
        let resource = ctx
            .path
            .trim_start_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .find(|segment| *segment != "api")
            .unwrap_or("")
            .to_string();

        let action = match ctx.method.to_ascii_uppercase().as_str() {
            "GET" | "HEAD" | "OPTIONS" => "read",
            "DELETE" => "delete",
            _ => "write",
        }
        .to_string();

        Self { resource, action }
    }
}

/// Security pipeline facade
pub struct SecurityManager {
    config: SecurityConfig,
    threats: ThreatDetector,
    access: AccessControl,
    encryption: EncryptionManager,
    audit: SecurityAudit,
    events: Option<Arc<EventBus>>,
}

impl SecurityManager {
    /// Create a new manager with the default role bindings
    pub fn new(config: SecurityConfig) -> SecurityResult<Self> {
        let access = AccessControl::with_default_roles(&config);
        Self::with_access_control(config, access)
    }

    /// Create a manager around a caller-provided access control service
    pub fn with_access_control(
        config: SecurityConfig,
        access: AccessControl,
    ) -> SecurityResult<Self> {
        Ok(Self {
            threats: ThreatDetector::new(&config)?,
            encryption: EncryptionManager::new(&config)?,
            audit: SecurityAudit::from_config(&config),
            access,
            config,
            events: None,
        })
    }

    /// Publish blocked threats and access anomalies on the bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn threats(&self) -> &ThreatDetector {
        &self.threats
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn encryption(&self) -> &EncryptionManager {
        &self.encryption
    }

    pub fn audit(&self) -> &SecurityAudit {
        &self.audit
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Run the full pipeline for one request
    ///
    /// Order: block-list, threat analysis, then authorization for requests
    /// that carry an identity. Returns the threat analysis of an admitted
    /// request.
    pub fn evaluate_request(&self, ctx: &RequestContext) -> SecurityResult<ThreatAnalysis> {
        if self.threats.is_blocked(ctx.source_ip) {
            warn!(ip = %ctx.source_ip, path = %ctx.path, "Request from blocked IP");
            self.audit.record(
                AuditLogEntry::new(
                    AuditLevel::Warn,
                    AuditEvent::PolicyViolation {
                        policy: "ip_block_list".to_string(),
                        details: format!("request from blocked IP {}", ctx.source_ip),
                    },
                )
                .with_request_id(ctx.request_id.to_string()),
            );
            return Err(SecurityError::IpBlocked(ctx.source_ip.to_string()));
        }

        let analysis = self.threats.assess(ctx);
        if analysis.score > 0 {
            let event = ThreatDetector::event_for(ctx, &analysis);
            let entry = AuditLogEntry::security(event.clone());
            self.audit
                .record(entry.with_request_id(ctx.request_id.to_string()));
            if analysis.blocked {
                self.publish_threat(ctx, &event, &analysis);
                return Err(SecurityError::ThreatBlocked {
                    score: analysis.score,
                    threat_type: analysis.primary_threat().to_string(),
                });
            }
        }

        if let (Some(user_id), Some(role)) = (&ctx.user_id, &ctx.role) {
            let target = AccessTarget::from_request(ctx);
            let decision = self.check_authorization(
                user_id,
                role,
                &target.resource,
                &target.action,
                &ctx.attributes,
            );
            if !decision.granted {
                return Err(SecurityError::PermissionDenied {
                    user_id: user_id.clone(),
                    resource: target.resource,
                    action: target.action,
                });
            }
        }

        debug!(request_id = %ctx.request_id, score = analysis.score, "Request admitted");
        Ok(analysis)
    }

    /// Evaluate and audit one access check
    pub fn check_authorization(
        &self,
        user_id: &str,
        role: &str,
        resource: &str,
        action: &str,
        attributes: &HashMap<String, Value>,
    ) -> AccessDecision {
        let decision = self.access.check(user_id, role, resource, action, attributes);
        self.audit.record(AuditLogEntry::authorization(
            user_id,
            role,
            resource,
            action,
            decision.granted,
            decision.reason.clone(),
        ));

        if let Some(anomaly) = &decision.anomaly {
            self.audit.record_event(anomaly.clone());
            if let Some(events) = &self.events {
                events.emit(
                    topics::SECURITY_ACCESS_ANOMALY,
                    json!({
                        "user_id": user_id,
                        "denials": self.access.denial_count(user_id),
                        "event_id": anomaly.id,
                    }),
                );
            }
        }
        decision
    }

    /// Record a login outcome; repeated failures feed brute-force scoring
    pub fn record_login_attempt(
        &self,
        source_ip: IpAddr,
        user_id: Option<&str>,
        success: bool,
    ) -> Option<SecurityEvent> {
        self.audit.record(AuditLogEntry::authentication(
            user_id.map(str::to_string),
            source_ip,
            success,
        ));

        if success {
            self.threats.record_successful_login(source_ip);
            return None;
        }

        let mut event = self.threats.record_failed_login(source_ip)?;
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.audit.record_event(event.clone());
        Some(event)
    }

    /// Hash a password, auditing policy violations
    pub fn hash_password(&self, password: &str) -> SecurityResult<String> {
        self.encryption.hash_password(password).map_err(|err| {
            if let SecurityError::PasswordPolicy(details) = &err {
                self.audit.record(AuditLogEntry::new(
                    AuditLevel::Warn,
                    AuditEvent::PolicyViolation {
                        policy: "password_policy".to_string(),
                        details: details.clone(),
                    },
                ));
            }
            err
        })
    }

    /// Run every compliance check against the current state
    pub fn compliance_report(&self) -> ComplianceReport {
        self.audit.run_compliance_checks(ComplianceContext {
            min_password_length: self.encryption.min_password_length(),
            encryption_configured: self.encryption.is_encryption_configured(),
            anomalous_users: self.access.anomalous_users(),
            entries: Vec::new(),
        })
    }

    fn publish_threat(
        &self,
        ctx: &RequestContext,
        event: &SecurityEvent,
        analysis: &ThreatAnalysis,
    ) {
        if let Some(events) = &self.events {
            events.emit(
                topics::SECURITY_THREAT_BLOCKED,
                json!({
                    "event_id": event.id,
                    "request_id": ctx.request_id,
                    "source_ip": ctx.source_ip.to_string(),
                    "path": ctx.path,
                    "score": analysis.score,
                    "severity": analysis.level,
                    "threat_types": analysis.threat_types,
                }),
            );
        }
    }
}
