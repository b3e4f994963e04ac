//! Role-based access control with attribute conditions
//!
//! Roles bind permission ids; each permission names a resource and action
//! (either may be `*`) plus conditions evaluated against per-request
//! attributes. Every check is logged and per-user denials are counted.

use crate::errors::{SecurityError, SecurityResult};
use crate::failure_window::FailureCounter;
use crate::models::{SecurityEvent, ThreatLevel};

use dashmap::DashMap;
use gradmesh_shared::SecurityConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Placeholder replaced with the requesting user's id
pub const USER_ID_PLACEHOLDER: &str = "$user_id";

/// Condition comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Eq,
    Ne,
    In,
    Contains,
}

/// Attribute condition attached to a permission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionCondition {
    pub attribute: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl PermissionCondition {
    pub fn new(attribute: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            value,
        }
    }

    fn evaluate(&self, user_id: &str, attributes: &HashMap<String, Value>) -> bool {
        let actual = match attributes.get(&self.attribute) {
            Some(value) => value,
            None => return false,
        };
        let expected = substitute(&self.value, user_id);

        match self.operator {
            ConditionOperator::Eq => *actual == expected,
            ConditionOperator::Ne => *actual != expected,
            ConditionOperator::In => match &expected {
                Value::Array(values) => values.contains(actual),
                _ => false,
            },
            ConditionOperator::Contains => match (actual, &expected) {
                (Value::Array(values), needle) => values.contains(needle),
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

fn substitute(value: &Value, user_id: &str) -> Value {
    match value {
        Value::String(s) if s == USER_ID_PLACEHOLDER => Value::String(user_id.to_string()),
        Value::Array(values) => Value::Array(values.iter().map(|v| substitute(v, user_id)).collect()),
        other => other.clone(),
    }
}

/// Permission definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub conditions: Vec<PermissionCondition>,
}

impl Permission {
    pub fn new(id: impl Into<String>, resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            action: action.into(),
            conditions: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: PermissionCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    fn grants(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        attributes: &HashMap<String, Value>,
    ) -> bool {
        matches_pattern(&self.resource, resource)
            && matches_pattern(&self.action, action)
            && self
                .conditions
                .iter()
                .all(|condition| condition.evaluate(user_id, attributes))
    }
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some("") => true,
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Result of one access check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub granted: bool,
    pub matched_permission: Option<String>,
    pub reason: String,
    /// Raised when this denial took the user across the alert threshold
    pub anomaly: Option<SecurityEvent>,
}

/// Access control counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlStats {
    pub total_checks: u64,
    pub granted: u64,
    pub denied: u64,
    pub anomalies: u64,
}

/// Access control service
pub struct AccessControl {
    permissions: DashMap<String, Permission>,
    role_bindings: DashMap<String, Vec<String>>,
    denials: FailureCounter<String>,
    denial_alert_threshold: u32,
    checks: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    anomalies: AtomicU64,
}

impl AccessControl {
    /// Create an empty access control service
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            permissions: DashMap::new(),
            role_bindings: DashMap::new(),
            denials: FailureCounter::new(config.block_duration()),
            denial_alert_threshold: config.denial_alert_threshold,
            checks: AtomicU64::new(0),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
        }
    }

    /// Create a service seeded with the `admin`, `advisor` and `student` roles
    pub fn with_default_roles(config: &SecurityConfig) -> Self {
        let access = Self::new(config);
        let owner = || PermissionCondition::new("owner_id", ConditionOperator::Eq, Value::from(USER_ID_PLACEHOLDER));

        let defaults = [
            ("admin", Permission::new("admin.all", "*", "*")),
            ("advisor", Permission::new("students.read", "students", "read")),
            ("advisor", Permission::new("projects.manage", "projects", "*")),
            ("advisor", Permission::new("milestones.review", "milestones", "*")),
            ("student", Permission::new("students.read_self", "students", "read").with_condition(
                PermissionCondition::new("student_id", ConditionOperator::Eq, Value::from(USER_ID_PLACEHOLDER)),
            )),
            ("student", Permission::new("projects.read_own", "projects", "read").with_condition(owner())),
            ("student", Permission::new("milestones.submit_own", "milestones", "write").with_condition(owner())),
            ("student", Permission::new("advisors.read", "advisors", "read")),
        ];

        for (role, permission) in defaults {
            let id = permission.id.clone();
            access.define_permission(permission);
            access
                .role_bindings
                .entry(role.to_string())
                .or_default()
                .push(id);
        }
        access
    }

    /// Define or replace a permission
    pub fn define_permission(&self, permission: Permission) {
        self.permissions.insert(permission.id.clone(), permission);
    }

    /// Bind a permission to a role, creating the role if needed
    pub fn bind(&self, role: &str, permission_id: &str) -> SecurityResult<()> {
        if !self.permissions.contains_key(permission_id) {
            return Err(SecurityError::PermissionNotFound(permission_id.to_string()));
        }
        let mut bindings = self.role_bindings.entry(role.to_string()).or_default();
        if !bindings.iter().any(|id| id == permission_id) {
            bindings.push(permission_id.to_string());
        }
        Ok(())
    }

    pub fn unbind(&self, role: &str, permission_id: &str) -> bool {
        match self.role_bindings.get_mut(role) {
            Some(mut bindings) => {
                let before = bindings.len();
                bindings.retain(|id| id != permission_id);
                bindings.len() != before
            }
            None => false,
        }
    }

    /// Permissions bound to a role
    pub fn permissions_for(&self, role: &str) -> SecurityResult<Vec<Permission>> {
        let bindings = self
            .role_bindings
            .get(role)
            .ok_or_else(|| SecurityError::RoleNotFound(role.to_string()))?;
        Ok(bindings
            .iter()
            .filter_map(|id| self.permissions.get(id).map(|p| p.clone()))
            .collect())
    }

    /// Evaluate whether `user_id` acting as `role` may perform `action` on `resource`
    pub fn check(
        &self,
        user_id: &str,
        role: &str,
        resource: &str,
        action: &str,
        attributes: &HashMap<String, Value>,
    ) -> AccessDecision {
        self.checks.fetch_add(1, Ordering::Relaxed);

        let matched = self.role_bindings.get(role).and_then(|bindings| {
            bindings.iter().find_map(|id| {
                self.permissions
                    .get(id)
                    .filter(|p| p.grants(user_id, resource, action, attributes))
                    .map(|p| p.id.clone())
            })
        });

        if let Some(permission_id) = matched {
            self.granted.fetch_add(1, Ordering::Relaxed);
            info!(
                user_id,
                role,
                resource,
                action,
                permission = %permission_id,
                granted = true,
                "Access check"
            );
            return AccessDecision {
                granted: true,
                reason: format!("granted by {}", permission_id),
                matched_permission: Some(permission_id),
                anomaly: None,
            };
        }

        self.denied.fetch_add(1, Ordering::Relaxed);
        let denials = self.denials.increment(user_id.to_string());

        let reason = if self.role_bindings.contains_key(role) {
            format!("no permission of role {} allows {} on {}", role, action, resource)
        } else {
            format!("unknown role {}", role)
        };
        warn!(user_id, role, resource, action, denials, granted = false, "Access check");

        let anomaly = (denials == self.denial_alert_threshold).then(|| {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            warn!(user_id, denials, "Access denial threshold crossed");
            SecurityEvent::new("access_anomaly", ThreatLevel::High, "excessive_access_denials")
                .with_user(user_id)
        });

        AccessDecision {
            granted: false,
            matched_permission: None,
            reason,
            anomaly,
        }
    }

    pub fn denial_count(&self, user_id: &str) -> u32 {
        self.denials.count(user_id)
    }

    pub fn reset_denials(&self, user_id: &str) {
        self.denials.reset(user_id);
    }

    /// Drop denial windows older than the tracking window
    pub fn purge_expired(&self) -> usize {
        self.denials.purge_expired()
    }

    /// Users with a denial window still tracked
    pub fn tracked_users(&self) -> usize {
        self.denials.len()
    }

    /// Users whose denial count reached the alert threshold
    pub fn anomalous_users(&self) -> Vec<(String, u32)> {
        let mut users: Vec<(String, u32)> = self
            .denials
            .live()
            .into_iter()
            .filter(|(_, count)| *count >= self.denial_alert_threshold)
            .collect();
        users.sort();
        users
    }

    pub fn denial_alert_threshold(&self) -> u32 {
        self.denial_alert_threshold
    }

    pub fn stats(&self) -> AccessControlStats {
        AccessControlStats {
            total_checks: self.checks.load(Ordering::Relaxed),
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn access() -> AccessControl {
        AccessControl::with_default_roles(&SecurityConfig {
            denial_alert_threshold: 3,
            ..SecurityConfig::default()
        })
    }

    fn attrs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_admin_wildcard() {
        let access = access();
        let decision = access.check("root", "admin", "committees", "delete", &HashMap::new());
        assert!(decision.granted);
        assert_eq!(decision.matched_permission.as_deref(), Some("admin.all"));
    }

    #[test]
    fn test_student_owner_condition() {
        let access = access();
        let own = attrs(&[("owner_id", json!("s-1"))]);
        let other = attrs(&[("owner_id", json!("s-2"))]);

        assert!(access.check("s-1", "student", "projects", "read", &own).granted);
        assert!(!access.check("s-1", "student", "projects", "read", &other).granted);
        assert!(!access.check("s-1", "student", "projects", "read", &HashMap::new()).granted);
        assert!(!access.check("s-1", "student", "projects", "delete", &own).granted);
    }

    #[test]
    fn test_condition_operators() {
        let check = |operator, value, attr: Value| {
            PermissionCondition::new("x", operator, value).evaluate("u-1", &attrs(&[("x", attr)]))
        };

        assert!(check(ConditionOperator::Ne, json!("a"), json!("b")));
        assert!(check(ConditionOperator::In, json!(["a", "$user_id"]), json!("u-1")));
        assert!(!check(ConditionOperator::In, json!("a"), json!("a")));
        assert!(check(ConditionOperator::Contains, json!("cs"), json!(["math", "cs"])));
        assert!(check(ConditionOperator::Contains, json!("ml"), json!("html")));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(matches_pattern("reports/*", "reports/2024"));
        assert!(!matches_pattern("reports/*", "projects/1"));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("read", "read"));
    }

    #[test]
    fn test_denials_raise_single_anomaly() {
        let access = access();
        let decisions: Vec<_> = (0..5)
            .map(|_| access.check("s-9", "student", "committees", "write", &HashMap::new()))
            .collect();

        let anomalies: Vec<_> = decisions.iter().filter_map(|d| d.anomaly.as_ref()).collect();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].event_type, "access_anomaly");
        assert!(decisions[2].anomaly.is_some());
        assert_eq!(access.denial_count("s-9"), 5);
        assert_eq!(access.anomalous_users(), vec![("s-9".to_string(), 5)]);
        assert_eq!(access.stats().denied, 5);
    }

    #[test]
    fn test_bindings() {
        let access = access();
        assert!(matches!(
            access.bind("student", "missing"),
            Err(SecurityError::PermissionNotFound(_))
        ));
        assert!(matches!(access.permissions_for("guest"), Err(SecurityError::RoleNotFound(_))));

        access.define_permission(Permission::new("reports.read", "reports/*", "read"));
        access.bind("guest", "reports.read").unwrap();
        assert!(access.check("g", "guest", "reports/q1", "read", &HashMap::new()).granted);

        assert!(access.unbind("guest", "reports.read"));
        let decision = access.check("g", "guest", "reports/q1", "read", &HashMap::new());
        assert!(!decision.granted);
        assert!(decision.reason.contains("role guest"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_window_expires() {
        let access = access();
        for user in ["u-1", "u-2", "u-3"] {
            access.check(user, "student", "committees", "write", &HashMap::new());
        }
        assert_eq!(access.tracked_users(), 3);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(access.denial_count("u-1"), 0);
        assert!(access.anomalous_users().is_empty());
        assert_eq!(access.purge_expired(), 2);
        assert_eq!(access.tracked_users(), 0);
    }
}
