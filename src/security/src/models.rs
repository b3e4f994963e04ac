//! Security pipeline data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Threat level classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Map a threat score onto a severity band
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 80 => ThreatLevel::Critical,
            s if s >= 50 => ThreatLevel::High,
            s if s >= 25 => ThreatLevel::Medium,
            _ => ThreatLevel::Low,
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Recorded security event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `threat_detected`, `brute_force`, `access_anomaly`
    pub event_type: String,
    pub severity: ThreatLevel,
    pub source_ip: Option<IpAddr>,
    pub user_id: Option<String>,
    /// Primary threat family, e.g. `sql_injection`
    pub threat_type: String,
    pub blocked: bool,
}

impl SecurityEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: ThreatLevel,
        threat_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity,
            source_ip: None,
            user_id: None,
            threat_type: threat_type.into(),
            blocked: false,
        }
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }
}

/// Per-request input to the security pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub source_ip: IpAddr,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub payload: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<String>,
    /// Attributes available to permission conditions
    pub attributes: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new(source_ip: IpAddr, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            source_ip,
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            payload: None,
            user_id: None,
            role: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, role: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.role = Some(role.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent").map(String::as_str)
    }
}

/// Outcome of threat analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatAnalysis {
    pub score: u32,
    pub level: ThreatLevel,
    /// Threat families that matched, highest weight first
    pub threat_types: Vec<String>,
    pub blocked: bool,
}

impl ThreatAnalysis {
    pub fn clean() -> Self {
        Self {
            score: 0,
            level: ThreatLevel::Low,
            threat_types: Vec::new(),
            blocked: false,
        }
    }

    pub fn primary_threat(&self) -> &str {
        self.threat_types.first().map(String::as_str).unwrap_or("none")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bands() {
        assert_eq!(ThreatLevel::from_score(0), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(25), ThreatLevel::Medium);
        assert_eq!(ThreatLevel::from_score(50), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(80), ThreatLevel::Critical);
        assert!(ThreatLevel::Critical > ThreatLevel::High);
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let ctx = RequestContext::new("127.0.0.1".parse().unwrap(), "GET", "/")
            .with_header("User-Agent", "sqlmap/1.7");
        assert_eq!(ctx.user_agent(), Some("sqlmap/1.7"));
    }
}
