//! Threat Detection Module
//!
//! Weighted signature matching over the request path, headers and payload,
//! brute-force scoring from per-IP failed-login counters, and a shared IP
//! block-list with expiry.

use crate::errors::SecurityResult;
use crate::failure_window::FailureCounter;
use crate::models::{RequestContext, SecurityEvent, ThreatAnalysis, ThreatLevel};

use dashmap::DashMap;
use gradmesh_shared::SecurityConfig;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum threat score
pub const MAX_SCORE: u32 = 100;

const BRUTE_FORCE_WEIGHT: u32 = 40;
const SUSPICIOUS_AGENT_WEIGHT: u32 = 15;

/// Block-list size multiple at which expired entries are swept
const BLOCK_LIST_SWEEP: usize = 64;

const SUSPICIOUS_AGENTS: &[&str] = &[
    "sqlmap", "nikto", "nmap", "masscan", "havij", "acunetix", "dirbuster", "wpscan",
];

/// One family of attack signatures
struct SignatureFamily {
    threat_type: &'static str,
    weight: u32,
    patterns: RegexSet,
}

fn signature_families() -> SecurityResult<Vec<SignatureFamily>> {
    let family = |threat_type, weight, patterns: &[&str]| -> SecurityResult<SignatureFamily> {
        Ok(SignatureFamily {
            threat_type,
            weight,
            patterns: RegexSet::new(patterns)?,
        })
    };

    Ok(vec![
        family(
            "sql_injection",
            60,
            &[
                r"(?i)'\s*(or|and)\s+'?\d+'?\s*=\s*'?\d+",
                r"(?i)'\s*(or|and)\s+'[^']*'\s*=\s*'",
                r"(?i)\bunion\b[\s\S]*\bselect\b",
                r"(?i);\s*(drop|delete|truncate|alter|insert|update)\s",
                r"(?i)'\s*;?\s*--",
                r"(?i)\b(sleep|benchmark|waitfor\s+delay)\s*\(",
            ],
        )?,
        family(
            "xss",
            50,
            &[
                r"(?i)<\s*script",
                r"(?i)javascript\s*:",
                r"(?i)\bon(load|error|click|mouseover|focus)\s*=",
                r"(?i)<\s*(iframe|object|embed)\b",
            ],
        )?,
        family(
            "command_injection",
            50,
            &[
                r"(?i)[;&|]\s*(cat|ls|rm|wget|curl|nc|bash|sh|powershell)\b",
                r"(?i)\$\(\s*(cat|ls|rm|wget|curl|nc|bash|sh|id|whoami|uname)\b",
                r"(?i)`\s*(cat|ls|rm|wget|curl|nc|bash|sh|id|whoami|uname)\b",
            ],
        )?,
        family(
            "path_traversal",
            40,
            &[r"\.\./", r"\.\.\\", r"(?i)%2e%2e(%2f|/|%5c)", r"(?i)/etc/(passwd|shadow)"],
        )?,
    ])
}

/// Threat statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatStats {
    pub requests_analyzed: u64,
    pub threats_detected: u64,
    pub requests_blocked: u64,
    pub blocked_ips: usize,
}

/// Threat detector service
pub struct ThreatDetector {
    block_threshold: u32,
    block_duration: Duration,
    max_failed_logins: u32,
    families: Vec<SignatureFamily>,
    failed_logins: FailureCounter<IpAddr>,
    blocked_ips: DashMap<IpAddr, Instant>,
    analyzed: AtomicU64,
    detected: AtomicU64,
    blocked: AtomicU64,
}

impl ThreatDetector {
    /// Create new threat detector
    pub fn new(config: &SecurityConfig) -> SecurityResult<Self> {
        Ok(Self {
            block_threshold: config.threat_block_threshold,
            block_duration: config.block_duration(),
            max_failed_logins: config.max_failed_logins,
            families: signature_families()?,
            failed_logins: FailureCounter::new(config.block_duration()),
            blocked_ips: DashMap::new(),
            analyzed: AtomicU64::new(0),
            detected: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        })
    }

    /// Score a request; blocks the source IP on a critical result
    pub fn assess(&self, ctx: &RequestContext) -> ThreatAnalysis {
        self.analyzed.fetch_add(1, Ordering::Relaxed);

        let mut matches: Vec<(&'static str, u32)> = Vec::new();
        let mut surfaces: Vec<&str> = vec![ctx.path.as_str()];
        surfaces.extend(ctx.headers.values().map(String::as_str));
        if let Some(payload) = &ctx.payload {
            surfaces.push(payload);
        }

        for family in &self.families {
            if surfaces.iter().any(|s| family.patterns.is_match(s)) {
                matches.push((family.threat_type, family.weight));
            }
        }

        if self.failed_login_count(ctx.source_ip) >= self.max_failed_logins {
            matches.push(("brute_force", BRUTE_FORCE_WEIGHT));
        }

        if let Some(agent) = ctx.user_agent() {
            if Self::is_suspicious_user_agent(agent) {
                matches.push(("suspicious_user_agent", SUSPICIOUS_AGENT_WEIGHT));
            }
        }

        if matches.is_empty() {
            return ThreatAnalysis::clean();
        }

        matches.sort_by(|a, b| b.1.cmp(&a.1));
        let score = matches.iter().map(|(_, w)| w).sum::<u32>().min(MAX_SCORE);
        let level = ThreatLevel::from_score(score);
        let blocked = score >= self.block_threshold;

        self.detected.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        if level == ThreatLevel::Critical {
            self.block_ip(ctx.source_ip, self.block_duration);
        }

        let analysis = ThreatAnalysis {
            score,
            level,
            threat_types: matches.into_iter().map(|(t, _)| t.to_string()).collect(),
            blocked,
        };

        if blocked {
            warn!(
                ip = %ctx.source_ip,
                path = %ctx.path,
                score,
                threats = ?analysis.threat_types,
                "Blocking malicious request"
            );
        } else {
            debug!(ip = %ctx.source_ip, score, "Suspicious request below block threshold");
        }
        analysis
    }

    /// Analyze a request, producing an event when anything matched
    pub fn analyze(&self, ctx: &RequestContext) -> Option<SecurityEvent> {
        let analysis = self.assess(ctx);
        if analysis.score == 0 {
            return None;
        }
        Some(Self::event_for(ctx, &analysis))
    }

    /// Build the event describing an analysis
    pub fn event_for(ctx: &RequestContext, analysis: &ThreatAnalysis) -> SecurityEvent {
        let mut event = SecurityEvent::new(
            "threat_detected",
            analysis.level,
            analysis.primary_threat(),
        )
        .with_source_ip(ctx.source_ip)
        .blocked(analysis.blocked);
        if let Some(user_id) = &ctx.user_id {
            event = event.with_user(user_id.clone());
        }
        event
    }

    /// Count a failed login; returns a brute-force event once the limit is reached
    pub fn record_failed_login(&self, ip: IpAddr) -> Option<SecurityEvent> {
        let count = self.failed_logins.increment(ip);

        if count == self.max_failed_logins {
            warn!(ip = %ip, attempts = count, "Brute-force threshold reached");
            return Some(
                SecurityEvent::new("brute_force", ThreatLevel::High, "brute_force")
                    .with_source_ip(ip),
            );
        }
        None
    }

    /// Reset the failed-login counter of an IP
    pub fn record_successful_login(&self, ip: IpAddr) {
        self.failed_logins.reset(&ip);
    }

    pub fn failed_login_count(&self, ip: IpAddr) -> u32 {
        self.failed_logins.count(&ip)
    }

    /// Drop expired block-list entries and failed-login windows
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.blocked_ips.len();
        self.blocked_ips.retain(|_, until| now < *until);
        let removed =
            before.saturating_sub(self.blocked_ips.len()) + self.failed_logins.purge_expired();
        if removed > 0 {
            debug!(removed, "Purged expired threat tracking entries");
        }
        removed
    }

    /// Source IPs with a failed-login window still tracked
    pub fn tracked_login_sources(&self) -> usize {
        self.failed_logins.len()
    }

    pub fn block_ip(&self, ip: IpAddr, duration: Duration) {
        let now = Instant::now();
        self.blocked_ips.insert(ip, now + duration);
        if self.blocked_ips.len() % BLOCK_LIST_SWEEP == 0 {
            self.blocked_ips.retain(|_, until| now < *until);
        }
        info!(ip = %ip, duration_secs = duration.as_secs(), "IP added to block-list");
    }

    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.blocked_ips.remove(&ip).is_some()
    }

    /// Check the block-list, dropping an expired entry
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        match self.blocked_ips.get(&ip).map(|until| *until) {
            Some(until) if now < until => true,
            Some(_) => {
                self.blocked_ips.remove_if(&ip, |_, until| now >= *until);
                false
            }
            None => false,
        }
    }

    pub fn stats(&self) -> ThreatStats {
        let now = Instant::now();
        ThreatStats {
            requests_analyzed: self.analyzed.load(Ordering::Relaxed),
            threats_detected: self.detected.load(Ordering::Relaxed),
            requests_blocked: self.blocked.load(Ordering::Relaxed),
            blocked_ips: self
                .blocked_ips
                .iter()
                .filter(|entry| now < *entry.value())
                .count(),
        }
    }

    /// Check if user agent belongs to a known attack tool
    fn is_suspicious_user_agent(user_agent: &str) -> bool {
        let ua_lower = user_agent.to_lowercase();
        SUSPICIOUS_AGENTS.iter().any(|agent| ua_lower.contains(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ThreatDetector {
        ThreatDetector::new(&SecurityConfig::default()).unwrap()
    }

    fn ip() -> IpAddr {
        "203.0.113.9".parse().unwrap()
    }

    fn request(payload: &str) -> RequestContext {
        RequestContext::new(ip(), "POST", "/api/users/login").with_payload(payload)
    }

    #[test]
    fn test_sql_injection_is_blocked() {
        let detector = detector();
        let analysis = detector.assess(&request("username=admin' OR 1=1 --"));

        assert!(analysis.score > 0);
        assert!(analysis.blocked);
        assert_eq!(analysis.primary_threat(), "sql_injection");
        assert_eq!(analysis.level, ThreatLevel::High);
    }

    #[test]
    fn test_clean_request_scores_zero() {
        let detector = detector();
        let ctx = request(r#"{"username": "alice", "password": "correct horse"}"#)
            .with_header("User-Agent", "Mozilla/5.0");

        assert_eq!(detector.assess(&ctx), ThreatAnalysis::clean());
        assert!(detector.analyze(&ctx).is_none());
    }

    #[test]
    fn test_xss_in_header_and_path_traversal() {
        let detector = detector();
        let xss = RequestContext::new(ip(), "GET", "/api/projects")
            .with_header("Referer", "<script>alert(1)</script>");
        assert!(detector.assess(&xss).threat_types.contains(&"xss".to_string()));

        let traversal = RequestContext::new(ip(), "GET", "/api/files/../../etc/passwd");
        let analysis = detector.assess(&traversal);
        assert_eq!(analysis.primary_threat(), "path_traversal");
        assert!(!analysis.blocked);
        assert_eq!(analysis.level, ThreatLevel::Medium);
    }

    #[test]
    fn test_critical_score_blocks_ip() {
        let detector = detector();
        let ctx = request("' OR 1=1 -- <script>x</script>");
        let event = detector.analyze(&ctx).unwrap();

        assert_eq!(event.severity, ThreatLevel::Critical);
        assert!(event.blocked);
        assert!(detector.is_blocked(ip()));
        assert_eq!(detector.stats().blocked_ips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let detector = detector();
        detector.block_ip(ip(), Duration::from_secs(10));
        assert!(detector.is_blocked(ip()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!detector.is_blocked(ip()));
    }

    #[test]
    fn test_brute_force_scoring() {
        let detector = detector();
        for attempt in 1..=5 {
            let event = detector.record_failed_login(ip());
            assert_eq!(event.is_some(), attempt == 5);
        }

        let analysis = detector.assess(&RequestContext::new(ip(), "POST", "/login"));
        assert_eq!(analysis.threat_types, vec!["brute_force".to_string()]);
        assert_eq!(analysis.score, 40);

        detector.record_successful_login(ip());
        assert_eq!(detector.failed_login_count(ip()), 0);
    }

    #[test]
    fn test_attack_tool_user_agent() {
        let detector = detector();
        let ctx = RequestContext::new(ip(), "GET", "/").with_header("User-Agent", "sqlmap/1.7.2");
        let analysis = detector.assess(&ctx);
        assert_eq!(analysis.primary_threat(), "suspicious_user_agent");
        assert_eq!(analysis.level, ThreatLevel::Low);
    }

    #[test]
    fn test_inline_code_and_currency_pass() {
        let detector = detector();
        let ctx = request(r#"{"abstract":"Run `cargo build` then compare cost $(USD) estimates"}"#);
        let analysis = detector.assess(&ctx);
        assert_eq!(analysis.score, 0);
        assert!(!analysis.blocked);

        let shell = request(r#"{"name":"$(whoami)"}"#);
        let analysis = detector.assess(&shell);
        assert_eq!(analysis.primary_threat(), "command_injection");
        assert!(analysis.blocked);
        assert!(detector.assess(&request("note=`cat /etc/hosts`")).blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_window_expires() {
        let detector = detector();
        detector.record_failed_login(ip());
        detector.record_failed_login("198.51.100.7".parse().unwrap());
        assert_eq!(detector.tracked_login_sources(), 2);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(detector.failed_login_count(ip()), 0);
        assert_eq!(detector.purge_expired(), 1);
        assert_eq!(detector.tracked_login_sources(), 0);
    }
}
