//! End-to-end tests for the request security pipeline

use gradmesh_security::{
    EncryptionManager, RequestContext, SecurityConfig, SecurityError, SecurityManager, ThreatLevel,
};
use gradmesh_shared::{topics, EventBus};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn attacker() -> IpAddr {
    "192.0.2.66".parse().unwrap()
}

fn manager() -> SecurityManager {
    SecurityManager::new(SecurityConfig {
        denial_alert_threshold: 2,
        block_duration_seconds: 60,
        encryption_key: Some(EncryptionManager::generate_key()),
        ..SecurityConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_sql_injection_is_blocked_and_published() {
    let events = Arc::new(EventBus::default());
    let mut blocked = events.subscribe(topics::SECURITY_THREAT_BLOCKED);
    let security = manager().with_events(events);

    let ctx = RequestContext::new(attacker(), "POST", "/api/users/login")
        .with_payload(r#"{"username": "admin' OR 1=1 --", "password": "x"}"#);

    match security.evaluate_request(&ctx) {
        Err(SecurityError::ThreatBlocked { score, threat_type }) => {
            assert!(score >= 50);
            assert_eq!(threat_type, "sql_injection");
        }
        other => panic!("expected ThreatBlocked, got {:?}", other),
    }

    let event = blocked.recv().await.unwrap();
    assert_eq!(event.payload["path"], "/api/users/login");
    assert_eq!(event.payload["threat_types"][0], "sql_injection");

    let audited = security.audit().security_events(ThreatLevel::High);
    assert_eq!(audited.len(), 1);
    assert!(audited[0].blocked);
}

#[tokio::test(start_paused = true)]
async fn test_critical_threat_blocks_ip_until_expiry() {
    let security = manager();
    let ctx = RequestContext::new(attacker(), "GET", "/api/projects")
        .with_header("Referer", "<script>document.cookie</script>")
        .with_payload("name=x'; DROP TABLE projects; --");

    assert!(matches!(
        security.evaluate_request(&ctx),
        Err(SecurityError::ThreatBlocked { .. })
    ));

    // Even a clean request from that IP is now refused
    let clean = RequestContext::new(attacker(), "GET", "/api/advisors");
    assert!(matches!(
        security.evaluate_request(&clean),
        Err(SecurityError::IpBlocked(_))
    ));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(security.evaluate_request(&clean).is_ok());
    assert!(security.compliance_report().result("critical_threats_blocked").unwrap().passed);
}

#[test]
fn test_authorization_through_request_pipeline() {
    let security = manager();
    let ip: IpAddr = "10.1.1.1".parse().unwrap();

    let own = RequestContext::new(ip, "GET", "/api/projects/7")
        .with_user("s-1", "student")
        .with_attribute("owner_id", json!("s-1"));
    assert!(security.evaluate_request(&own).is_ok());

    let foreign = RequestContext::new(ip, "DELETE", "/api/projects/7")
        .with_user("s-1", "student")
        .with_attribute("owner_id", json!("s-1"));
    match security.evaluate_request(&foreign) {
        Err(SecurityError::PermissionDenied {
            user_id,
            resource,
            action,
        }) => {
            assert_eq!(user_id, "s-1");
            assert_eq!(resource, "projects");
            assert_eq!(action, "delete");
        }
        other => panic!("expected PermissionDenied, got {:?}", other),
    }

    let advisor = RequestContext::new(ip, "PUT", "/api/milestones/3").with_user("a-1", "advisor");
    assert!(security.evaluate_request(&advisor).is_ok());
}

#[tokio::test]
async fn test_repeated_denials_raise_anomaly_and_fail_compliance() {
    let events = Arc::new(EventBus::default());
    let mut anomalies = events.subscribe(topics::SECURITY_ACCESS_ANOMALY);
    let security = manager().with_events(events);
    let attrs = Default::default();

    for _ in 0..3 {
        let decision = security.check_authorization("s-2", "student", "committees", "write", &attrs);
        assert!(!decision.granted);
    }

    let event = anomalies.recv().await.unwrap();
    assert_eq!(event.payload["user_id"], "s-2");
    assert_eq!(event.payload["denials"], 2);

    let report = security.compliance_report();
    assert!(!report.passed);
    let result = report.result("access_denial_anomalies").unwrap();
    assert_eq!(result.issues, vec!["user s-2 has 3 access denials".to_string()]);
    assert!(report.result("encryption_configured").unwrap().passed);
}

#[test]
fn test_failed_logins_feed_threat_scoring() {
    let security = manager();
    let ip: IpAddr = "10.9.9.9".parse().unwrap();

    let events: Vec<_> = (0..5)
        .filter_map(|_| security.record_login_attempt(ip, Some("alice"), false))
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "brute_force");
    assert_eq!(events[0].user_id.as_deref(), Some("alice"));

    // Brute-force weight alone stays below the block threshold
    let login = RequestContext::new(ip, "POST", "/api/users/login");
    let analysis = security.evaluate_request(&login).unwrap();
    assert_eq!(analysis.primary_threat(), "brute_force");

    security.record_login_attempt(ip, Some("alice"), true);
    assert_eq!(security.evaluate_request(&login).unwrap().score, 0);
}
