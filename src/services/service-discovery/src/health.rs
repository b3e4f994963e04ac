//! Health Monitoring Module
//!
//! Periodically probes every registered instance and records the outcome into
//! the registry. Probes run concurrently and each one is bounded by its own
//! timeout, so a slow or failing instance never delays or aborts the others.

use crate::models::{HealthCheckResult, ProbeOutcome, ServiceInfo, ServiceStatus};
use crate::registry::ServiceRegistry;
use crate::{Result, ServiceDiscoveryError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gradmesh_shared::HealthCheckConfig;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Liveness probe trait for dependency injection
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe one instance; the monitor applies the deadline
    async fn probe(&self, instance: &ServiceInfo) -> ProbeOutcome;
}

/// HTTP liveness probe: `GET http://{host}:{port}{path}`, healthy on 200
pub struct HttpHealthProbe {
    client: Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(config: &HealthCheckConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("gradmesh-health/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            path: config.path.clone(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, instance: &ServiceInfo) -> ProbeOutcome {
        let url = format!("{}{}", instance.base_url(), self.path);
        let start = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => ProbeOutcome::Success {
                response_time: start.elapsed(),
            },
            Ok(response) => ProbeOutcome::Failure {
                reason: format!("unexpected status {}", response.status()),
                response_time: Some(start.elapsed()),
            },
            Err(e) if e.is_timeout() => ProbeOutcome::Timeout,
            Err(e) => ProbeOutcome::Failure {
                reason: e.to_string(),
                response_time: None,
            },
        }
    }
}

/// Health monitoring statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthMonitoringStats {
    /// Total health checks performed
    pub total_health_checks: u64,

    /// Checks that ended unhealthy
    pub failed_health_checks: u64,

    /// Checks that ended degraded
    pub degraded_health_checks: u64,

    /// Completed monitoring cycles
    pub cycles: u64,

    /// Average response time of probes that answered, in milliseconds
    pub avg_response_time_ms: f64,

    /// Last cycle completion timestamp
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl HealthMonitoringStats {
    /// Failed checks over total checks (0.0 to 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.total_health_checks == 0 {
            0.0
        } else {
            self.failed_health_checks as f64 / self.total_health_checks as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    stats: HealthMonitoringStats,
    timed_checks: u64,
    total_response_time_ms: u64,
}

/// Background health monitor
pub struct HealthMonitor {
    config: HealthCheckConfig,
    registry: Arc<dyn ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    stats: Mutex<StatsAccumulator>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<dyn ServiceRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            stats: Mutex::new(StatsAccumulator::default()),
        }
    }

    /// Monitor using the HTTP probe built from `config`
    pub fn with_http_probe(
        config: HealthCheckConfig,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        let probe = Arc::new(HttpHealthProbe::new(&config)?);
        Ok(Self::new(config, registry, probe))
    }

    /// Probe one instance under the configured deadline
    pub async fn check_instance(&self, instance: &ServiceInfo) -> HealthCheckResult {
        let outcome = match timeout(self.config.timeout(), self.probe.probe(instance)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Timeout,
        };

        HealthCheckResult::from_outcome(
            &instance.instance_id,
            outcome,
            self.config.degraded_threshold(),
        )
    }

    /// Probe one instance by id and record the result
    pub async fn check_service_health(&self, instance_id: &str) -> Result<HealthCheckResult> {
        let instance = self.registry.get_instance(instance_id).await?;
        let result = self.check_instance(&instance).await;
        self.registry.record_health_check(result.clone()).await?;
        self.update_stats(std::slice::from_ref(&result));
        Ok(result)
    }

    /// Run one monitoring cycle over every registered instance
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let instances = self.registry.list().await;
        if instances.is_empty() {
            debug!("No registered instances to probe");
        }

        let results =
            futures::future::join_all(instances.iter().map(|instance| self.check_instance(instance)))
                .await;

        for result in &results {
            // A vanished instance must not abort the cycle for the others
            if let Err(e) = self.registry.record_health_check(result.clone()).await {
                match e {
                    ServiceDiscoveryError::ServiceNotFound(_) => {
                        debug!(instance = %result.instance_id, "Instance deregistered during probe")
                    }
                    other => {
                        error!(instance = %result.instance_id, error = %other, "Failed to record health check")
                    }
                }
            }
        }

        self.update_stats(&results);
        results
    }

    /// Loop until `cancel` fires, one cycle per configured interval
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Health monitoring disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval_seconds,
            timeout_secs = self.config.timeout_seconds,
            "Health monitoring started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let results = self.check_all().await;
                    let unhealthy = results
                        .iter()
                        .filter(|r| r.status == ServiceStatus::Unhealthy)
                        .count();
                    if unhealthy > 0 {
                        warn!(checked = results.len(), unhealthy, "Health cycle found unhealthy instances");
                    } else {
                        debug!(checked = results.len(), "Health cycle completed");
                    }
                }
            }
        }

        info!("Health monitoring stopped");
    }

    /// Get health check statistics
    pub fn stats(&self) -> HealthMonitoringStats {
        self.stats.lock().stats.clone()
    }

    fn update_stats(&self, results: &[HealthCheckResult]) {
        let mut acc = self.stats.lock();
        for result in results {
            acc.stats.total_health_checks += 1;
            match result.status {
                ServiceStatus::Unhealthy => acc.stats.failed_health_checks += 1,
                ServiceStatus::Degraded => acc.stats.degraded_health_checks += 1,
                _ => {}
            }
            if let Some(ms) = result.response_time_ms {
                acc.timed_checks += 1;
                acc.total_response_time_ms += ms;
            }
        }

        if acc.timed_checks > 0 {
            acc.stats.avg_response_time_ms =
                acc.total_response_time_ms as f64 / acc.timed_checks as f64;
        }
        acc.stats.cycles += 1;
        acc.stats.last_cycle_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceRegistration;
    use crate::registry::ServiceRegistryImpl;
    use gradmesh_shared::{EventBus, InMemoryKvStore, RegistryConfig};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Probe returning canned outcomes per port; port 0 hangs forever
    struct ScriptedProbe {
        outcomes: HashMap<u16, ProbeOutcome>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, instance: &ServiceInfo) -> ProbeOutcome {
            match self.outcomes.get(&instance.port) {
                Some(outcome) => outcome.clone(),
                None => std::future::pending().await,
            }
        }
    }

    fn registry() -> Arc<dyn ServiceRegistry> {
        Arc::new(ServiceRegistryImpl::new(
            RegistryConfig::default(),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(EventBus::default()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_hanging_probe_does_not_block_others() {
        let registry = registry();
        for port in [1, 2, 3] {
            registry
                .register(ServiceRegistration::new("svc", "h", port))
                .await
                .unwrap();
        }

        let outcomes = HashMap::from([
            (
                1,
                ProbeOutcome::Success {
                    response_time: Duration::from_millis(10),
                },
            ),
            (
                2,
                ProbeOutcome::Failure {
                    reason: "503".to_string(),
                    response_time: Some(Duration::from_millis(5)),
                },
            ),
        ]);
        let monitor = HealthMonitor::new(
            HealthCheckConfig::default(),
            registry.clone(),
            Arc::new(ScriptedProbe { outcomes }),
        );

        let results = monitor.check_all().await;
        assert_eq!(results.len(), 3);

        let status_of = |port: u16| {
            results
                .iter()
                .find(|r| r.instance_id == format!("svc@h:{}", port))
                .map(|r| r.status)
        };
        assert_eq!(status_of(1), Some(ServiceStatus::Healthy));
        assert_eq!(status_of(2), Some(ServiceStatus::Unhealthy));
        assert_eq!(status_of(3), Some(ServiceStatus::Unhealthy));

        let healthy = registry.healthy_instances_of("svc").await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].port, 1);

        let stats = monitor.stats();
        assert_eq!(stats.total_health_checks, 3);
        assert_eq!(stats.failed_health_checks, 2);
        assert!((stats.error_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let registry = registry();
        registry
            .register(ServiceRegistration::new("svc", "h", 1))
            .await
            .unwrap();
        let outcomes = HashMap::from([(
            1,
            ProbeOutcome::Success {
                response_time: Duration::from_millis(1),
            },
        )]);
        let monitor = Arc::new(HealthMonitor::new(
            HealthCheckConfig::default(),
            registry,
            Arc::new(ScriptedProbe { outcomes }),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            async move { monitor.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Ticks at 0s, 30s and 60s
        assert_eq!(monitor.stats().cycles, 3);
    }
}
