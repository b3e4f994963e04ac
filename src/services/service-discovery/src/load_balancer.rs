//! Load Balancer Module
//!
//! Selects one healthy instance of a service per call. Every selection works on
//! a single snapshot of the healthy set taken from the registry, sorted by
//! instance id so rotation order is deterministic.

use crate::models::ServiceInfo;
use crate::registry::ServiceRegistry;
use crate::{Result, ServiceDiscoveryError};

use async_trait::async_trait;
use dashmap::DashMap;
use gradmesh_shared::LoadBalancingStrategy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Load balancer trait for dependency injection
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select an instance with the deployment default strategy
    async fn pick(&self, service_name: &str) -> Result<ServiceInfo>;

    /// Select an instance with an explicit strategy
    async fn pick_with(
        &self,
        service_name: &str,
        strategy: LoadBalancingStrategy,
    ) -> Result<ServiceInfo>;

    /// Selection counters for a service
    fn stats(&self, service_name: &str) -> LoadBalancerStats;
}

/// Per-service selection counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancerStats {
    pub service_name: String,
    pub total_picks: u64,
    pub picks_by_instance: HashMap<String, u64>,
    pub no_instance_available: u64,
}

#[derive(Debug, Default)]
struct ServiceCounters {
    next_index: AtomicUsize,
    total_picks: AtomicU64,
    no_instance_available: AtomicU64,
    picks_by_instance: DashMap<String, AtomicU64>,
}

/// Registry-backed load balancer
pub struct LoadBalancerImpl {
    registry: Arc<dyn ServiceRegistry>,
    default_strategy: LoadBalancingStrategy,
    counters: DashMap<String, Arc<ServiceCounters>>,
}

impl LoadBalancerImpl {
    pub fn new(registry: Arc<dyn ServiceRegistry>, default_strategy: LoadBalancingStrategy) -> Self {
        Self {
            registry,
            default_strategy,
            counters: DashMap::new(),
        }
    }

    fn counters_for(&self, service_name: &str) -> Arc<ServiceCounters> {
        self.counters
            .entry(service_name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Pure selection over a snapshot
    fn select<'a>(
        strategy: LoadBalancingStrategy,
        candidates: &'a [ServiceInfo],
        counters: &ServiceCounters,
    ) -> Option<&'a ServiceInfo> {
        if candidates.is_empty() {
            return None;
        }

        match strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index = counters.next_index.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(index)
            }
            // Ties resolve to the lowest instance id because the snapshot is sorted
            LoadBalancingStrategy::LeastLoaded => candidates
                .iter()
                .min_by_key(|info| info.last_response_time_ms.unwrap_or(u64::MAX)),
            LoadBalancingStrategy::FirstAvailable => candidates.first(),
            LoadBalancingStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                candidates.get(index)
            }
        }
    }
}

#[async_trait]
impl LoadBalancer for LoadBalancerImpl {
    async fn pick(&self, service_name: &str) -> Result<ServiceInfo> {
        self.pick_with(service_name, self.default_strategy).await
    }

    async fn pick_with(
        &self,
        service_name: &str,
        strategy: LoadBalancingStrategy,
    ) -> Result<ServiceInfo> {
        let counters = self.counters_for(service_name);
        let snapshot = self.registry.healthy_instances_of(service_name).await;

        let Some(chosen) = Self::select(strategy, &snapshot, &counters) else {
            counters.no_instance_available.fetch_add(1, Ordering::Relaxed);
            // Distinguish an unknown service from one with nothing healthy
            self.registry.get(service_name).await?;
            return Err(ServiceDiscoveryError::NoHealthyInstance(
                service_name.to_string(),
            ));
        };

        counters.total_picks.fetch_add(1, Ordering::Relaxed);
        counters
            .picks_by_instance
            .entry(chosen.instance_id.clone())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            service = %service_name,
            instance = %chosen.instance_id,
            strategy = ?strategy,
            candidates = snapshot.len(),
            "Selected instance"
        );
        Ok(chosen.clone())
    }

    fn stats(&self, service_name: &str) -> LoadBalancerStats {
        let Some(counters) = self.counters.get(service_name).map(|c| c.value().clone()) else {
            return LoadBalancerStats {
                service_name: service_name.to_string(),
                ..Default::default()
            };
        };

        LoadBalancerStats {
            service_name: service_name.to_string(),
            total_picks: counters.total_picks.load(Ordering::Relaxed),
            picks_by_instance: counters
                .picks_by_instance
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            no_instance_available: counters.no_instance_available.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthCheckResult, ProbeOutcome, ServiceRegistration};
    use crate::registry::ServiceRegistryImpl;
    use gradmesh_shared::{EventBus, InMemoryKvStore, RegistryConfig};
    use std::collections::HashSet;
    use std::time::Duration;

    async fn registry_with_healthy(ports_and_latency: &[(u16, u64)]) -> Arc<dyn ServiceRegistry> {
        let registry: Arc<dyn ServiceRegistry> = Arc::new(ServiceRegistryImpl::new(
            RegistryConfig::default(),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(EventBus::default()),
        ));
        for &(port, latency_ms) in ports_and_latency {
            let info = registry
                .register(ServiceRegistration::new("svc", "h", port))
                .await
                .unwrap();
            registry
                .record_health_check(HealthCheckResult::from_outcome(
                    &info.instance_id,
                    ProbeOutcome::Success {
                        response_time: Duration::from_millis(latency_ms),
                    },
                    Duration::from_secs(2),
                ))
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_instance_once_per_round() {
        let registry = registry_with_healthy(&[(3, 10), (1, 10), (2, 10), (4, 10)]).await;
        let lb = LoadBalancerImpl::new(registry, LoadBalancingStrategy::RoundRobin);

        for _ in 0..3 {
            let mut seen = HashSet::new();
            for _ in 0..4 {
                seen.insert(lb.pick("svc").await.unwrap().port);
            }
            assert_eq!(seen.len(), 4);
        }
        assert_eq!(lb.stats("svc").total_picks, 12);
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_fastest() {
        let registry = registry_with_healthy(&[(1, 300), (2, 20), (3, 20), (4, 90)]).await;
        let lb = LoadBalancerImpl::new(registry, LoadBalancingStrategy::LeastLoaded);

        for _ in 0..5 {
            assert_eq!(lb.pick("svc").await.unwrap().port, 2);
        }
    }

    #[tokio::test]
    async fn test_first_available_and_random() {
        let registry = registry_with_healthy(&[(2, 10), (1, 10)]).await;
        let lb = LoadBalancerImpl::new(registry, LoadBalancingStrategy::FirstAvailable);

        assert_eq!(lb.pick("svc").await.unwrap().port, 1);
        let random = lb
            .pick_with("svc", LoadBalancingStrategy::Random)
            .await
            .unwrap();
        assert!([1, 2].contains(&random.port));
    }

    #[tokio::test]
    async fn test_no_healthy_instance_vs_unknown_service() {
        let registry: Arc<dyn ServiceRegistry> = Arc::new(ServiceRegistryImpl::new(
            RegistryConfig::default(),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(EventBus::default()),
        ));
        registry
            .register(ServiceRegistration::new("svc", "h", 1))
            .await
            .unwrap();
        let lb = LoadBalancerImpl::new(registry, LoadBalancingStrategy::RoundRobin);

        assert!(matches!(
            lb.pick("svc").await,
            Err(ServiceDiscoveryError::NoHealthyInstance(_))
        ));
        assert!(matches!(
            lb.pick("ghost").await,
            Err(ServiceDiscoveryError::ServiceNotFound(_))
        ));
        assert_eq!(lb.stats("svc").no_instance_available, 1);
    }
}
