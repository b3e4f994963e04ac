//! Service Registry Module
//!
//! Holds every registered service instance in memory and mirrors each service's
//! instance list into the injected key-value store, so that a lookup survives
//! the loss of the process-local map.

use crate::models::{
    instance_id, HealthCheckResult, RegistryStatistics, ServiceInfo, ServiceRegistration,
    ServiceStatus,
};
use crate::{Result, ServiceDiscoveryError};

use async_trait::async_trait;
use dashmap::DashMap;
use gradmesh_shared::{topics, EventBus, KvStore, RegistryConfig};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SNAPSHOT_KEY_PREFIX: &str = "registry:service:";

/// Service registry trait for dependency injection
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Idempotent upsert keyed on `{name}@{host}:{port}`
    async fn register(&self, registration: ServiceRegistration) -> Result<ServiceInfo>;

    /// Remove one instance
    async fn deregister(&self, name: &str, host: &str, port: u16) -> Result<ServiceInfo>;

    /// Every instance registered under `name`
    async fn get(&self, name: &str) -> Result<Vec<ServiceInfo>>;

    /// A single instance by id
    async fn get_instance(&self, instance_id: &str) -> Result<ServiceInfo>;

    /// All instances, sorted by instance id
    async fn list(&self) -> Vec<ServiceInfo>;

    /// Healthy, non-stale instances of every service
    async fn healthy_instances(&self) -> Vec<ServiceInfo>;

    /// Healthy, non-stale instances of `name`, sorted by instance id
    async fn healthy_instances_of(&self, name: &str) -> Vec<ServiceInfo>;

    /// Apply a probe result; the only path that changes an instance status
    async fn record_health_check(&self, result: HealthCheckResult) -> Result<()>;

    /// Counts per status
    async fn statistics(&self) -> RegistryStatistics;
}

/// In-memory registry backed by a shared key-value snapshot
pub struct ServiceRegistryImpl {
    config: RegistryConfig,
    instances: DashMap<String, ServiceInfo>,
    store: Arc<dyn KvStore>,
    events: Arc<EventBus>,
}

impl ServiceRegistryImpl {
    pub fn new(config: RegistryConfig, store: Arc<dyn KvStore>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            instances: DashMap::new(),
            store,
            events,
        }
    }

    fn snapshot_key(name: &str) -> String {
        format!("{}{}", SNAPSHOT_KEY_PREFIX, name)
    }

    fn local_instances_of(&self, name: &str) -> Vec<ServiceInfo> {
        let mut found: Vec<ServiceInfo> = self
            .instances
            .iter()
            .filter(|entry| entry.value().name == name)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        found
    }

    /// Write the current instance list of `name` to the shared store
    async fn persist_service(&self, name: &str) {
        let instances = self.local_instances_of(name);
        let key = Self::snapshot_key(name);

        let outcome = if instances.is_empty() {
            self.store.delete(&key).await.map(|_| ())
        } else {
            match serde_json::to_string(&instances) {
                Ok(serialized) => {
                    self.store
                        .set(&key, serialized, Some(self.config.snapshot_ttl()))
                        .await
                }
                Err(e) => Err(e.into()),
            }
        };

        // The in-memory map stays authoritative when the store is unavailable
        if let Err(e) = outcome {
            warn!(service = %name, error = %e, "Failed to persist registry snapshot");
        }
    }

    /// Reload a service from the shared store after a local miss
    async fn restore_service(&self, name: &str) -> Result<Vec<ServiceInfo>> {
        let Some(serialized) = self.store.get(&Self::snapshot_key(name)).await? else {
            return Ok(Vec::new());
        };

        let mut restored: Vec<ServiceInfo> = serde_json::from_str(&serialized)?;
        for info in restored.iter_mut() {
            // No probe has confirmed these instances in this process
            info.status = ServiceStatus::Unknown;
            info.last_success_at = None;
            self.instances
                .entry(info.instance_id.clone())
                .or_insert_with(|| info.clone());
        }

        info!(service = %name, count = restored.len(), "Restored instances from registry snapshot");
        Ok(self.local_instances_of(name))
    }
}

#[async_trait]
impl ServiceRegistry for ServiceRegistryImpl {
    async fn register(&self, registration: ServiceRegistration) -> Result<ServiceInfo> {
        crate::utils::validate_registration(&registration)?;

        let id = registration.instance_id();
        let (info, created) = match self.instances.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.version = registration.version.clone();
                (existing.clone(), false)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let info = ServiceInfo::from_registration(&registration);
                vacant.insert(info.clone());
                (info, true)
            }
        };

        self.persist_service(&registration.name).await;

        if created {
            info!(service = %info.name, instance = %id, version = %info.version, "Registered service instance");
            self.events.emit(
                topics::SERVICE_REGISTERED,
                json!({ "service": info.name, "instance_id": id, "version": info.version }),
            );
        } else {
            debug!(instance = %id, "Refreshed existing registration");
        }

        Ok(info)
    }

    async fn deregister(&self, name: &str, host: &str, port: u16) -> Result<ServiceInfo> {
        let id = instance_id(name, host, port);
        let (_, removed) = self
            .instances
            .remove(&id)
            .ok_or_else(|| ServiceDiscoveryError::ServiceNotFound(id.clone()))?;

        self.persist_service(name).await;

        info!(service = %name, instance = %id, "Deregistered service instance");
        self.events.emit(
            topics::SERVICE_DEREGISTERED,
            json!({ "service": name, "instance_id": id }),
        );
        Ok(removed)
    }

    async fn get(&self, name: &str) -> Result<Vec<ServiceInfo>> {
        let mut instances = self.local_instances_of(name);
        if instances.is_empty() {
            instances = self.restore_service(name).await?;
        }

        if instances.is_empty() {
            return Err(ServiceDiscoveryError::ServiceNotFound(name.to_string()));
        }
        Ok(instances)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ServiceInfo> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceDiscoveryError::ServiceNotFound(instance_id.to_string()))
    }

    async fn list(&self) -> Vec<ServiceInfo> {
        let mut all: Vec<ServiceInfo> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }

    async fn healthy_instances(&self) -> Vec<ServiceInfo> {
        let now = Instant::now();
        let stale_after = self.config.stale_after();
        self.list()
            .await
            .into_iter()
            .filter(|info| info.is_serviceable(now, stale_after))
            .collect()
    }

    async fn healthy_instances_of(&self, name: &str) -> Vec<ServiceInfo> {
        let now = Instant::now();
        let stale_after = self.config.stale_after();
        self.local_instances_of(name)
            .into_iter()
            .filter(|info| info.is_serviceable(now, stale_after))
            .collect()
    }

    async fn record_health_check(&self, result: HealthCheckResult) -> Result<()> {
        let (service, previous) = {
            let mut entry = self
                .instances
                .get_mut(&result.instance_id)
                .ok_or_else(|| ServiceDiscoveryError::ServiceNotFound(result.instance_id.clone()))?;

            let info = entry.value_mut();
            let previous = info.status;
            info.status = result.status;
            info.last_check_time = Some(result.checked_at);
            info.last_response_time_ms = result.response_time_ms;
            if result.status == ServiceStatus::Healthy {
                info.last_success_at = Some(Instant::now());
            }
            (info.name.clone(), previous)
        };

        if previous != result.status {
            match result.status {
                ServiceStatus::Healthy => {
                    info!(instance = %result.instance_id, from = %previous, "Instance became healthy")
                }
                _ => warn!(
                    instance = %result.instance_id,
                    from = %previous,
                    to = %result.status,
                    error = ?result.error_message,
                    "Instance status changed"
                ),
            }
            self.events.emit(
                topics::SERVICE_STATUS_CHANGED,
                json!({
                    "service": service,
                    "instance_id": result.instance_id,
                    "from": previous,
                    "to": result.status,
                }),
            );
            self.persist_service(&service).await;
        }

        Ok(())
    }

    async fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics::default();
        let mut names = HashSet::new();

        for entry in self.instances.iter() {
            let info = entry.value();
            stats.total_instances += 1;
            names.insert(info.name.clone());
            match info.status {
                ServiceStatus::Healthy => stats.healthy += 1,
                ServiceStatus::Degraded => stats.degraded += 1,
                ServiceStatus::Unhealthy => stats.unhealthy += 1,
                ServiceStatus::Unknown => stats.unknown += 1,
            }
        }

        stats.total_services = names.len();
        stats
    }
}
