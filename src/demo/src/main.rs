//! GradMesh demo
//!
//! Runs the control plane against services given as `--service name=host:port`
//! and keeps the health monitor and autoscaler running until Ctrl+C.

use anyhow::{anyhow, Context, Result};
use api_gateway::ServiceMesh;
use async_trait::async_trait;
use autoscaler::{AutoScaler, MetricsSource, NoopScaleExecutor, ScalingMetrics};
use clap::Parser;
use gradmesh_shared::{EventBus, InMemoryKvStore, KvStore, LogFormat, MeshConfig};
use service_discovery::{HealthMonitor, ServiceRegistration, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tiered_cache::CachingStrategy;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LAST_SAMPLE_KEY: &str = "autoscaler:last_sample";

#[derive(Parser, Debug)]
#[command(name = "gradmesh-demo", version, about = "GradMesh control plane demo")]
struct Args {
    /// Service instance to register, as name=host:port (repeatable)
    #[arg(short, long = "service", value_parser = parse_service)]
    services: Vec<ServiceRegistration>,

    /// Override the configured log level
    #[arg(long, env = "GRADMESH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Redis URL for the shared key-value store
    #[cfg(feature = "redis")]
    #[arg(long, env = "GRADMESH_REDIS_URL")]
    redis_url: Option<String>,
}

fn parse_service(raw: &str) -> Result<ServiceRegistration> {
    let (name, address) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=host:port, got {:?}", raw))?;
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got {:?}", address))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {:?}", raw))?;
    Ok(ServiceRegistration::new(name, host, port))
}

/// Derives scaling samples from what the mesh itself observes
///
/// The share of instances that are not healthy stands in for CPU pressure on
/// the remaining ones; probe latency and failure ratio come from the health
/// monitor. Each sample is cached for inspection.
struct MeshMetricsSource {
    registry: Arc<dyn ServiceRegistry>,
    monitor: Arc<HealthMonitor>,
    cache: Arc<CachingStrategy>,
}

#[async_trait]
impl MetricsSource for MeshMetricsSource {
    async fn collect(&self) -> autoscaler::Result<ScalingMetrics> {
        let registry = self.registry.statistics().await;
        let health = self.monitor.stats();
        if registry.total_instances == 0 {
            return Err(autoscaler::AutoscalerError::MetricsUnavailable(
                "no registered instances".to_string(),
            ));
        }

        let unavailable = registry.total_instances - registry.healthy;
        let pressure = unavailable as f64 / registry.total_instances as f64 * 100.0;
        let mut sample = ScalingMetrics::new(pressure, 0.0, health.avg_response_time_ms);
        sample.error_rate = health.error_rate();
        sample.active_connections = registry.healthy as u64;

        if let Err(e) = self
            .cache
            .set_as(LAST_SAMPLE_KEY, &sample, Some(Duration::from_secs(60)))
            .await
        {
            warn!(error = %e, "Failed to cache metrics sample");
        }
        Ok(sample)
    }
}

fn init_tracing(config: &MeshConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&config.observability.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        [
            "gradmesh_demo",
            "api_gateway",
            "service_discovery",
            "autoscaler",
            "tiered_cache",
            "gradmesh_security",
            "gradmesh_shared",
        ]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    match config.observability.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

async fn build_store(_args: &Args) -> Result<Arc<dyn KvStore>> {
    #[cfg(feature = "redis")]
    {
        if let Some(url) = &_args.redis_url {
            let store = gradmesh_shared::RedisKvStore::connect(url)
                .await
                .context("connecting to redis")?;
            return Ok(Arc::new(store));
        }
    }
    Ok(Arc::new(InMemoryKvStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = MeshConfig::from_env().context("loading configuration")?;
    init_tracing(&config, args.log_level.as_deref());
    info!(
        environment = %config.environment,
        services = args.services.len(),
        "Starting GradMesh demo"
    );

    let store = build_store(&args).await?;
    let events = Arc::new(EventBus::default());
    let mesh = ServiceMesh::builder(config.clone())
        .with_store(store.clone())
        .with_events(events.clone())
        .build()?;

    let cache = Arc::new(CachingStrategy::new(config.cache.clone(), store));
    let scaler = Arc::new(
        AutoScaler::new(config.autoscaler.clone(), Arc::new(NoopScaleExecutor))?
            .with_events(events.clone()),
    );

    for registration in args.services {
        match mesh.register(registration).await {
            Ok(info) => {
                info!(service = %info.name, instance = %info.instance_id, "Registered service")
            }
            Err(e) => error!(error = %e, "Service registration failed"),
        }
    }

    let cancel = CancellationToken::new();
    mesh.start(cancel.clone());

    let source: Arc<dyn MetricsSource> = Arc::new(MeshMetricsSource {
        registry: mesh.registry().clone(),
        monitor: mesh.health_monitor().clone(),
        cache: cache.clone(),
    });
    mesh.spawn_background({
        let scaler = scaler.clone();
        let token = mesh.shutdown_token();
        async move { scaler.run(source, token).await }
    });

    shutdown_signal().await;
    cancel.cancel();
    mesh.shutdown().await;

    let status = mesh.status().await;
    info!(
        instances = status.registry.total_instances,
        healthy = status.registry.healthy,
        health_checks = status.health.total_health_checks,
        open_circuits = mesh.breakers().open_circuits().len(),
        replicas = scaler.current_instances(),
        cache_hit_rate = cache.hit_rate(),
        "GradMesh demo stopped"
    );
    match serde_json::to_string(&status) {
        Ok(json) => info!(status = %json, "Final mesh status"),
        Err(e) => warn!(error = %e, "Failed to serialize mesh status"),
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service() {
        let registration = parse_service("user-service=localhost:8001").unwrap();
        assert_eq!(registration.name, "user-service");
        assert_eq!(registration.host, "localhost");
        assert_eq!(registration.port, 8001);

        assert!(parse_service("user-service").is_err());
        assert!(parse_service("user-service=localhost").is_err());
        assert!(parse_service("user-service=localhost:http").is_err());
    }

    #[test]
    fn test_args_accept_repeated_services() {
        let args = Args::try_parse_from([
            "gradmesh-demo",
            "--service",
            "a=10.0.0.1:80",
            "-s",
            "b=10.0.0.2:81",
        ])
        .unwrap();
        assert_eq!(args.services.len(), 2);
        assert_eq!(args.services[1].name, "b");
    }
}
