//! AutoScaler: threshold-driven instance scaling.
//!
//! Evaluates one sample at a time against the scale-up and scale-down
//! thresholds. The decision, the cooldown check and the executor call happen
//! under one action guard, so a decision is atomic with respect to the
//! cooldown and no two scaling actions ever overlap. Readers only take the
//! short state lock and never wait on an in-flight action.

use crate::metrics_source::MetricsSource;
use crate::models::{NoChangeReason, ScalingDecision, ScalingMetrics, ScalingStats};
use crate::{AutoscalerError, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gradmesh_shared::{topics, AutoscalerConfig, EventBus};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Performs the actual capacity change
#[async_trait]
pub trait ScaleExecutor: Send + Sync {
    async fn scale(&self, from: u32, to: u32) -> Result<()>;
}

/// Executor that only logs; used when capacity is managed elsewhere
#[derive(Debug, Default)]
pub struct NoopScaleExecutor;

#[async_trait]
impl ScaleExecutor for NoopScaleExecutor {
    async fn scale(&self, from: u32, to: u32) -> Result<()> {
        info!(from, to, "Scaling requested (no executor attached)");
        Ok(())
    }
}

/// Scaling state; written only by the holder of the action guard
struct ScaleState {
    current_instances: u32,
    last_action: Option<Instant>,
    last_action_at: Option<DateTime<Utc>>,
    scale_ups: u64,
    scale_downs: u64,
}

enum Wanted {
    Up,
    Down,
    Nothing,
}

/// The autoscaler evaluates metrics and decides whether to add or remove
/// one instance.
pub struct AutoScaler {
    config: AutoscalerConfig,
    action: tokio::sync::Mutex<()>,
    state: Mutex<ScaleState>,
    history: Mutex<VecDeque<ScalingMetrics>>,
    executor: Arc<dyn ScaleExecutor>,
    events: Option<Arc<EventBus>>,
}

impl AutoScaler {
    pub fn new(config: AutoscalerConfig, executor: Arc<dyn ScaleExecutor>) -> Result<Self> {
        if config.min_instances > config.max_instances {
            return Err(AutoscalerError::Config(format!(
                "min_instances ({}) exceeds max_instances ({})",
                config.min_instances, config.max_instances
            )));
        }
        let initial = config
            .initial_instances
            .clamp(config.min_instances, config.max_instances);
        let capacity = config.history_size.max(1);

        Ok(Self {
            config,
            action: tokio::sync::Mutex::new(()),
            state: Mutex::new(ScaleState {
                current_instances: initial,
                last_action: None,
                last_action_at: None,
                scale_ups: 0,
                scale_downs: 0,
            }),
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            executor,
            events: None,
        })
    }

    /// Publish `autoscaler.scaled` events on this bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn record_sample(&self, sample: &ScalingMetrics) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_size.max(1) {
            history.pop_front();
        }
        history.push_back(sample.clone());
    }

    fn wanted(&self, sample: &ScalingMetrics) -> Wanted {
        let c = &self.config;
        if sample.cpu_usage > c.scale_up_cpu
            || sample.memory_usage > c.scale_up_memory
            || sample.response_time_ms > c.scale_up_response_time_ms
        {
            Wanted::Up
        } else if sample.cpu_usage < c.scale_down_cpu
            && sample.memory_usage < c.scale_down_memory
            && sample.response_time_ms < c.scale_down_response_time_ms
        {
            Wanted::Down
        } else {
            Wanted::Nothing
        }
    }

    /// Ingest one sample and possibly scale by one instance
    pub async fn evaluate_scaling(&self, sample: ScalingMetrics) -> Result<ScalingDecision> {
        self.record_sample(&sample);

        // Non-reentrant: a sample arriving mid-action is not evaluated
        let Ok(_action) = self.action.try_lock() else {
            debug!("Scaling action in flight, skipping sample");
            return Ok(ScalingDecision::Skipped);
        };
        let (current, last_action) = {
            let state = self.state.lock();
            (state.current_instances, state.last_action)
        };

        let (from, to) = match self.wanted(&sample) {
            Wanted::Nothing => {
                return Ok(ScalingDecision::NoChange {
                    reason: NoChangeReason::WithinThresholds,
                })
            }
            Wanted::Up if current >= self.config.max_instances => {
                return Ok(ScalingDecision::NoChange {
                    reason: NoChangeReason::AtMaxInstances,
                })
            }
            Wanted::Down if current <= self.config.min_instances => {
                return Ok(ScalingDecision::NoChange {
                    reason: NoChangeReason::AtMinInstances,
                })
            }
            Wanted::Up => (current, current + 1),
            Wanted::Down => (current, current - 1),
        };

        if let Some(last) = last_action {
            if last.elapsed() < self.config.cooldown() {
                debug!(from, to, "Cooldown active, not scaling");
                return Ok(ScalingDecision::NoChange {
                    reason: NoChangeReason::CooldownActive,
                });
            }
        }

        if let Err(e) = self.executor.scale(from, to).await {
            error!(from, to, error = %e, "Scaling action failed");
            return Err(AutoscalerError::ScaleFailed {
                from,
                to,
                reason: e.to_string(),
            });
        }

        let (decision, direction) = {
            let mut state = self.state.lock();
            state.current_instances = to;
            state.last_action = Some(Instant::now());
            state.last_action_at = Some(Utc::now());
            if to > from {
                state.scale_ups += 1;
                (ScalingDecision::ScaledUp { from, to }, "up")
            } else {
                state.scale_downs += 1;
                (ScalingDecision::ScaledDown { from, to }, "down")
            }
        };

        info!(
            from,
            to,
            cpu = sample.cpu_usage,
            memory = sample.memory_usage,
            response_time_ms = sample.response_time_ms,
            "Scaled {}",
            direction
        );
        metrics::counter!("autoscaler_actions_total", "direction" => direction).increment(1);
        if let Some(events) = &self.events {
            events.emit(
                topics::AUTOSCALER_SCALED,
                json!({ "from": from, "to": to, "direction": direction }),
            );
        }

        Ok(decision)
    }

    /// Collect and evaluate one sample per interval until `cancel` fires
    pub async fn run(&self, source: Arc<dyn MetricsSource>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.evaluation_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.evaluation_interval_seconds,
            min = self.config.min_instances,
            max = self.config.max_instances,
            "Autoscaler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let sample = match source.collect().await {
                        Ok(sample) => sample,
                        Err(e) => {
                            warn!(error = %e, "Metrics collection failed, skipping cycle");
                            continue;
                        }
                    };
                    if let Err(e) = self.evaluate_scaling(sample).await {
                        warn!(error = %e, "Scaling evaluation failed");
                    }
                }
            }
        }

        info!("Autoscaler stopped");
    }

    pub fn current_instances(&self) -> u32 {
        self.state.lock().current_instances
    }

    /// Retained samples, oldest first
    pub fn history(&self) -> Vec<ScalingMetrics> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> ScalingStats {
        let history = self.history();
        let samples = history.len();
        let avg = |f: fn(&ScalingMetrics) -> f64| {
            if samples == 0 {
                0.0
            } else {
                history.iter().map(f).sum::<f64>() / samples as f64
            }
        };

        let state = self.state.lock();
        ScalingStats {
            current_instances: state.current_instances,
            min_instances: self.config.min_instances,
            max_instances: self.config.max_instances,
            samples,
            avg_cpu_usage: avg(|s| s.cpu_usage),
            avg_memory_usage: avg(|s| s.memory_usage),
            avg_response_time_ms: avg(|s| s.response_time_ms),
            avg_request_rate: avg(|s| s.request_rate),
            avg_error_rate: avg(|s| s.error_rate),
            scale_ups: state.scale_ups,
            scale_downs: state.scale_downs,
            last_action_at: state.last_action_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config() -> AutoscalerConfig {
        AutoscalerConfig {
            min_instances: 1,
            max_instances: 3,
            initial_instances: 1,
            cooldown_seconds: 300,
            ..AutoscalerConfig::default()
        }
    }

    fn scaler(config: AutoscalerConfig) -> AutoScaler {
        AutoScaler::new(config, Arc::new(NoopScaleExecutor)).unwrap()
    }

    fn hot() -> ScalingMetrics {
        ScalingMetrics::new(95.0, 50.0, 300.0)
    }

    fn cold() -> ScalingMetrics {
        ScalingMetrics::new(10.0, 20.0, 50.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_then_cooldown() {
        let scaler = scaler(config());

        assert_eq!(
            scaler.evaluate_scaling(hot()).await.unwrap(),
            ScalingDecision::ScaledUp { from: 1, to: 2 }
        );
        assert_eq!(
            scaler.evaluate_scaling(hot()).await.unwrap(),
            ScalingDecision::NoChange {
                reason: NoChangeReason::CooldownActive
            }
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(
            scaler.evaluate_scaling(hot()).await.unwrap(),
            ScalingDecision::ScaledUp { from: 2, to: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_bounds() {
        let scaler = scaler(AutoscalerConfig {
            cooldown_seconds: 0,
            ..config()
        });

        for _ in 0..10 {
            scaler.evaluate_scaling(hot()).await.unwrap();
            assert!(scaler.current_instances() <= 3);
        }
        assert_eq!(
            scaler.evaluate_scaling(hot()).await.unwrap(),
            ScalingDecision::NoChange {
                reason: NoChangeReason::AtMaxInstances
            }
        );

        for _ in 0..10 {
            scaler.evaluate_scaling(cold()).await.unwrap();
            assert!(scaler.current_instances() >= 1);
        }
        assert_eq!(
            scaler.evaluate_scaling(cold()).await.unwrap(),
            ScalingDecision::NoChange {
                reason: NoChangeReason::AtMinInstances
            }
        );
    }

    #[tokio::test]
    async fn test_response_time_alone_triggers_scale_up() {
        let scaler = scaler(config());
        let decision = scaler
            .evaluate_scaling(ScalingMetrics::new(10.0, 10.0, 1500.0))
            .await
            .unwrap();
        assert!(decision.is_action());
    }

    #[tokio::test]
    async fn test_scale_down_requires_every_metric_low() {
        let scaler = scaler(AutoscalerConfig {
            initial_instances: 2,
            ..config()
        });

        let mixed = ScalingMetrics::new(10.0, 60.0, 50.0);
        assert_eq!(
            scaler.evaluate_scaling(mixed).await.unwrap(),
            ScalingDecision::NoChange {
                reason: NoChangeReason::WithinThresholds
            }
        );
        assert_eq!(
            scaler.evaluate_scaling(cold()).await.unwrap(),
            ScalingDecision::ScaledDown { from: 2, to: 1 }
        );
    }

    struct FailingExecutor;

    #[async_trait]
    impl ScaleExecutor for FailingExecutor {
        async fn scale(&self, from: u32, to: u32) -> Result<()> {
            Err(AutoscalerError::ScaleFailed {
                from,
                to,
                reason: "orchestrator unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_executor_keeps_count_and_cooldown() {
        let scaler = AutoScaler::new(config(), Arc::new(FailingExecutor)).unwrap();

        assert!(scaler.evaluate_scaling(hot()).await.is_err());
        assert_eq!(scaler.current_instances(), 1);
        assert!(scaler.stats().last_action_at.is_none());
    }

    /// Executor that parks until released, to observe the in-flight guard
    struct GatedExecutor {
        gate: tokio::sync::Notify,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ScaleExecutor for GatedExecutor {
        async fn scale(&self, _from: u32, _to: u32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sample_during_action_is_skipped() {
        let executor = Arc::new(GatedExecutor {
            gate: tokio::sync::Notify::new(),
            calls: AtomicU32::new(0),
        });
        let scaler = Arc::new(AutoScaler::new(config(), executor.clone()).unwrap());

        let in_flight = tokio::spawn({
            let scaler = scaler.clone();
            async move { scaler.evaluate_scaling(hot()).await }
        });
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            scaler.evaluate_scaling(hot()).await.unwrap(),
            ScalingDecision::Skipped
        );

        executor.gate.notify_one();
        assert_eq!(
            in_flight.await.unwrap().unwrap(),
            ScalingDecision::ScaledUp { from: 1, to: 2 }
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scaler.history().len(), 2);
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_for_action() {
        let executor = Arc::new(GatedExecutor {
            gate: tokio::sync::Notify::new(),
            calls: AtomicU32::new(0),
        });
        let scaler = Arc::new(AutoScaler::new(config(), executor.clone()).unwrap());

        let in_flight = tokio::spawn({
            let scaler = scaler.clone();
            async move { scaler.evaluate_scaling(hot()).await }
        });
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Executor is parked; readers still see the pre-action state
        assert_eq!(scaler.current_instances(), 1);
        let stats = scaler.stats();
        assert_eq!(stats.current_instances, 1);
        assert_eq!(stats.scale_ups, 0);

        executor.gate.notify_one();
        in_flight.await.unwrap().unwrap();
        assert_eq!(scaler.current_instances(), 2);
        assert_eq!(scaler.stats().scale_ups, 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let scaler = scaler(AutoscalerConfig {
            history_size: 3,
            ..config()
        });
        for cpu in [40.0, 41.0, 42.0, 43.0, 44.0] {
            scaler
                .evaluate_scaling(ScalingMetrics::new(cpu, 50.0, 300.0))
                .await
                .unwrap();
        }

        let history = scaler.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cpu_usage, 42.0);

        let stats = scaler.stats();
        assert_eq!(stats.samples, 3);
        assert!((stats.avg_cpu_usage - 43.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejects_inverted_bounds() {
        let result = AutoScaler::new(
            AutoscalerConfig {
                min_instances: 4,
                max_instances: 2,
                ..config()
            },
            Arc::new(NoopScaleExecutor),
        );
        assert!(matches!(result, Err(AutoscalerError::Config(_))));
    }
}
