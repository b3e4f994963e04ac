//! Background control loop tests driven by a paused clock

use async_trait::async_trait;
use autoscaler::{
    AutoScaler, AutoscalerError, MetricsSource, NoopScaleExecutor, ScalingMetrics,
};
use gradmesh_shared::{topics, AutoscalerConfig, EventBus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Replays scripted samples; `None` simulates a failed collection
struct ScriptedSource {
    samples: Mutex<VecDeque<Option<ScalingMetrics>>>,
}

impl ScriptedSource {
    fn new(samples: Vec<Option<ScalingMetrics>>) -> Self {
        Self {
            samples: Mutex::new(samples.into()),
        }
    }
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    async fn collect(&self) -> autoscaler::Result<ScalingMetrics> {
        match self.samples.lock().pop_front() {
            Some(Some(sample)) => Ok(sample),
            Some(None) => Err(AutoscalerError::MetricsUnavailable(
                "collector offline".to_string(),
            )),
            None => Ok(ScalingMetrics::new(50.0, 50.0, 500.0)),
        }
    }
}

fn hot() -> Option<ScalingMetrics> {
    Some(ScalingMetrics::new(92.0, 70.0, 400.0))
}

#[tokio::test(start_paused = true)]
async fn test_loop_survives_collection_failures_and_respects_cooldown() {
    let config = AutoscalerConfig {
        min_instances: 1,
        max_instances: 5,
        initial_instances: 1,
        cooldown_seconds: 120,
        evaluation_interval_seconds: 60,
        ..AutoscalerConfig::default()
    };
    let events = Arc::new(EventBus::default());
    let mut scaled = events.subscribe(topics::AUTOSCALER_SCALED);
    let scaler = Arc::new(
        AutoScaler::new(config, Arc::new(NoopScaleExecutor))
            .unwrap()
            .with_events(events.clone()),
    );

    // Ticks at 0, 60, 120, 180, 240s
    let source = Arc::new(ScriptedSource::new(vec![hot(), None, hot(), hot(), hot()]));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let scaler = scaler.clone();
        let cancel = cancel.clone();
        async move { scaler.run(source, cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(250)).await;
    cancel.cancel();
    handle.await.unwrap();

    // Scaled at 0s and 120s; 180s fell inside the cooldown; 240s scaled again
    assert_eq!(scaler.current_instances(), 4);
    let stats = scaler.stats();
    assert_eq!(stats.scale_ups, 3);
    assert_eq!(stats.samples, 4);

    let first = scaled.recv().await.unwrap();
    assert_eq!(first.payload["from"], 1);
    assert_eq!(first.payload["to"], 2);
}
