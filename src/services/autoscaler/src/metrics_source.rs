//! Source of periodic metric samples

use crate::models::ScalingMetrics;
use crate::Result;
use async_trait::async_trait;

/// Collects one sample per call, e.g. from the host's performance monitor
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn collect(&self) -> Result<ScalingMetrics>;
}
