//! gradmesh-autoscaler: metrics-driven instance scaling.
//!
//! Ingests one `ScalingMetrics` sample at a time and decides whether to add
//! or remove one instance, subject to min/max bounds and a cooldown window.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if cpu > up.cpu OR memory > up.memory OR response_time > up.response_time:
//!     if cooldown elapsed and instances < max: instances += 1
//!
//! else if cpu < down.cpu AND memory < down.memory AND response_time < down.response_time:
//!     if cooldown elapsed and instances > min: instances -= 1
//! ```
//!
//! Only one scaling action is ever in flight; samples arriving while one is
//! executing are recorded in the history but not evaluated.

use thiserror::Error;

pub mod metrics_source;
pub mod models;
pub mod scaler;

pub use metrics_source::MetricsSource;
pub use models::{NoChangeReason, ScalingDecision, ScalingMetrics, ScalingStats};
pub use scaler::{AutoScaler, NoopScaleExecutor, ScaleExecutor};

/// Autoscaler errors
#[derive(Error, Debug)]
pub enum AutoscalerError {
    #[error("Scaling action from {from} to {to} instances failed: {reason}")]
    ScaleFailed { from: u32, to: u32, reason: String },

    #[error("Metrics collection failed: {0}")]
    MetricsUnavailable(String),

    #[error("Invalid autoscaler configuration: {0}")]
    Config(String),
}

/// Result type alias for autoscaler operations
pub type Result<T> = std::result::Result<T, AutoscalerError>;
