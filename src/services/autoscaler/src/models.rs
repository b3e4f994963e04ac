//! Metric samples, scaling decisions and statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One immutable metrics sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingMetrics {
    pub timestamp: DateTime<Utc>,
    /// CPU usage percentage
    pub cpu_usage: f64,
    /// Memory usage percentage
    pub memory_usage: f64,
    /// Requests per second
    pub request_rate: f64,
    /// Average response time in milliseconds
    pub response_time_ms: f64,
    /// Failed requests over total (0.0 to 1.0)
    pub error_rate: f64,
    pub active_connections: u64,
}

impl ScalingMetrics {
    pub fn new(cpu_usage: f64, memory_usage: f64, response_time_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_usage,
            memory_usage,
            request_rate: 0.0,
            response_time_ms,
            error_rate: 0.0,
            active_connections: 0,
        }
    }
}

/// Why a sample produced no action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoChangeReason {
    /// Metrics sit between the scale-down and scale-up thresholds
    WithinThresholds,
    /// A previous action happened less than one cooldown ago
    CooldownActive,
    /// Scale-up wanted but already at the maximum
    AtMaxInstances,
    /// Scale-down wanted but already at the minimum
    AtMinInstances,
}

impl fmt::Display for NoChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NoChangeReason::WithinThresholds => "within_thresholds",
            NoChangeReason::CooldownActive => "cooldown_active",
            NoChangeReason::AtMaxInstances => "at_max_instances",
            NoChangeReason::AtMinInstances => "at_min_instances",
        };
        f.write_str(label)
    }
}

/// Outcome of evaluating one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ScalingDecision {
    ScaledUp { from: u32, to: u32 },
    ScaledDown { from: u32, to: u32 },
    NoChange { reason: NoChangeReason },
    /// Another scaling action was in flight
    Skipped,
}

impl ScalingDecision {
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            ScalingDecision::ScaledUp { .. } | ScalingDecision::ScaledDown { .. }
        )
    }
}

/// Aggregates over the retained history window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingStats {
    pub current_instances: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    pub samples: usize,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
    pub avg_response_time_ms: f64,
    pub avg_request_rate: f64,
    pub avg_error_rate: f64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub last_action_at: Option<DateTime<Utc>>,
}
