//! Circuit breaker service for fault tolerance
//!
//! One breaker per logical service. Calls are admitted through a
//! [`CallPermit`] that remembers the breaker generation it was issued under;
//! a success reported on a permit from before the breaker last opened is
//! stale and ignored, while failures always count.

use dashmap::DashMap;
use gradmesh_shared::{topics, CircuitBreakerConfig, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Requests fail fast
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    generation: u64,
    trial_in_flight: bool,
    successes: u64,
    failures: u64,
    rejected: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            generation: 0,
            trial_in_flight: false,
            successes: 0,
            failures: 0,
            rejected: 0,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    /// Milliseconds since the circuit opened, while open or half-open
    pub open_for_ms: Option<u64>,
    /// Milliseconds since the most recent failure
    pub last_failure_ms_ago: Option<u64>,
}

enum Transition {
    Opened,
    Closed,
}

/// Circuit breaker for one service
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: Option<Arc<EventBus>>,
}

/// Admission ticket for one call
///
/// Settle it with [`CallPermit::success`], [`CallPermit::failure`] or
/// [`CallPermit::release`]. A permit dropped unsettled counts as a failure,
/// so a caller abandoned by its own timeout still reports.
#[must_use = "a dropped permit counts as a failed call"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.report_success(Some(self.generation), self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.report_failure(self.trial);
    }

    /// Give the permit back without counting a result
    pub fn release(mut self) {
        self.settled = true;
        if self.trial {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(service = %self.breaker.service, "Unsettled call permit counted as failure");
            self.breaker.report_failure(self.trial);
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState::default()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Admit a call if the circuit allows it
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let (generation, trial) = self.admit()?;
        Some(CallPermit {
            breaker: self,
            generation,
            trial,
            settled: false,
        })
    }

    /// Check whether a call may proceed
    ///
    /// In half-open state a `true` answer reserves the single trial slot,
    /// which is freed by the next [`on_success`](Self::on_success) or
    /// [`on_failure`](Self::on_failure).
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Reset the failure count and force the circuit closed
    pub fn on_success(&self) {
        self.report_success(None, false);
    }

    /// Count a failure, opening the circuit at the threshold
    pub fn on_failure(&self) {
        self.report_failure(false);
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Reset circuit breaker (admin function)
    pub fn reset(&self) {
        let was = {
            let mut state = self.state.lock();
            let was = state.state;
            state.state = CircuitState::Closed;
            state.failure_count = 0;
            state.last_failure = None;
            state.opened_at = None;
            state.trial_in_flight = false;
            state.generation += 1;
            was
        };
        info!(service = %self.service, previous = ?was, "Circuit breaker reset");
        if was != CircuitState::Closed {
            self.publish(Transition::Closed);
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: self.config.failure_threshold,
            total_successes: state.successes,
            total_failures: state.failures,
            rejected_calls: state.rejected,
            open_for_ms: state
                .opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            last_failure_ms_ago: state
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }

    fn admit(&self) -> Option<(u64, bool)> {
        if !self.config.enabled {
            return Some((self.state.lock().generation, false));
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Some((state.generation, false)),
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout())
                    .unwrap_or(true);
                if cooled {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    debug!(service = %self.service, "Circuit half-open, admitting trial call");
                    Some((state.generation, true))
                } else {
                    state.rejected += 1;
                    drop(state);
                    self.count_rejection();
                    None
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    state.rejected += 1;
                    drop(state);
                    self.count_rejection();
                    None
                } else {
                    state.trial_in_flight = true;
                    Some((state.generation, true))
                }
            }
        }
    }

    fn report_success(&self, generation: Option<u64>, trial: bool) {
        if !self.config.enabled {
            return;
        }

        let transition = {
            let mut state = self.state.lock();
            if generation.map_or(false, |g| g != state.generation) {
                debug!(service = %self.service, "Ignoring stale success report");
                if trial {
                    state.trial_in_flight = false;
                }
                return;
            }

            state.successes += 1;
            state.failure_count = 0;
            state.trial_in_flight = false;
            if state.state != CircuitState::Closed {
                state.state = CircuitState::Closed;
                state.opened_at = None;
                Some(Transition::Closed)
            } else {
                None
            }
        };

        if let Some(transition) = transition {
            info!(service = %self.service, "Circuit breaker closed");
            self.publish(transition);
        }
    }

    fn report_failure(&self, trial: bool) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let transition = {
            let mut state = self.state.lock();
            state.failures += 1;
            state.failure_count += 1;
            state.last_failure = Some(now);
            if trial || state.state == CircuitState::HalfOpen {
                state.trial_in_flight = false;
            }

            let should_open = match state.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
                CircuitState::Open => false,
            };
            if should_open {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.generation += 1;
                Some(Transition::Opened)
            } else {
                None
            }
        };

        if let Some(transition) = transition {
            warn!(
                service = %self.service,
                threshold = self.config.failure_threshold,
                recovery_secs = self.config.recovery_timeout_seconds,
                "Circuit breaker opened"
            );
            self.publish(transition);
        }
    }

    fn count_rejection(&self) {
        metrics::counter!("circuit_breaker_rejections_total", "service" => self.service.clone())
            .increment(1);
    }

    fn publish(&self, transition: Transition) {
        let (topic, state) = match transition {
            Transition::Opened => (topics::CIRCUIT_OPENED, CircuitState::Open),
            Transition::Closed => (topics::CIRCUIT_CLOSED, CircuitState::Closed),
        };
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "service" => self.service.clone(),
            "to" => topic
        )
        .increment(1);
        if let Some(events) = &self.events {
            events.emit(topic, json!({ "service": self.service, "state": state }));
        }
    }
}

/// Circuit breaker service managing one breaker per service
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Breaker for `service`, created on first use
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(service, self.config.clone());
                Arc::new(match &self.events {
                    Some(events) => breaker.with_events(events.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.clone())
    }

    /// Reset circuit breaker for service (admin function)
    pub fn reset(&self, service: &str) -> bool {
        match self.get(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Get stats for all circuit breakers, sorted by service
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    pub fn open_circuits(&self) -> Vec<String> {
        self.snapshots()
            .into_iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.service)
            .collect()
    }
}
