use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Dispatch state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    #[serde(with = "crate::config::duration_ms", rename = "cooldown_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-source breaker counting consecutive transient failures.
///
/// While open, dispatch to the source is suspended; after the cooldown a
/// single probe is admitted and its outcome closes or reopens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    /// Admits one dispatch. In half-open state only one probe is admitted
    /// until its outcome is recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit closed after successful probe");
        }
        *inner = CircuitInner::default();
    }

    /// Counts a transient failure. Non-transient outcomes should call
    /// [`CircuitBreaker::record_neutral`] instead.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        if inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold
        {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "circuit opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Releases a half-open probe whose outcome says nothing about upstream health.
    pub fn record_neutral(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time left before a probe may be admitted; zero unless open.
    pub fn remaining_cooldown(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.cooldown.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
