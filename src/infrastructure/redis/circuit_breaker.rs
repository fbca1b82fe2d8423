//! Circuit breaker guarding the broker and store connections

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RedisConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through normally
    Closed,
    /// Requests are rejected until the reset timeout elapses
    Open,
    /// A limited number of probe requests are allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Time spent open before probing again
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RedisConfig> for CircuitBreakerConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            success_threshold: config.circuit_breaker_success_threshold.max(1),
            reset_timeout: Duration::from_secs(config.circuit_breaker_reset_timeout_seconds),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    changed_at: Instant,
}

/// Circuit breaker shared by every caller of one backing service.
///
/// Broker and store calls go through `allow_request` first; a run of
/// failures opens the circuit so workers back off instead of hammering
/// a dead dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                changed_at: Instant::now(),
            }),
            config,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker still holds usable counters
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, promoting Open to HalfOpen once the reset timeout passed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.promote(&mut inner);
        inner.state
    }

    fn promote(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner.changed_at.elapsed() >= self.config.reset_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            inner.changed_at = Instant::now();
            tracing::info!("Circuit breaker transitioning to half-open state");
        }
    }

    /// Check if requests should be allowed
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.changed_at = Instant::now();
                    tracing::info!("Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.changed_at = Instant::now();
                    tracing::warn!(
                        failures = inner.failures,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.successes = 0;
                inner.changed_at = Instant::now();
                tracing::warn!("Circuit breaker reopened after failure in half-open state");
            }
            CircuitState::Open => inner.changed_at = Instant::now(),
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.promote(&mut inner);
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failures,
            success_count: inner.successes,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}
