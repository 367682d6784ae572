use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast until the cool-down elapses
    Open,
    /// Probing whether the model API is back
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: usize,
    /// Cool-down before a probe is allowed
    pub cool_down: Duration,
    /// Consecutive probe successes needed to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 8,
            cool_down: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Fails model calls fast while the provider is clearly down, so a run with
/// hundreds of posts does not spend minutes in retries against a dead API.
///
/// Every post still gets a definite outcome: a refused call is reported as a
/// model failure and flows through the normal fallback path.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerState>>,
    config: CircuitBreakerConfig,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    trips: usize,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trips: 0,
            })),
            config,
        }
    }

    /// Whether a call may proceed. Moves Open -> HalfOpen once the cool-down passed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cool_down)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    /// Returns true when this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.write();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trips += 1;
        }
        trip
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn trips(&self) -> usize {
        self.inner.read().trips
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize, cool_down_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: failures,
            cool_down: Duration::from_millis(cool_down_ms),
            success_threshold: 2,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, 1000);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker(2, 1000);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_after_successes() {
        let breaker = breaker(1, 50);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));

        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 50);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.allow_request());

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.trips(), 2);
    }
}
