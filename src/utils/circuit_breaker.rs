use std::sync::Arc;
use tokio::sync::Mutex;
use std::time::{Duration, Instant};

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards the broker connection. After `failure_threshold` consecutive
// failures the breaker opens and rejects calls without touching the broker;
// after `cool_down` it turns half-open and lets one trial call through at a time.
// `success_threshold` trial successes close it again. A trial whose future
// was dropped counts as abandoned once `cool_down` has passed.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the `circuit_breaker_state` gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub cool_down: Duration,
    /// Trial successes needed to close a half-open circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        if self.state != to {
            tracing::warn!(from = ?self.state, to = ?to, "Circuit breaker state change");
        }
        self.state = to;
        self.successes = 0;
        self.trial_started = None;
        match to {
            CircuitState::Closed => {
                self.failures = 0;
                self.opened_at = None;
            }
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => {}
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Inner>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                trial_started: None,
            })),
            config,
        }
    }

    /// Run `operation` unless the circuit is open
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let cooled = inner
                        .opened_at
                        .map_or(true, |opened| opened.elapsed() >= self.config.cool_down);
                    if !cooled {
                        return Err(CircuitBreakerError::CircuitOpen);
                    }
                    inner.transition(CircuitState::HalfOpen);
                    inner.trial_started = Some(Instant::now());
                }
                CircuitState::HalfOpen => {
                    let in_flight = inner
                        .trial_started
                        .is_some_and(|started| started.elapsed() < self.config.cool_down);
                    if in_flight {
                        return Err(CircuitBreakerError::CircuitOpen);
                    }
                    inner.trial_started = Some(Instant::now());
                }
            }
        }

        let result = operation.await;

        let mut inner = self.inner.lock().await;
        inner.trial_started = None;
        match &result {
            Ok(_) => match inner.state {
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.success_threshold {
                        inner.transition(CircuitState::Closed);
                    }
                }
                _ => inner.failures = 0,
            },
            Err(_) => {
                inner.failures += 1;
                let trip = inner.state == CircuitState::HalfOpen
                    || inner.failures >= self.config.failure_threshold;
                if trip {
                    inner.transition(CircuitState::Open);
                }
            }
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn reset(&self) {
        self.inner.lock().await.transition(CircuitState::Closed);
    }
}
