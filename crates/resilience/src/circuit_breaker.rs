/// Circuit Breaker implementation with sliding window error rate tracking
///
/// State transitions:
/// - Closed → Open: when error rate exceeds threshold or consecutive failures reach limit
/// - Open → HalfOpen: after timeout duration
/// - HalfOpen → Closed: when success count reaches threshold
/// - HalfOpen → Open: on any failure
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Testing if service recovered, limited requests allowed
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    pub failure_threshold: u32,
    /// Success count in HalfOpen to close circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub timeout: Duration,
    /// Error rate threshold (0.0 - 1.0) to trigger circuit open
    pub error_rate_threshold: f64,
    /// Sliding window size for error rate calculation
    pub window_size: usize,
    /// Maximum number of requests admitted while `HalfOpen`; any call beyond
    /// this count is rejected with `CircuitBreakerError::Open` until the
    /// circuit closes or reopens. Matches `cb.halfopen_max_requests`.
    pub halfopen_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            error_rate_threshold: 0.5, // 50%
            window_size: 100,
            halfopen_max_requests: 1,
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Arc<RwLock<CircuitBreakerState>>,
}

struct CircuitBreakerState {
    current: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Sliding window: true = success, false = failure
    window: VecDeque<bool>,
    /// Requests admitted since the last transition into `HalfOpen`.
    half_open_admitted: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("Circuit breaker is open - failing fast")]
    Open,
    #[error("Call failed: {0}")]
    CallFailed(String),
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitBreakerState {
                current: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                window: VecDeque::with_capacity(config.window_size),
                half_open_admitted: 0,
            })),
            config,
        }
    }

    /// Execute a future with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        // Fast path: check if circuit is open
        if self.should_reject_call() {
            return Err(CircuitBreakerError::Open);
        }

        // Execute the call
        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::CallFailed(e.to_string()))
            }
        }
    }

    fn should_reject_call(&self) -> bool {
        let mut state = self.state.write();

        match state.current {
            CircuitState::Open => {
                // Check if timeout elapsed, transition to HalfOpen
                if let Some(opened_at) = state.opened_at {
                    if opened_at.elapsed() >= self.config.timeout {
                        info!("Circuit breaker: Open → HalfOpen");
                        state.current = CircuitState::HalfOpen;
                        state.consecutive_successes = 0;
                        state.consecutive_failures = 0;
                        state.half_open_admitted = 1;
                        false
                    } else {
                        true // Still open, reject
                    }
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_admitted >= self.config.halfopen_max_requests {
                    true // Test budget exhausted for this half-open window, reject
                } else {
                    state.half_open_admitted += 1;
                    false
                }
            }
            CircuitState::Closed => false,
        }
    }

    fn record_success(&self) {
        let mut state = self.state.write();

        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        self.add_to_window(&mut state, true);

        if state.current == CircuitState::HalfOpen {
            if state.consecutive_successes >= self.config.success_threshold {
                info!("Circuit breaker: HalfOpen → Closed");
                state.current = CircuitState::Closed;
                state.half_open_admitted = 0;
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.write();

        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        self.add_to_window(&mut state, false);

        match state.current {
            CircuitState::Closed => {
                let error_rate = self.calculate_error_rate(&state);

                if state.consecutive_failures >= self.config.failure_threshold
                    || error_rate >= self.config.error_rate_threshold
                {
                    warn!(
                        "Circuit breaker: Closed → Open (failures: {}, error_rate: {:.2}%)",
                        state.consecutive_failures,
                        error_rate * 100.0
                    );
                    state.current = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker: HalfOpen → Open (test failed)");
                state.current = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.half_open_admitted = 0;
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    fn add_to_window(&self, state: &mut CircuitBreakerState, success: bool) {
        if state.window.len() >= self.config.window_size {
            state.window.pop_front();
        }
        state.window.push_back(success);
    }

    fn calculate_error_rate(&self, state: &CircuitBreakerState) -> f64 {
        if state.window.is_empty() {
            return 0.0;
        }

        let failures = state.window.iter().filter(|&&x| !x).count();
        failures as f64 / state.window.len() as f64
    }

    /// Get current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state.read().current
    }

    /// Get current error rate (for monitoring)
    pub fn error_rate(&self) -> f64 {
        let state = self.state.read();
        self.calculate_error_rate(&state)
    }
}
