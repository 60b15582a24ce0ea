//! Resilience utilities: bounded retry with jittered exponential backoff, and a
//! small circuit breaker for best-effort side channels.
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use futures::Future;
use tracing::{warn, debug};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use rand::{thread_rng, Rng};

static RETRY_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("forecast_retry_attempts_total", "Total retry attempts executed after a failed first try")
        .expect("register forecast_retry_attempts_total")
});

static RETRY_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("forecast_retry_exhausted_total", "Operations that failed after the last permitted attempt")
        .expect("register forecast_retry_exhausted_total")
});

static CIRCUIT_OPEN: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("forecast_circuit_open_total", "Number of times a circuit transitioned to open")
        .expect("register forecast_circuit_open_total")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResilienceError { #[error("circuit open")] CircuitOpen }

/// Backoff schedule. `max_retries` counts retries after the first attempt, so
/// an operation runs at most `max_retries + 1` times.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 } } }

impl RetryConfig {
    pub fn no_jitter(mut self) -> Self { self.jitter = 0.0; self }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter.min(1.0)) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Retry every error until the budget runs out.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, op: F) -> Result<T, E>
where F: FnMut(usize) -> Fut, Fut: Future<Output = Result<T, E>> {
    retry_if(cfg, op, |_| true).await
}

/// Retry only errors for which `retryable` holds; others return immediately.
pub async fn retry_if<F, Fut, T, E, P>(cfg: &RetryConfig, mut op: F, retryable: P) -> Result<T, E>
where F: FnMut(usize) -> Fut, Fut: Future<Output = Result<T, E>>, P: Fn(&E) -> bool {
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) if attempt >= cfg.max_retries => { RETRY_EXHAUSTED.inc(); return Err(e); }
            Err(_) => {
                let delay = cfg.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
                RETRY_ATTEMPTS.inc();
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState { Closed, Open, HalfOpen }

/// Opens after `failure_threshold` consecutive failures and lets one trial call
/// through once `half_open_after` has elapsed.
pub struct CircuitBreaker {
    state: Mutex<State>,
    half_open_after: Duration,
    failure_threshold: u32,
}

struct State { failures: u32, opened_at: Option<Instant>, trial_in_flight: bool, times_opened: u64 }

/// Releases the half-open trial slot if the trial future is dropped before it settles.
struct TrialGuard<'a> { breaker: &'a CircuitBreaker, armed: bool }

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed { return; }
        let mut st = self.breaker.state.lock();
        if st.trial_in_flight { st.trial_in_flight = false; debug!("half-open trial abandoned"); }
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, half_open_after: Duration) -> Self {
        Self { state: Mutex::new(State { failures: 0, opened_at: None, trial_in_flight: false, times_opened: 0 }), half_open_after, failure_threshold: failure_threshold.max(1) }
    }

    pub fn state(&self) -> BreakerState {
        let st = self.state.lock();
        match st.opened_at {
            None => BreakerState::Closed,
            Some(opened) if opened.elapsed() >= self.half_open_after => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Transitions into the open state, reopens after a failed trial included.
    pub fn times_opened(&self) -> u64 { self.state.lock().times_opened }

    pub fn allow(&self) -> bool { self.admit().is_some() }

    /// `Some(true)` when the caller holds the half-open trial slot.
    fn admit(&self) -> Option<bool> {
        let mut st = self.state.lock();
        match st.opened_at {
            None => Some(false),
            Some(opened) if opened.elapsed() >= self.half_open_after && !st.trial_in_flight => { debug!("half-open trial"); st.trial_in_flight = true; Some(true) }
            Some(_) => None,
        }
    }

    pub fn record_success(&self) { let mut st = self.state.lock(); st.failures = 0; st.opened_at = None; st.trial_in_flight = false; }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        let reopen = st.trial_in_flight;
        if reopen || (st.failures >= self.failure_threshold && st.opened_at.is_none()) {
            st.trial_in_flight = false;
            st.opened_at = Some(Instant::now());
            st.times_opened += 1;
            CIRCUIT_OPEN.inc();
            warn!(failures = st.failures, reopen, "circuit opened");
        }
    }

    /// Run `op` through the breaker. Rejected calls never invoke `op`.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<Result<T, E>, ResilienceError>
    where F: FnOnce() -> Fut, Fut: Future<Output = Result<T, E>> {
        let trial = self.admit().ok_or(ResilienceError::CircuitOpen)?;
        let mut guard = TrialGuard { breaker: self, armed: trial };
        let res = op().await;
        guard.armed = false;
        match &res { Ok(_) => self.record_success(), Err(_) => self.record_failure() }
        Ok(res)
    }
}
