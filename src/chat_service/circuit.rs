//! Process-local circuit breaker for upstream-wide incidents.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
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

/// Admission token for one request. `probe` marks the single half-open
/// trial request; its holder must report back via `on_success`,
/// `on_terminal_failure`, or `on_probe_abandoned`.
#[derive(Debug, Clone, Copy)]
pub struct RequestPermit {
    pub probe: bool,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Terminal-failure timestamps inside the rolling window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Fails fast when the upstream is globally unhealthy.
///
/// Opens after `failure_threshold` terminal failures within `window`; stays
/// open for `recovery_timeout`, then admits exactly one probe request. The
/// probe's result decides between closing and re-opening with a fresh timer.
/// State is process-local and never persisted.
pub struct CircuitBreaker {
    failure_threshold: u32,
    window: Duration,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, window: Duration, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            window,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn from_config(config: &crate::config::ResilienceConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_window_seconds),
            Duration::from_secs(config.circuit_recovery_timeout_seconds),
        )
    }

    /// Whether a request may proceed. Open circuits short-circuit in O(1);
    /// once the recovery timeout elapses a single half-open probe is let
    /// through.
    pub fn allow_request(&self) -> Option<RequestPermit> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Some(RequestPermit { probe: false }),
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    info!("Circuit transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Some(RequestPermit { probe: true })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(RequestPermit { probe: true })
                }
            }
        }
    }

    /// The probe ended without an upstream health verdict (capacity failure
    /// or caller cancellation); free the half-open slot for the next caller.
    pub fn on_probe_abandoned(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Record a request that reached the upstream and got an answer.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        if inner.state == CircuitState::HalfOpen {
            info!("Circuit probe succeeded, closing");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
        inner.probe_in_flight = false;
        inner.failures.clear();
    }

    /// Record a terminal failure (a request that exhausted all retries).
    pub fn on_terminal_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        let now = Instant::now();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("Circuit probe failed, re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                inner.failures.clear();
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window = self.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|at| now.duration_since(*at) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() as u32 >= self.failure_threshold {
                    warn!(
                        failures = inner.failures.len(),
                        "Circuit failure threshold reached, opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock poisoned")
            .state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(threshold, Duration::from_secs(60), recovery)
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let cb = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            assert!(cb.allow_request().is_some());
            cb.on_terminal_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_some());
    }

    #[test]
    fn test_opens_at_threshold_and_short_circuits() {
        let cb = breaker(5, Duration::from_secs(60));
        for _ in 0..5 {
            cb.on_terminal_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow_request().is_none());
        assert!(cb.allow_request().is_none());
    }

    #[test]
    fn test_success_resets_failure_window() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.on_terminal_failure();
        cb.on_terminal_failure();
        cb.on_success();
        cb.on_terminal_failure();
        cb.on_terminal_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.on_terminal_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.allow_request().is_none());

        std::thread::sleep(Duration::from_millis(30));
        // First request after the recovery timeout becomes the probe
        assert!(cb.allow_request().is_some());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Concurrent requests are still rejected while the probe runs
        assert!(cb.allow_request().is_none());
    }

    #[test]
    fn test_probe_success_closes() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.on_terminal_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request().is_some());
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request().is_some());
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_timer() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.on_terminal_failure();
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow_request().is_some());
        cb.on_terminal_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Timer restarted: still rejecting right away
        assert!(cb.allow_request().is_none());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow_request().is_some());
    }

    #[test]
    fn test_old_failures_age_out_of_window() {
        let cb = CircuitBreaker::new(3, Duration::from_millis(40), Duration::from_secs(60));
        cb.on_terminal_failure();
        cb.on_terminal_failure();
        std::thread::sleep(Duration::from_millis(50));
        cb.on_terminal_failure();
        // The first two fell out of the window, so only one failure counts
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
