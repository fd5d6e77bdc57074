//! Per-capability circuit breakers
//!
//! Each capability name has its own failure-tracking state machine:
//!
//! - **Closed**: calls pass through and consecutive failures are counted.
//! - **Open**: calls are rejected until the recovery timeout has elapsed
//!   since the last failure.
//! - **Half-open**: the next call becomes the single probe; every other call
//!   is rejected until the probe resolves.
//!
//! Admission and outcome recording both happen under one mutex, so two racing
//! callers can never both be admitted as the probe.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit open - requests are rejected
    Open,
    /// Recovery window elapsed or a probe is in flight
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub threshold: u32,
    /// Time after the last failure before a probe is admitted
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of one capability's breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the most recent failure was recorded
    pub last_failure_time: Option<Instant>,
    /// Calls are being rejected
    pub is_open: bool,
    /// A probe has been admitted and not yet resolved
    pub probe_permitted: bool,
}

impl CircuitBreakerState {
    fn closed() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
            is_open: false,
            probe_permitted: false,
        }
    }

    fn recovery_elapsed(&self, recovery_timeout: Duration, now: Instant) -> bool {
        self.last_failure_time
            .map(|t| now.saturating_duration_since(t) >= recovery_timeout)
            .unwrap_or(true)
    }
}

/// How an admitted call ended, from the breaker's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    /// The capability worked
    Success,
    /// The capability failed
    Failure,
    /// Says nothing about capability health
    Neutral,
}

/// Rejection returned while a breaker is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRejection {
    /// Failures counted when the call was rejected
    pub consecutive_failures: u32,
    /// Time until a probe may be admitted; zero while a probe is in flight
    pub retry_after: Duration,
}

/// Registry of breakers keyed by capability name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given tuning
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker tuning
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a capability with a closed breaker
    pub fn reset(&self, name: &str) {
        self.lock()
            .insert(name.to_string(), CircuitBreakerState::closed());
    }

    /// Stop tracking a capability
    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Decide whether a call may proceed
    pub fn admit(&self, name: &str) -> Result<BreakerPermit<'_>, BreakerRejection> {
        let now = Instant::now();
        let mut states = self.lock();
        let state = states
            .entry(name.to_string())
            .or_insert_with(CircuitBreakerState::closed);

        if !state.is_open {
            return Ok(BreakerPermit::new(self, name, false));
        }

        let elapsed = state.recovery_elapsed(self.config.recovery_timeout, now);
        if !state.probe_permitted && elapsed {
            state.probe_permitted = true;
            info!(capability = name, "Circuit half-open; admitting probe");
            return Ok(BreakerPermit::new(self, name, true));
        }

        let retry_after = match (state.probe_permitted, state.last_failure_time) {
            (false, Some(t)) => self
                .config
                .recovery_timeout
                .saturating_sub(now.saturating_duration_since(t)),
            _ => Duration::ZERO,
        };
        Err(BreakerRejection {
            consecutive_failures: state.consecutive_failures,
            retry_after,
        })
    }

    fn resolve(&self, name: &str, probe: bool, outcome: BreakerOutcome) {
        let now = Instant::now();
        let mut states = self.lock();
        let Some(state) = states.get_mut(name) else {
            return;
        };

        if probe {
            state.probe_permitted = false;
        }

        match outcome {
            BreakerOutcome::Neutral => {}
            BreakerOutcome::Success if probe => {
                info!(capability = name, "Probe succeeded; circuit closed");
                *state = CircuitBreakerState::closed();
            }
            BreakerOutcome::Success => {
                if !state.is_open {
                    state.consecutive_failures = 0;
                }
            }
            BreakerOutcome::Failure => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_failure_time = Some(now);
                if probe {
                    warn!(capability = name, "Probe failed; circuit re-opened");
                } else if !state.is_open && state.consecutive_failures >= self.config.threshold {
                    state.is_open = true;
                    warn!(
                        capability = name,
                        failures = state.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
        }
    }

    /// Current breaker data for a capability
    pub fn snapshot(&self, name: &str) -> Option<CircuitBreakerState> {
        self.lock().get(name).copied()
    }

    /// Current state machine position for a capability
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        let now = Instant::now();
        self.snapshot(name).map(|s| {
            if !s.is_open {
                CircuitState::Closed
            } else if s.probe_permitted || s.recovery_elapsed(self.config.recovery_timeout, now) {
                CircuitState::HalfOpen
            } else {
                CircuitState::Open
            }
        })
    }
}

/// Admission to run one call.
///
/// Resolve it with [`BreakerPermit::record`]. A permit dropped unresolved
/// releases its probe slot without touching the counts.
#[must_use = "a permit must be resolved with record()"]
pub struct BreakerPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    name: String,
    probe: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(registry: &'a CircuitBreakerRegistry, name: &str, probe: bool) -> Self {
        Self {
            registry,
            name: name.to_string(),
            probe,
            resolved: false,
        }
    }

    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record how the call ended
    pub fn record(mut self, outcome: BreakerOutcome) {
        self.resolved = true;
        self.registry.resolve(&self.name, self.probe, outcome);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry
                .resolve(&self.name, self.probe, BreakerOutcome::Neutral);
        }
    }
}

#[cfg(test)]
mod circuit_breaker_tests {
    use super::*;

    fn registry(threshold: u32, recovery_secs: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        })
    }

    fn fail(registry: &CircuitBreakerRegistry, name: &str, times: u32) {
        for _ in 0..times {
            registry.admit(name).unwrap().record(BreakerOutcome::Failure);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_isolates_capabilities() {
        let breakers = registry(3, 30);
        fail(&breakers, "x", 2);
        assert_eq!(breakers.state("x"), Some(CircuitState::Closed));

        fail(&breakers, "x", 1);
        assert_eq!(breakers.state("x"), Some(CircuitState::Open));
        let rejection = breakers.admit("x").err().unwrap();
        assert_eq!(rejection.consecutive_failures, 3);
        assert_eq!(rejection.retry_after, Duration::from_secs(30));

        assert!(breakers.admit("y").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failures_while_closed() {
        let breakers = registry(3, 30);
        fail(&breakers, "x", 2);
        breakers.admit("x").unwrap().record(BreakerOutcome::Success);
        assert_eq!(breakers.snapshot("x").unwrap().consecutive_failures, 0);
        fail(&breakers, "x", 2);
        assert_eq!(breakers.state("x"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_probe() {
        let breakers = registry(1, 10);
        fail(&breakers, "x", 1);
        assert!(breakers.admit("x").is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breakers.state("x"), Some(CircuitState::HalfOpen));

        let probe = breakers.admit("x").unwrap();
        assert!(probe.is_probe());
        let second = breakers.admit("x").err().unwrap();
        assert_eq!(second.retry_after, Duration::ZERO);
        assert!(breakers.snapshot("x").unwrap().probe_permitted);

        probe.record(BreakerOutcome::Success);
        assert_eq!(breakers.state("x"), Some(CircuitState::Closed));
        assert!(!breakers.admit("x").unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_window() {
        let breakers = registry(2, 10);
        fail(&breakers, "x", 2);
        tokio::time::advance(Duration::from_secs(10)).await;

        breakers.admit("x").unwrap().record(BreakerOutcome::Failure);
        let snapshot = breakers.snapshot("x").unwrap();
        assert!(snapshot.is_open);
        assert!(!snapshot.probe_permitted);
        assert_eq!(snapshot.consecutive_failures, 3);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breakers.admit("x").is_err());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breakers.admit("x").unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_or_neutral_probe_frees_the_slot() {
        let breakers = registry(1, 1);
        fail(&breakers, "x", 1);
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(breakers.admit("x").unwrap());
        let probe = breakers.admit("x").unwrap();
        assert!(probe.is_probe());
        probe.record(BreakerOutcome::Neutral);

        let snapshot = breakers.snapshot("x").unwrap();
        assert!(snapshot.is_open);
        assert!(!snapshot.probe_permitted);
        assert!(breakers.admit("x").unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn neutral_outcomes_do_not_count() {
        let breakers = registry(2, 30);
        for _ in 0..5 {
            breakers.admit("x").unwrap().record(BreakerOutcome::Neutral);
        }
        assert_eq!(breakers.snapshot("x").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_breaker() {
        let breakers = registry(1, 30);
        fail(&breakers, "x", 1);
        breakers.reset("x");
        assert_eq!(breakers.state("x"), Some(CircuitState::Closed));
        breakers.remove("x");
        assert!(breakers.state("x").is_none());
    }

    #[test]
    fn concurrent_admission_yields_single_probe() {
        let breakers = std::sync::Arc::new(registry(1, 0));
        fail(&breakers, "x", 1);
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breakers = breakers.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let permit = breakers.admit("x");
                    barrier.wait();
                    permit.is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a)
            .count();
        assert_eq!(admitted, 1);
    }
}
