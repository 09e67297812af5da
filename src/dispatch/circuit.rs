//! Per-target circuit breakers.
//!
//! Each logical target (e.g. `POST /tasks` on one host) gets its own state
//! behind its own mutex, so a failing endpoint never blocks calls to an
//! unrelated one and concurrent failures on the same endpoint are never lost.
//!
//! # States
//!
//! - **Closed**: calls pass; failures increment the counter, a success zeroes it
//! - **Open**: reached after `threshold` failures; calls are rejected with
//!   [`AgentError::CircuitOpen`] until the recovery interval has elapsed
//! - **HalfOpen**: exactly one probe call is admitted; success closes the
//!   circuit, failure reopens it and restarts the recovery timer

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::AgentError;

/// Time source for breaker transitions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. For deterministic breaker tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time copy of one target's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub failure_count: u32,
    pub state: CircuitState,
    /// Set only while `state == Open`.
    pub opened_at: Option<Instant>,
}

/// Why a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal call.
    Pass,
    /// The single recovery probe of a half-open circuit.
    Probe,
}

#[derive(Debug)]
struct TargetCircuit {
    failure_count: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
    /// When the outstanding half-open probe was admitted.
    probe_started: Option<Instant>,
}

impl TargetCircuit {
    fn closed() -> Self {
        Self {
            failure_count: 0,
            state: CircuitState::Closed,
            opened_at: None,
            probe_started: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_started = None;
    }
}

/// Breaker state for every target seen by one client. Created with the client
/// and dropped with it.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    recovery_time: Duration,
    clock: Arc<dyn Clock>,
    targets: RwLock<HashMap<String, Arc<Mutex<TargetCircuit>>>>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let targets = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("CircuitBreakerRegistry")
            .field("threshold", &self.threshold)
            .field("recovery_time", &self.recovery_time)
            .field("targets", &targets)
            .finish()
    }
}

impl CircuitBreakerRegistry {
    /// `threshold` below 1 is raised to 1.
    pub fn new(threshold: u32, recovery_time: Duration) -> Self {
        Self::with_clock(threshold, recovery_time, Arc::new(SystemClock))
    }

    pub fn with_clock(threshold: u32, recovery_time: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery_time,
            clock,
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_recovery_time,
        )
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn recovery_time(&self) -> Duration {
        self.recovery_time
    }

    fn entry(&self, target: &str) -> Arc<Mutex<TargetCircuit>> {
        if let Some(existing) = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
        {
            return existing.clone();
        }

        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        targets
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TargetCircuit::closed())))
            .clone()
    }

    /// Decide whether a call to `target` may proceed. Never blocks on I/O.
    pub fn admit(&self, target: &str) -> Result<Admission, AgentError> {
        let entry = self.entry(target);
        let mut circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let state = circuit.state;
        let probe_started = circuit.probe_started;

        match state {
            CircuitState::Closed => Ok(Admission::Pass),
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.recovery_time {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.opened_at = None;
                    circuit.probe_started = Some(now);
                    tracing::info!(circuit = target, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(AgentError::CircuitOpen {
                        target: target.to_string(),
                        retry_after_ms: millis(self.recovery_time - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => match probe_started {
                // A probe whose outcome never arrived (caller dropped mid-flight)
                // is abandoned after one recovery interval.
                Some(started) if now.saturating_duration_since(started) < self.recovery_time => {
                    Err(AgentError::CircuitOpen {
                        target: target.to_string(),
                        retry_after_ms: millis(
                            self.recovery_time - now.saturating_duration_since(started),
                        ),
                    })
                }
                _ => {
                    circuit.probe_started = Some(now);
                    Ok(Admission::Probe)
                }
            },
        }
    }

    pub fn record_success(&self, target: &str) {
        let entry = self.entry(target);
        let mut circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if circuit.state != CircuitState::Closed {
            tracing::info!(circuit = target, "circuit closed after successful probe");
        }
        *circuit = TargetCircuit::closed();
    }

    pub fn record_failure(&self, target: &str) {
        let entry = self.entry(target);
        let mut circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        circuit.failure_count = circuit.failure_count.saturating_add(1);
        let state = circuit.state;

        match state {
            CircuitState::Closed if circuit.failure_count >= self.threshold => {
                circuit.open(now);
                tracing::warn!(
                    circuit = target,
                    failures = circuit.failure_count,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                circuit.open(now);
                tracing::warn!(
                    circuit = target,
                    failures = circuit.failure_count,
                    "probe failed, circuit reopened"
                );
            }
            // Late failures from calls admitted before the circuit opened do
            // not extend the recovery window.
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self, target: &str) -> CircuitSnapshot {
        let existing = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned();

        match existing {
            Some(entry) => {
                let circuit = entry.lock().unwrap_or_else(PoisonError::into_inner);
                CircuitSnapshot {
                    failure_count: circuit.failure_count,
                    state: circuit.state,
                    opened_at: circuit.opened_at,
                }
            }
            None => CircuitSnapshot {
                failure_count: 0,
                state: CircuitState::Closed,
                opened_at: None,
            },
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "POST /tasks";

    fn registry(threshold: u32) -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let reg = CircuitBreakerRegistry::with_clock(threshold, Duration::from_secs(30), clock.clone());
        (reg, clock)
    }

    #[test]
    fn unknown_target_is_closed() {
        let (reg, _) = registry(3);
        let snap = reg.snapshot(TARGET);
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(reg.admit(TARGET).unwrap(), Admission::Pass);
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let (reg, _) = registry(3);
        reg.record_failure(TARGET);
        reg.record_failure(TARGET);
        assert!(reg.admit(TARGET).is_ok());
        reg.record_failure(TARGET);

        let snap = reg.snapshot(TARGET);
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.opened_at.is_some());
        match reg.admit(TARGET) {
            Err(AgentError::CircuitOpen { retry_after_ms, .. }) => {
                assert_eq!(retry_after_ms, 30_000)
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn success_while_closed_resets_counter() {
        let (reg, _) = registry(3);
        reg.record_failure(TARGET);
        reg.record_failure(TARGET);
        reg.record_success(TARGET);
        assert_eq!(reg.snapshot(TARGET).failure_count, 0);
        reg.record_failure(TARGET);
        reg.record_failure(TARGET);
        assert_eq!(reg.snapshot(TARGET).state, CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let (reg, clock) = registry(2);
        reg.record_failure(TARGET);
        reg.record_failure(TARGET);

        clock.advance(Duration::from_secs(29));
        assert!(reg.admit(TARGET).is_err());

        clock.advance(Duration::from_secs(1));
        assert_eq!(reg.admit(TARGET).unwrap(), Admission::Probe);
        assert_eq!(reg.snapshot(TARGET).state, CircuitState::HalfOpen);
        assert!(matches!(
            reg.admit(TARGET),
            Err(AgentError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn probe_success_closes_and_zeroes() {
        let (reg, clock) = registry(1);
        reg.record_failure(TARGET);
        clock.advance(Duration::from_secs(30));
        reg.admit(TARGET).unwrap();
        reg.record_success(TARGET);

        let snap = reg.snapshot(TARGET);
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.opened_at, None);
        assert_eq!(reg.admit(TARGET).unwrap(), Admission::Pass);
    }

    #[test]
    fn probe_failure_reopens_with_fresh_timer() {
        let (reg, clock) = registry(1);
        reg.record_failure(TARGET);
        clock.advance(Duration::from_secs(45));
        reg.admit(TARGET).unwrap();
        reg.record_failure(TARGET);

        assert_eq!(reg.snapshot(TARGET).state, CircuitState::Open);
        clock.advance(Duration::from_secs(20));
        assert!(reg.admit(TARGET).is_err());
        clock.advance(Duration::from_secs(10));
        assert_eq!(reg.admit(TARGET).unwrap(), Admission::Probe);
    }

    #[test]
    fn abandoned_probe_is_replaced_after_recovery_interval() {
        let (reg, clock) = registry(1);
        reg.record_failure(TARGET);
        clock.advance(Duration::from_secs(30));
        reg.admit(TARGET).unwrap();
        // probe never reports back
        clock.advance(Duration::from_secs(30));
        assert_eq!(reg.admit(TARGET).unwrap(), Admission::Probe);
    }

    #[test]
    fn targets_are_isolated() {
        let (reg, _) = registry(1);
        reg.record_failure(TARGET);
        assert!(reg.admit(TARGET).is_err());
        assert_eq!(reg.admit("GET /tasks/{task_id}").unwrap(), Admission::Pass);
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let reg = CircuitBreakerRegistry::new(0, Duration::from_secs(1));
        assert_eq!(reg.threshold(), 1);
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let reg = Arc::new(CircuitBreakerRegistry::new(10_000, Duration::from_secs(60)));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        reg.record_failure(TARGET);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.snapshot(TARGET).failure_count, 64 * 25);
    }
}
