//! Per-backend circuit breaker.
//!
//! One [`Breaker`] per backend, guarded by a `std::sync::Mutex` that is
//! never held across `.await`. The failure bookkeeping lives alongside the
//! router's health-window tracking but is its own explicit state machine
//! with a fixed transition table.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::model::FailureKind;

/// Breaker keeps at most this many recent calls for its failure-rate check.
pub const FAILURE_WINDOW: usize = 20;
const FAILURE_STREAK_WINDOW: Duration = Duration::from_secs(60);
const MIN_SAMPLES_FOR_RATE_CHECK: usize = 5;
const RATE_THRESHOLD: f64 = 0.5;
const BASE_COOLDOWN: Duration = Duration::from_secs(45);
const MAX_COOLDOWN: Duration = Duration::from_secs(720);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// What the Router should do before calling this backend again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    ImmediateRetry,
    LinearBackoff,
    ExponentialBackoff,
    CircuitOpen,
}

fn threshold_for(kind: FailureKind) -> u32 {
    match kind {
        FailureKind::Auth => 3,
        FailureKind::ServerError => 7,
        FailureKind::Connection => 10,
        FailureKind::RateLimit => 3,
        _ => 5,
    }
}

struct Inner {
    state: BreakerState,
    calls: VecDeque<Outcome>,
    streaks: std::collections::HashMap<FailureKindKey, (u32, Instant)>,
    dominant_kind_streak: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    half_open_probe_in_flight: bool,
    last_failure_at: Option<Instant>,
    transitions: std::collections::HashMap<(BreakerState, BreakerState), u64>,
}

fn transition(guard: &mut Inner, from: BreakerState, to: BreakerState) {
    if from == to {
        return;
    }
    *guard.transitions.entry((from, to)).or_insert(0) += 1;
    guard.state = to;
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure(FailureKind),
}

type FailureKindKey = FailureKind;

/// Circuit breaker for one backend.
pub struct Breaker {
    inner: Mutex<Inner>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Breaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                calls: VecDeque::with_capacity(FAILURE_WINDOW),
                streaks: std::collections::HashMap::new(),
                dominant_kind_streak: 0,
                opened_at: None,
                cooldown: BASE_COOLDOWN,
                half_open_probe_in_flight: false,
                last_failure_at: None,
                transitions: std::collections::HashMap::new(),
            }),
        }
    }

    /// Cumulative transition counts since construction, feeding
    /// `breaker_transitions_total{from,to}`.
    pub fn transition_counts(&self) -> Vec<((BreakerState, BreakerState), u64)> {
        let guard = self.inner.lock().expect("breaker mutex poisoned");
        guard.transitions.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Failures currently retained in the sliding window, feeding the
    /// router's availability score component: `min(failures/10, 1)`.
    pub fn failure_count(&self) -> u32 {
        let guard = self.inner.lock().expect("breaker mutex poisoned");
        guard.calls.iter().filter(|c| matches!(c, Outcome::Failure(_))).count() as u32
    }

    /// Time since the last recorded failure, or `None` if this backend has
    /// never failed. Used to decay the availability score once a backend has
    /// been quiet for more than 60 s.
    pub fn since_last_failure(&self) -> Option<Duration> {
        let guard = self.inner.lock().expect("breaker mutex poisoned");
        guard.last_failure_at.map(|t| t.elapsed())
    }

    pub fn state(&self) -> BreakerState {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut guard);
        guard.state
    }

    /// Whether a call may proceed right now. In `half_open`, only one probe
    /// is admitted; subsequent callers are told the circuit is open.
    pub fn admit(&self) -> Result<(), RetryStrategy> {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut guard);
        match guard.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(RetryStrategy::CircuitOpen),
            BreakerState::HalfOpen => {
                if guard.half_open_probe_in_flight {
                    Err(RetryStrategy::CircuitOpen)
                } else {
                    guard.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn maybe_transition_to_half_open(&self, guard: &mut Inner) {
        if guard.state == BreakerState::Open {
            if let Some(opened_at) = guard.opened_at {
                if opened_at.elapsed() >= guard.cooldown {
                    transition(guard, BreakerState::Open, BreakerState::HalfOpen);
                    guard.half_open_probe_in_flight = false;
                }
            }
        }
    }

    pub fn record_success(&self) -> RetryStrategy {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");
        push_bounded(&mut guard.calls, Outcome::Success);
        guard.streaks.clear();
        guard.dominant_kind_streak = 0;
        match guard.state {
            BreakerState::HalfOpen => {
                transition(&mut guard, BreakerState::HalfOpen, BreakerState::Closed);
                guard.opened_at = None;
                guard.cooldown = BASE_COOLDOWN;
                guard.half_open_probe_in_flight = false;
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
        RetryStrategy::ImmediateRetry
    }

    pub fn record_failure(&self, kind: FailureKind) -> RetryStrategy {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");
        push_bounded(&mut guard.calls, Outcome::Failure(kind));

        let now = Instant::now();
        guard.last_failure_at = Some(now);
        let entry = guard.streaks.entry(kind).or_insert((0, now));
        if now.duration_since(entry.1) > FAILURE_STREAK_WINDOW {
            *entry = (1, now);
        } else {
            entry.0 += 1;
        }
        let streak = entry.0;
        let threshold = threshold_for(kind);

        if guard.state == BreakerState::HalfOpen {
            transition(&mut guard, BreakerState::HalfOpen, BreakerState::Open);
            guard.opened_at = Some(now);
            guard.dominant_kind_streak = guard.dominant_kind_streak.saturating_add(1);
            guard.cooldown = adaptive_cooldown(guard.dominant_kind_streak);
            guard.half_open_probe_in_flight = false;
            return RetryStrategy::CircuitOpen;
        }

        let window_failures = guard
            .calls
            .iter()
            .filter(|c| matches!(c, Outcome::Failure(_)))
            .count();
        let rate_tripped =
            guard.calls.len() >= MIN_SAMPLES_FOR_RATE_CHECK && (window_failures as f64 / guard.calls.len() as f64) >= RATE_THRESHOLD;

        if streak >= threshold || rate_tripped {
            transition(&mut guard, BreakerState::Closed, BreakerState::Open);
            guard.opened_at = Some(now);
            guard.dominant_kind_streak = guard.dominant_kind_streak.saturating_add(1);
            guard.cooldown = adaptive_cooldown(guard.dominant_kind_streak);
            return RetryStrategy::CircuitOpen;
        }

        if !kind.retryable() {
            return RetryStrategy::CircuitOpen;
        }
        match kind {
            FailureKind::RateLimit => RetryStrategy::ExponentialBackoff,
            FailureKind::ServerError | FailureKind::Connection => RetryStrategy::LinearBackoff,
            _ => RetryStrategy::ImmediateRetry,
        }
    }

    pub fn record(&self, outcome: Result<(), FailureKind>) -> RetryStrategy {
        match outcome {
            Ok(()) => self.record_success(),
            Err(kind) => self.record_failure(kind),
        }
    }
}

fn push_bounded(calls: &mut VecDeque<Outcome>, outcome: Outcome) {
    if calls.len() == FAILURE_WINDOW {
        calls.pop_front();
    }
    calls.push_back(outcome);
}

/// `base × 2^min(dominantKindStreak-1, 4)`, capped around 720 s.
fn adaptive_cooldown(dominant_kind_streak: u32) -> Duration {
    let exponent = dominant_kind_streak.saturating_sub(1).min(4);
    let multiplier = 2u64.saturating_pow(exponent);
    let scaled = BASE_COOLDOWN.as_secs().saturating_mul(multiplier);
    Duration::from_secs(scaled.min(MAX_COOLDOWN.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = Breaker::new();
        // threshold_for(Other) == 5; four failures should not trip it.
        for _ in 0..4 {
            breaker.record_failure(FailureKind::Other);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_on_auth_streak_of_three() {
        let breaker = Breaker::new();
        breaker.record_failure(FailureKind::Auth);
        breaker.record_failure(FailureKind::Auth);
        let strategy = breaker.record_failure(FailureKind::Auth);
        assert_eq!(strategy, RetryStrategy::CircuitOpen);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn opens_on_fifty_percent_failure_rate_with_minimum_samples() {
        let breaker = Breaker::new();
        // Mixed failure kinds so no single streak crosses its own threshold,
        // but the aggregate rate exceeds 50% over >=5 calls.
        breaker.record_success();
        breaker.record_failure(FailureKind::ClientError);
        breaker.record_success();
        breaker.record_failure(FailureKind::Other);
        let strategy = breaker.record_failure(FailureKind::ClientError);
        assert_eq!(strategy, RetryStrategy::CircuitOpen);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let breaker = Breaker::new();
        for _ in 0..3 {
            breaker.record_failure(FailureKind::Auth);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Force cooldown expiry for the test.
        {
            let mut guard = breaker.inner.lock().unwrap();
            guard.opened_at = Some(Instant::now() - Duration::from_secs(100));
        }
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.admit().is_ok());
        assert!(breaker.admit().is_err());
    }

    #[test]
    fn half_open_success_closes_circuit() {
        let breaker = Breaker::new();
        for _ in 0..3 {
            breaker.record_failure(FailureKind::Auth);
        }
        {
            let mut guard = breaker.inner.lock().unwrap();
            guard.opened_at = Some(Instant::now() - Duration::from_secs(100));
            guard.state = BreakerState::HalfOpen;
        }
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_grows_cooldown() {
        let breaker = Breaker::new();
        for _ in 0..3 {
            breaker.record_failure(FailureKind::Auth);
        }
        let first_cooldown = breaker.inner.lock().unwrap().cooldown;
        {
            let mut guard = breaker.inner.lock().unwrap();
            guard.opened_at = Some(Instant::now() - Duration::from_secs(100));
            guard.state = BreakerState::HalfOpen;
        }
        breaker.record_failure(FailureKind::Auth);
        let second_cooldown = breaker.inner.lock().unwrap().cooldown;
        assert!(second_cooldown > first_cooldown);
    }

    #[test]
    fn cooldown_caps_near_720_seconds() {
        assert_eq!(adaptive_cooldown(1), Duration::from_secs(45));
        assert_eq!(adaptive_cooldown(10), MAX_COOLDOWN);
    }

    #[test]
    fn failure_count_reflects_window_and_since_last_failure_is_none_when_untouched() {
        let breaker = Breaker::new();
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.since_last_failure().is_none());

        breaker.record_failure(FailureKind::Other);
        assert_eq!(breaker.failure_count(), 1);
        assert!(breaker.since_last_failure().unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn transition_counts_record_closed_to_open() {
        let breaker = Breaker::new();
        for _ in 0..3 {
            breaker.record_failure(FailureKind::Auth);
        }
        let counts = breaker.transition_counts();
        assert_eq!(counts.iter().find(|(k, _)| *k == (BreakerState::Closed, BreakerState::Open)).map(|(_, v)| *v), Some(1));
    }

    #[test]
    fn non_retryable_kind_recommends_circuit_open_strategy_without_tripping_breaker() {
        let breaker = Breaker::new();
        let strategy = breaker.record_failure(FailureKind::Auth);
        assert_eq!(strategy, RetryStrategy::CircuitOpen);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
