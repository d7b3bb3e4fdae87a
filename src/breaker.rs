//! Circuit Breaker (C3): per-host and per-resource failure suppression with
//! cooldown.
//!
//! A `ServerTracker`-style per-key success/failure record, re-expressed as
//! an explicit `closed/open/half-open` state machine stored in a `DashMap`,
//! matching the `DashMap` + atomic counters concurrency style already used
//! in `net::rate_limiter` rather than introducing a new primitive.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, instrument, warn};

/// Which breaker instance a scope belongs to, carried in
/// [`crate::error::EngineError::CircuitOpen`] for the `error-notification`
/// event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerScope {
    /// Keyed by URL host.
    Host(String),
    /// Keyed by download id.
    Resource(String),
}

impl fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(host) => write!(f, "host:{host}"),
            Self::Resource(id) => write!(f, "resource:{id}"),
        }
    }
}

/// Breaker state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Record {
    state: std::sync::Mutex<BreakerState>,
    failure_count: AtomicU32,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicU32,
}

impl Record {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(BreakerState::Closed),
            failure_count: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_in_flight: AtomicU32::new(0),
        }
    }
}

/// Configuration shared by every key tracked in a [`CircuitBreaker`] instance.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// One breaker instance (either the per-host or per-resource table).
///
/// State machine: `closed` → on `failure_count >= threshold` → `open`. While
/// open and within `open_duration`, every request fails fast. Past the
/// cooldown, the first request transitions to `half-open` and allows up to
/// `half_open_probes` concurrent probes; the first success closes and resets
/// counts, any failure reopens with a fresh `opened_at`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    records: Arc<DashMap<String, Record>>,
    start: std::time::Instant,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: Arc::new(DashMap::new()),
            start: std::time::Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns `true` if a request for `key` is currently allowed through.
    /// Transitions `open` → `half-open` on the first call past the cooldown.
    #[instrument(skip(self))]
    pub fn allow(&self, key: &str) -> bool {
        let record = self.records.entry(key.to_string()).or_insert_with(Record::new);
        let mut state = record.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = record.opened_at_millis.load(Ordering::Acquire);
                let elapsed_ms = self.now_millis().saturating_sub(opened_at);
                if elapsed_ms >= u64::try_from(self.config.open_duration.as_millis()).unwrap_or(u64::MAX) {
                    *state = BreakerState::HalfOpen;
                    record.half_open_in_flight.store(0, Ordering::Release);
                    debug!(key, "breaker cooldown elapsed, entering half-open");
                    drop(state);
                    self.try_admit_half_open(&record)
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                drop(state);
                self.try_admit_half_open(&record)
            }
        }
    }

    fn try_admit_half_open(&self, record: &Record) -> bool {
        let current = record.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
        if current < self.config.half_open_probes {
            true
        } else {
            record.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Records a successful request for `key`. In `half-open`, the first
    /// success closes the breaker and resets its failure count.
    #[instrument(skip(self))]
    pub fn record_success(&self, key: &str) {
        let Some(record) = self.records.get(key) else {
            return;
        };
        let mut state = record.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(*state, BreakerState::HalfOpen | BreakerState::Open) {
            *state = BreakerState::Closed;
            record.failure_count.store(0, Ordering::Release);
            record.half_open_in_flight.store(0, Ordering::Release);
            debug!(key, "breaker closed after successful probe");
        }
    }

    /// Records a failed request for `key`. Opens the breaker once
    /// `failure_threshold` consecutive failures accrue, or immediately
    /// reopens (with a fresh `opened_at`) if the failure occurred while
    /// `half-open`.
    #[instrument(skip(self))]
    pub fn record_failure(&self, key: &str) {
        let record = self.records.entry(key.to_string()).or_insert_with(Record::new);
        let mut state = record.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match *state {
            BreakerState::HalfOpen => {
                *state = BreakerState::Open;
                record.opened_at_millis.store(self.now_millis(), Ordering::Release);
                record.half_open_in_flight.store(0, Ordering::Release);
                warn!(key, "breaker reopened after half-open probe failure");
            }
            BreakerState::Closed => {
                let failures = record.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    *state = BreakerState::Open;
                    record.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    warn!(key, failures, "breaker opened");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state for `key`, or `closed` if never recorded.
    #[must_use]
    pub fn state(&self, key: &str) -> BreakerState {
        self.records
            .get(key)
            .map(|r| *r.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
            .unwrap_or(BreakerState::Closed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(0),
            half_open_probes: 1,
        }
    }

    #[test]
    fn test_closed_by_default() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(breaker.state("example.com"), BreakerState::Closed);
        assert!(breaker.allow("example.com"));
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("host");
        breaker.record_failure("host");
        assert_eq!(breaker.state("host"), BreakerState::Closed);
        breaker.record_failure("host");
        assert_eq!(breaker.state("host"), BreakerState::Open);
    }

    #[test]
    fn test_open_rejects_until_cooldown_elapses() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(3600),
            half_open_probes: 1,
        });
        breaker.record_failure("host");
        assert!(!breaker.allow("host"));
    }

    #[test]
    fn test_half_open_success_closes_and_resets() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("host");
        breaker.record_failure("host");
        breaker.record_failure("host");
        assert_eq!(breaker.state("host"), BreakerState::Open);

        assert!(breaker.allow("host"));
        assert_eq!(breaker.state("host"), BreakerState::HalfOpen);

        breaker.record_success("host");
        assert_eq!(breaker.state("host"), BreakerState::Closed);

        breaker.record_failure("host");
        breaker.record_failure("host");
        assert_eq!(breaker.state("host"), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("host");
        breaker.record_failure("host");
        breaker.record_failure("host");
        assert!(breaker.allow("host"));
        assert_eq!(breaker.state("host"), BreakerState::HalfOpen);

        breaker.record_failure("host");
        assert_eq!(breaker.state("host"), BreakerState::Open);
    }

    #[test]
    fn test_half_open_admits_bounded_probes() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_millis(0),
            half_open_probes: 2,
        });
        breaker.record_failure("host");
        assert!(breaker.allow("host"));
        assert!(breaker.allow("host"));
        assert!(!breaker.allow("host"));
    }

    #[test]
    fn test_keys_are_independent() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("host-a");
        breaker.record_failure("host-a");
        breaker.record_failure("host-a");
        assert_eq!(breaker.state("host-a"), BreakerState::Open);
        assert_eq!(breaker.state("host-b"), BreakerState::Closed);
        assert!(breaker.allow("host-b"));
    }

    #[test]
    fn test_breaker_scope_display() {
        assert_eq!(BreakerScope::Host("x.com".to_string()).to_string(), "host:x.com");
        assert_eq!(BreakerScope::Resource("dl-1".to_string()).to_string(), "resource:dl-1");
    }
}
