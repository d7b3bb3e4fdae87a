//! Timer Service (A4): the single place tasks consult for delays, replacing
//! the scattered ad-hoc timers and debounces the source system used for
//! backoff, breaker cooldown, and progress flush.
//!
//! `tokio::time` is already virtual-clock capable via `tokio::time::pause()`,
//! so this service does not reimplement a clock; it centralizes the two
//! shapes every caller in this crate needs — a plain delay and a coalescing
//! debounce — so swapping the underlying primitive later touches one file.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Centralized timer handle. Cheap to clone; stateless beyond what
/// `tokio::time` already tracks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerService;

impl TimerService {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Sleeps for `duration`. Used by backoff and breaker cooldown waits.
    #[instrument(skip(self))]
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Returns a ticking interval, used by the Progress Aggregator's flush
    /// loop.
    #[must_use]
    pub fn interval(&self, period: Duration) -> tokio::time::Interval {
        tokio::time::interval(period)
    }

    /// Creates a new coalescing debouncer with the given delay.
    #[must_use]
    pub fn debouncer(&self, delay: Duration) -> Debouncer {
        Debouncer::new(delay)
    }
}

/// Coalesces rapid-fire triggers into a single delayed action: each call to
/// [`Debouncer::trigger`] cancels any pending delayed action and schedules a
/// new one `delay` out. Used by the Queue Scheduler to collapse a burst of
/// progress events into one admission sweep (~100ms).
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Debouncer {
    #[must_use]
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedules `action` to run after `delay`, cancelling any action
    /// previously scheduled by this debouncer that has not yet fired.
    pub async fn trigger<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.delay;
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        }));
    }
}
