//! Time source abstraction
//!
//! The device flow and the refresh machinery need three things from time:
//! wall-clock milliseconds for `expiresAt` arithmetic, a monotonic reading for
//! deadlines, and the ability to sleep. Routing all three through `Clock`
//! lets tests drive minutes of polling and backoff without waiting.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

/// Source of wall-clock time, monotonic time and sleeping.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current unix timestamp in milliseconds.
    fn now_millis(&self) -> u64;

    /// Monotonic time elapsed since an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `SystemTime`, `Instant` and `tokio::time::sleep`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for deterministic tests and simulations.
///
/// `sleep` returns immediately after advancing both wall-clock and monotonic
/// time by the requested duration, and records the duration so callers can
/// assert on the exact wait sequence.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    epoch_millis: u64,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Start the clock at the given unix millisecond timestamp.
    pub fn new(epoch_millis: u64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                epoch_millis,
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.elapsed += duration;
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.epoch_millis + state.elapsed.as_millis() as u64
    }

    fn monotonic(&self) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
