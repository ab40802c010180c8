//! Sliding-window request limiter shared by every client drawing on one quota.
//!
//! [`RateLimiter`] keeps the timestamps of admitted requests from the last
//! window (60 seconds by default). Admission is a single locked
//! check-and-record, so concurrent generations can never both observe a free
//! slot and both take it. The limiter never sleeps: callers decide whether to
//! wait out [`RateDecision::Limited`] or surface it as an error.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::OrchestratorConfig;

/// Length of the rate window used by [`RateLimiter::per_minute`].
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Result of [`RateLimiter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A slot was taken; the request may proceed now.
    Allowed,
    /// The window is full. The oldest entry expires after `wait`.
    Limited { wait: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    /// Time until a slot frees up; zero when allowed.
    pub fn wait(&self) -> Duration {
        match self {
            RateDecision::Allowed => Duration::ZERO,
            RateDecision::Limited { wait } => *wait,
        }
    }
}

/// Requests-per-window limiter over a bounded, time-ordered timestamp queue.
///
/// Share one instance via `Arc` between all clients that draw on the same quota.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter admitting at most `limit` requests in any `window`.
    ///
    /// A `limit` of zero is treated as one.
    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1) as usize;
        Self {
            limit,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Limiter admitting at most `requests_per_minute` requests in any 60 seconds.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self::new(requests_per_minute, DEFAULT_WINDOW)
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::per_minute(config.requests_per_minute)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Atomically prune expired entries and, if there is room, record a new one.
    pub fn try_acquire(&self) -> RateDecision {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> RateDecision {
        let mut window = self.lock();
        Self::prune(&mut window, now, self.window);

        if window.len() < self.limit {
            window.push_back(now);
            return RateDecision::Allowed;
        }

        // Full: the front entry is the oldest and expires first.
        let wait = window
            .front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(Duration::ZERO);
        RateDecision::Limited { wait }
    }

    /// Number of admitted requests still inside the window.
    pub fn in_flight_window(&self) -> usize {
        let mut window = self.lock();
        Self::prune(&mut window, Instant::now(), self.window);
        window.len()
    }

    /// Slots available right now.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.in_flight_window())
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) >= length {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        // The queue is always left consistent, so a poisoned lock is still usable.
        self.timestamps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
