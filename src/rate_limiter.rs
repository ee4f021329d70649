use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub const DEFAULT_MAX_REQUESTS: u32 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3_600);

/// Rolling-window request budget for the metered social provider.
///
/// The usage list lives for the process lifetime only. Check and record
/// happen under one lock acquisition in [`try_acquire_many`], which is the
/// only way the resolver consumes budget.
///
/// [`try_acquire_many`]: SlidingWindowLimiter::try_acquire_many
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: u32,
    window: Duration,
    usage: Mutex<VecDeque<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub requests_used: u32,
    pub requests_remaining: u32,
    pub time_until_reset_secs: u64,
    pub can_make_request: bool,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        assert!(max_requests > 0, "Rate limit ceiling must be positive");
        assert!(!window.is_zero(), "Rate window must be non-zero");
        Self {
            max_requests,
            window,
            usage: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn can_proceed(&self) -> bool {
        self.remaining_capacity() > 0
    }

    /// Unconditionally records one request. Callers that have not already
    /// checked capacity should use [`SlidingWindowLimiter::try_acquire`].
    pub fn record_usage(&self) {
        let now = Instant::now();
        let mut usage = self.lock();
        self.purge(&mut usage, now);
        if usage.len() < self.max_requests as usize {
            usage.push_back(now);
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_many(1) == 1
    }

    /// Reserves up to `requested` slots and returns how many were granted.
    pub fn try_acquire_many(&self, requested: usize) -> usize {
        self.try_acquire_many_at(requested, Instant::now())
    }

    pub fn current_usage(&self) -> u32 {
        let mut usage = self.lock();
        self.purge(&mut usage, Instant::now());
        usage.len() as u32
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.max_requests - self.current_usage()
    }

    pub fn time_until_capacity(&self) -> Duration {
        self.time_until_capacity_at(Instant::now())
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut usage = self.lock();
        self.purge(&mut usage, now);
        let used = usage.len() as u32;
        let reset = self.wait_for(&usage, now);
        RateLimitStatus {
            requests_used: used,
            requests_remaining: self.max_requests - used,
            time_until_reset_secs: reset.as_secs(),
            can_make_request: used < self.max_requests,
        }
    }

    fn try_acquire_many_at(&self, requested: usize, now: Instant) -> usize {
        let mut usage = self.lock();
        self.purge(&mut usage, now);
        let available = (self.max_requests as usize).saturating_sub(usage.len());
        let granted = requested.min(available);
        for _ in 0..granted {
            usage.push_back(now);
        }
        assert!(
            usage.len() <= self.max_requests as usize,
            "Rate window exceeded its ceiling"
        );
        granted
    }

    fn time_until_capacity_at(&self, now: Instant) -> Duration {
        let mut usage = self.lock();
        self.purge(&mut usage, now);
        self.wait_for(&usage, now)
    }

    fn wait_for(&self, usage: &VecDeque<Instant>, now: Instant) -> Duration {
        if usage.len() < self.max_requests as usize {
            return Duration::ZERO;
        }
        match usage.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    fn purge(&self, usage: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = usage.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                usage.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // A poisoned lock only means another thread panicked mid-update; the
        // deque itself is always in a consistent state.
        self.usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}
