//! Request pacing.
//!
//! Each request reserves the next free slot; slots are `min_interval` apart,
//! so any number of callers sharing one limiter never exceed the quota.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Shared slot-reservation rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// `quota` requests spread evenly over `window`.
    pub fn per_window(quota: u32, window: Duration) -> Self {
        Self::new(window / quota.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Reserve a slot, returning how long the caller must wait for it.
    fn reserve(&self) -> Duration {
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = next.map_or(now, |n| n.max(now));
        *next = Some(slot + self.min_interval);
        slot.saturating_duration_since(now)
    }

    /// Block until this caller may issue a request.
    pub fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "pacing request");
            std::thread::sleep(wait);
        }
    }

    /// Push every future slot back by `pause`, e.g. after the provider
    /// signalled throttling.
    pub fn defer(&self, pause: Duration) {
        if pause.is_zero() {
            return;
        }
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let base = next.map_or(now, |n| n.max(now));
        *next = Some(base + pause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert_eq!(limiter.reserve(), Duration::ZERO);
    }

    #[test]
    fn consecutive_reservations_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        limiter.reserve();
        let second = limiter.reserve();
        let third = limiter.reserve();
        assert!(second > Duration::from_secs(9));
        assert!(third > Duration::from_secs(19));
    }

    #[test]
    fn defer_adds_cooldown() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        limiter.reserve();
        limiter.defer(Duration::from_secs(20));
        assert!(limiter.reserve() > Duration::from_secs(29));
    }

    #[test]
    fn per_window_divides_evenly() {
        let limiter = RateLimiter::per_window(500, Duration::from_secs(86_400));
        assert_eq!(limiter.min_interval(), Duration::from_millis(172_800));
    }

    #[test]
    fn zero_interval_never_waits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        for _ in 0..10 {
            assert_eq!(limiter.reserve(), Duration::ZERO);
        }
    }
}
