// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Rate Limit State
//!
//! Fixed-window counter with a secondary burst allowance. The burst window is
//! half the primary window. Counters only reset when a window boundary is
//! crossed; the boundary then advances by whole windows so that it stays
//! aligned with the original start.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub burst_limit: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(limit: u64, burst_limit: u64, window: Duration) -> Self {
        Self {
            limit,
            burst_limit,
            window,
        }
    }

    pub fn burst_window(&self) -> Duration {
        self.window / 2
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(60, 120, Duration::from_secs(60))
    }
}

/// Outcome of a check. Rejections are values carrying `retry_after`, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub burst_remaining: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde::option")]
    pub retry_after: Option<Duration>,
    #[serde(default)]
    pub used_burst: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: u64,
    pub burst_limit: u64,
    pub window: Duration,
    pub current: u64,
    pub burst_current: u64,
    pub reset_time: Instant,
    pub burst_reset_time: Instant,
    pub violations: u64,
}

fn next_boundary(boundary: Instant, window: Duration, now: Instant) -> Instant {
    if now < boundary || window.is_zero() {
        return boundary;
    }
    let elapsed = now.duration_since(boundary).as_nanos();
    let windows = elapsed / window.as_nanos() + 1;
    let advance = window.as_nanos().saturating_mul(windows);
    boundary + Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX))
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            limit: config.limit,
            burst_limit: config.burst_limit,
            window: config.window,
            current: 0,
            burst_current: 0,
            reset_time: now + config.window,
            burst_reset_time: now + config.window / 2,
            violations: 0,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.limit, self.burst_limit, self.window)
    }

    fn roll_windows(&mut self, now: Instant) {
        if now >= self.reset_time {
            self.current = 0;
            self.reset_time = next_boundary(self.reset_time, self.window, now);
        }
        if now >= self.burst_reset_time {
            self.burst_current = 0;
            self.burst_reset_time = next_boundary(self.burst_reset_time, self.window / 2, now);
        }
    }

    fn retry_after(&self, now: Instant) -> Duration {
        let to_reset = self.reset_time.saturating_duration_since(now);
        let to_burst = self.burst_reset_time.saturating_duration_since(now);
        to_reset.min(to_burst)
    }

    /// Admit `count` units if the primary or burst allowance has room.
    /// `count == 0` is a pure read.
    pub fn check(&mut self, count: u64, now: Instant) -> RateLimitResult {
        if count == 0 {
            return self.peek(now);
        }

        self.roll_windows(now);

        if self.current.saturating_add(count) <= self.limit {
            self.current += count;
            return RateLimitResult {
                allowed: true,
                remaining: self.limit - self.current,
                burst_remaining: self.burst_limit.saturating_sub(self.burst_current),
                retry_after: None,
                used_burst: false,
            };
        }

        if self.burst_current.saturating_add(count) <= self.burst_limit {
            self.burst_current += count;
            return RateLimitResult {
                allowed: true,
                remaining: self.limit.saturating_sub(self.current),
                burst_remaining: self.burst_limit - self.burst_current,
                retry_after: None,
                used_burst: true,
            };
        }

        self.violations = self.violations.saturating_add(1);
        RateLimitResult {
            allowed: false,
            remaining: self.limit.saturating_sub(self.current),
            burst_remaining: self.burst_limit.saturating_sub(self.burst_current),
            retry_after: Some(self.retry_after(now)),
            used_burst: false,
        }
    }

    /// Current allowance as of `now`, without touching the state.
    pub fn peek(&self, now: Instant) -> RateLimitResult {
        let mut view = self.clone();
        view.roll_windows(now);
        let exhausted = view.current >= view.limit && view.burst_current >= view.burst_limit;
        RateLimitResult {
            allowed: true,
            remaining: view.limit.saturating_sub(view.current),
            burst_remaining: view.burst_limit.saturating_sub(view.burst_current),
            retry_after: exhausted.then(|| view.retry_after(now)),
            used_burst: false,
        }
    }

    /// Apply new limits without resetting counters. Counters above a lowered
    /// limit are clamped so they never exceed it.
    pub fn update_limit(&mut self, config: RateLimitConfig) {
        self.limit = config.limit;
        self.burst_limit = config.burst_limit;
        self.window = config.window;
        self.current = self.current.min(self.limit);
        self.burst_current = self.burst_current.min(self.burst_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight() -> RateLimitConfig {
        RateLimitConfig::new(5, 10, Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_then_burst() {
        let now = Instant::now();
        let mut state = RateLimitState::new(tight(), now);

        let remaining: Vec<u64> = (0..5).map(|_| state.check(1, now).remaining).collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let sixth = state.check(1, now);
        assert!(sixth.allowed);
        assert!(sixth.used_burst);
        assert_eq!(sixth.burst_remaining, 9);
        assert!(state.current <= state.limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_counts_violation_and_reports_retry_after() {
        let now = Instant::now();
        let mut state = RateLimitState::new(RateLimitConfig::new(1, 1, Duration::from_millis(1000)), now);
        assert!(state.check(1, now).allowed);
        assert!(state.check(1, now).allowed);

        let later = now + Duration::from_millis(100);
        let rejected = state.check(1, later);
        assert!(!rejected.allowed);
        assert_eq!(state.violations, 1);
        // burst window is 500ms, so the burst boundary comes first
        assert_eq!(rejected.retry_after, Some(Duration::from_millis(400)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_count_is_read_only() {
        let now = Instant::now();
        let mut state = RateLimitState::new(tight(), now);
        state.check(3, now);

        let before = state.clone();
        let result = state.check(0, now + Duration::from_secs(5));
        assert_eq!(state, before);
        assert_eq!(result.remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_advances_whole_windows() {
        let start = Instant::now();
        let mut state = RateLimitState::new(tight(), start);
        state.check(5, start);

        let now = start + Duration::from_millis(2500);
        let result = state.check(1, now);
        assert!(result.allowed);
        assert!(!result.used_burst);
        assert_eq!(state.current, 1);
        assert_eq!(state.reset_time, start + Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_limit_keeps_counters() {
        let now = Instant::now();
        let mut state = RateLimitState::new(tight(), now);
        state.check(4, now);

        state.update_limit(RateLimitConfig::new(10, 10, Duration::from_millis(1000)));
        assert_eq!(state.current, 4);

        state.update_limit(RateLimitConfig::new(2, 10, Duration::from_millis(1000)));
        assert_eq!(state.current, 2);
    }
}
