// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Rate Limiter
//!
//! Process-wide limiter keyed by `(resource, identifier)`. Each key owns a
//! [`RateLimitState`]; the check-then-increment runs while holding that key's
//! map entry, so concurrent checks on one key serialize and checks on other
//! keys do not contend.
//!
//! Rejections are returned as [`RateLimitResult`] values with `retry_after`
//! set and additionally published as `rate_limit.violated`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::config::RateLimitsConfig;
use crate::domain::context::Tier;
use crate::domain::events::{event_types, EventPublisher};
use crate::domain::rate_limit::{RateLimitConfig, RateLimitResult, RateLimitState};

type LimitKey = (String, Option<String>);

/// Read-only view of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub burst_limit: u64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub current: u64,
    pub burst_current: u64,
    pub remaining: u64,
    pub burst_remaining: u64,
    pub violations: u64,
}

pub struct RateLimiter {
    states: DashMap<LimitKey, RateLimitState>,
    configs: DashMap<String, RateLimitConfig>,
    default: RwLock<RateLimitConfig>,
    events: Arc<dyn EventPublisher>,
}

impl RateLimiter {
    pub fn new(default: RateLimitConfig, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            states: DashMap::new(),
            configs: DashMap::new(),
            default: RwLock::new(default),
            events,
        }
    }

    pub fn from_config(config: &RateLimitsConfig, events: Arc<dyn EventPublisher>) -> Self {
        let limiter = Self::new(config.default, events);
        for (resource, limit) in &config.resources {
            limiter.configs.insert(resource.clone(), *limit);
        }
        limiter
    }

    fn config_for(&self, resource: &str) -> RateLimitConfig {
        self.configs
            .get(resource)
            .map(|c| *c)
            .unwrap_or_else(|| *self.default.read())
    }

    fn key(resource: &str, identifier: Option<&str>) -> LimitKey {
        (resource.to_string(), identifier.map(str::to_string))
    }

    /// Admit `count` units against `resource` (optionally per identifier).
    ///
    /// `count == 0` reads the current allowance and never creates or mutates
    /// state.
    pub fn check(&self, resource: &str, count: u64, identifier: Option<&str>) -> RateLimitResult {
        let now = Instant::now();
        let key = Self::key(resource, identifier);

        if count == 0 {
            return match self.states.get(&key) {
                Some(state) => state.peek(now),
                None => RateLimitState::new(self.config_for(resource), now).peek(now),
            };
        }

        let (result, violations) = match self.states.entry(key) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                let result = state.check(count, now);
                (result, state.violations)
            }
            Entry::Vacant(entry) => {
                let mut state = RateLimitState::new(self.config_for(resource), now);
                let result = state.check(count, now);
                let violations = state.violations;
                entry.insert(state);
                (result, violations)
            }
        };

        counter!("strata_rate_limit_checks_total", "resource" => resource.to_string()).increment(1);

        if !result.allowed {
            counter!("strata_rate_limit_violations_total", "resource" => resource.to_string())
                .increment(1);
            let retry_after_ms = result.retry_after.map_or(0, |d| d.as_millis() as u64);
            warn!(
                resource,
                identifier = identifier.unwrap_or("-"),
                count,
                retry_after_ms,
                "Rate limit exceeded"
            );
            self.events.emit(
                event_types::RATE_LIMIT_VIOLATED,
                Tier::External,
                json!({
                    "resource": resource,
                    "identifier": identifier,
                    "count": count,
                    "retryAfterMs": retry_after_ms,
                    "violations": violations,
                }),
            );
        } else if result.used_burst {
            debug!(resource, count, burst_remaining = result.burst_remaining, "Burst allowance used");
            self.events.emit(
                event_types::RATE_LIMIT_BURST_USED,
                Tier::External,
                json!({
                    "resource": resource,
                    "identifier": identifier,
                    "count": count,
                    "burstRemaining": result.burst_remaining,
                }),
            );
        }

        result
    }

    /// Set limits for a resource. Live states keep their counters.
    pub fn configure(&self, resource: &str, config: RateLimitConfig) {
        self.configs.insert(resource.to_string(), config);
        for mut entry in self.states.iter_mut() {
            if entry.key().0 == resource {
                entry.value_mut().update_limit(config);
            }
        }
    }

    /// Change only the numeric limits of a resource, keeping its window.
    pub fn update_limit(&self, resource: &str, limit: u64, burst_limit: u64) {
        let mut config = self.config_for(resource);
        config.limit = limit;
        config.burst_limit = burst_limit;
        self.configure(resource, config);
    }

    pub fn set_default(&self, config: RateLimitConfig) {
        *self.default.write() = config;
    }

    pub fn status(&self, resource: &str, identifier: Option<&str>) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let state = self.states.get(&Self::key(resource, identifier))?;
        let view = state.peek(now);
        Some(RateLimitStatus {
            limit: state.limit,
            burst_limit: state.burst_limit,
            window: state.window,
            current: state.limit - view.remaining,
            burst_current: state.burst_limit - view.burst_remaining,
            remaining: view.remaining,
            burst_remaining: view.burst_remaining,
            violations: state.violations,
        })
    }

    /// Forget a key entirely. Returns whether it existed.
    pub fn reset(&self, resource: &str, identifier: Option<&str>) -> bool {
        self.states.remove(&Self::key(resource, identifier)).is_some()
    }

    pub fn configured_resources(&self) -> HashMap<String, RateLimitConfig> {
        self.configs
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{NoopPublisher, TierEvent};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TierEvent>>);

    impl EventPublisher for Recorder {
        fn publish(&self, event: TierEvent) {
            self.0.lock().push(event);
        }
    }

    fn tight_limits() -> RateLimitConfig {
        RateLimitConfig::new(5, 10, Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_checks_then_burst() {
        let limiter = RateLimiter::new(tight_limits(), Arc::new(NoopPublisher));

        for expected in [4, 3, 2, 1, 0] {
            let result = limiter.check("r", 1, None);
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
        }
        let sixth = limiter.check("r", 1, None);
        assert!(sixth.allowed);
        assert!(sixth.used_burst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifiers_are_isolated() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 1, Duration::from_secs(1)), Arc::new(NoopPublisher));
        assert!(limiter.check("tool_calls", 1, Some("alice")).allowed);
        assert!(limiter.check("tool_calls", 1, Some("alice")).allowed);
        assert!(!limiter.check("tool_calls", 1, Some("alice")).allowed);
        assert!(limiter.check("tool_calls", 1, Some("bob")).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_violation_is_published() {
        let recorder = Arc::new(Recorder::default());
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 1, Duration::from_secs(1)), recorder.clone());

        limiter.check("r", 1, None);
        limiter.check("r", 1, None);
        let rejected = limiter.check("r", 1, None);
        assert!(!rejected.allowed);
        assert!(rejected.retry_after.is_some());

        let types: Vec<String> = recorder.0.lock().iter().map(|e| e.event_type.clone()).collect();
        assert_eq!(types, vec!["rate_limit.burst_used", "rate_limit.violated"]);
        assert_eq!(limiter.status("r", None).unwrap().violations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_count_never_creates_or_mutates() {
        let limiter = RateLimiter::new(tight_limits(), Arc::new(NoopPublisher));
        let result = limiter.check("r", 0, None);
        assert_eq!(result.remaining, 5);
        assert!(limiter.status("r", None).is_none());

        limiter.check("r", 2, None);
        let before = limiter.status("r", None).unwrap();
        limiter.check("r", 0, None);
        assert_eq!(limiter.status("r", None).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_restores_allowance() {
        let limiter = RateLimiter::new(tight_limits(), Arc::new(NoopPublisher));
        for _ in 0..5 {
            limiter.check("r", 1, None);
        }
        assert_eq!(limiter.status("r", None).unwrap().remaining, 0);

        tokio::time::advance(Duration::from_millis(1000)).await;
        let result = limiter.check("r", 1, None);
        assert!(!result.used_burst);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_keeps_counters_and_reset_clears() {
        let limiter = RateLimiter::new(tight_limits(), Arc::new(NoopPublisher));
        limiter.check("r", 3, None);

        limiter.update_limit("r", 20, 20);
        let status = limiter.status("r", None).unwrap();
        assert_eq!(status.limit, 20);
        assert_eq!(status.current, 3);

        assert!(limiter.reset("r", None));
        assert!(limiter.status("r", None).is_none());
        assert!(!limiter.reset("r", None));
    }
}
