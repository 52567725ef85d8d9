//! Rate limiting primitives for auth flows.
//!
//! Rolling-window attempt counting plus a failure-triggered cooldown:
//! repeated wrong codes or recovery requests trip the cooldown before the
//! window limit is reached. State is per-process; synchronizing limits
//! across instances would move this into PostgreSQL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const ATTEMPT_WINDOW: Duration = Duration::from_secs(10 * 60);
const ATTEMPT_LIMIT: usize = 10;
const FAILURE_LIMIT: u32 = 5;
const COOLDOWN_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Copy, Debug)]
pub enum RateLimitAction {
    Signin,
    SecondFactor,
    Recovery,
}

impl RateLimitAction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Signin => "signin",
            Self::SecondFactor => "second_factor",
            Self::Recovery => "recovery",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    /// Check limits for the key and register the attempt.
    fn check(&self, key: &str, action: RateLimitAction) -> RateLimitDecision;
    /// Count a failed attempt toward the cooldown trigger.
    fn record_failure(&self, key: &str, action: RateLimitAction);
    /// Reset the failure streak after a successful attempt.
    fn record_success(&self, key: &str, action: RateLimitAction);
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _key: &str, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn record_failure(&self, _key: &str, _action: RateLimitAction) {}

    fn record_success(&self, _key: &str, _action: RateLimitAction) {}
}

#[derive(Debug, Default)]
struct KeyState {
    attempts: Vec<Instant>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// In-memory sliding-window limiter with failure cooldown.
#[derive(Debug, Default)]
pub struct SlidingWindowRateLimiter {
    state: Mutex<HashMap<(String, &'static str), KeyState>>,
}

impl SlidingWindowRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries with nothing left to remember: attempts aged out of the
    /// window and no running cooldown. Keys are caller-controlled, so
    /// without this the map grows with every address or username ever seen.
    fn prune(state: &mut HashMap<(String, &'static str), KeyState>, now: Instant) {
        state.retain(|_, entry| {
            entry
                .attempts
                .retain(|at| now.duration_since(*at) < ATTEMPT_WINDOW);
            !entry.attempts.is_empty() || entry.cooldown_until.is_some_and(|until| now < until)
        });
    }

    fn check_at(&self, key: &str, action: RateLimitAction, now: Instant) -> RateLimitDecision {
        let Ok(mut state) = self.state.lock() else {
            // Fail closed on a poisoned lock.
            return RateLimitDecision::Limited;
        };
        Self::prune(&mut state, now);
        let entry = state
            .entry((key.to_string(), action.as_str()))
            .or_default();

        if let Some(until) = entry.cooldown_until {
            if now < until {
                return RateLimitDecision::Limited;
            }
            entry.cooldown_until = None;
            entry.consecutive_failures = 0;
        }

        if entry.attempts.len() >= ATTEMPT_LIMIT {
            return RateLimitDecision::Limited;
        }

        entry.attempts.push(now);
        RateLimitDecision::Allowed
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state.lock().map_or(0, |state| state.len())
    }

    fn record_failure_at(&self, key: &str, action: RateLimitAction, now: Instant) {
        if let Ok(mut state) = self.state.lock() {
            let entry = state
                .entry((key.to_string(), action.as_str()))
                .or_default();
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            if entry.consecutive_failures >= FAILURE_LIMIT {
                entry.cooldown_until = Some(now + COOLDOWN_DURATION);
            }
        }
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn check(&self, key: &str, action: RateLimitAction) -> RateLimitDecision {
        self.check_at(key, action, Instant::now())
    }

    fn record_failure(&self, key: &str, action: RateLimitAction) {
        self.record_failure_at(key, action, Instant::now());
    }

    fn record_success(&self, key: &str, action: RateLimitAction) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.get_mut(&(key.to_string(), action.as_str())) {
                entry.consecutive_failures = 0;
                entry.cooldown_until = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_rate_limiter_allows() {
        let limiter = NoopRateLimiter;
        assert_eq!(
            limiter.check("1.2.3.4", RateLimitAction::Signin),
            RateLimitDecision::Allowed
        );
        limiter.record_failure("1.2.3.4", RateLimitAction::Signin);
        assert_eq!(
            limiter.check("1.2.3.4", RateLimitAction::Signin),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn window_limit_trips_after_enough_attempts() {
        let limiter = SlidingWindowRateLimiter::new();
        let now = Instant::now();
        for _ in 0..ATTEMPT_LIMIT {
            assert_eq!(
                limiter.check_at("key", RateLimitAction::SecondFactor, now),
                RateLimitDecision::Allowed
            );
        }
        assert_eq!(
            limiter.check_at("key", RateLimitAction::SecondFactor, now),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn window_limit_releases_after_the_window() {
        let limiter = SlidingWindowRateLimiter::new();
        let start = Instant::now();
        for _ in 0..ATTEMPT_LIMIT {
            limiter.check_at("key", RateLimitAction::SecondFactor, start);
        }
        let later = start + ATTEMPT_WINDOW + Duration::from_secs(1);
        assert_eq!(
            limiter.check_at("key", RateLimitAction::SecondFactor, later),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn consecutive_failures_trigger_cooldown() {
        let limiter = SlidingWindowRateLimiter::new();
        let now = Instant::now();
        for _ in 0..FAILURE_LIMIT {
            limiter.record_failure_at("key", RateLimitAction::SecondFactor, now);
        }
        assert_eq!(
            limiter.check_at("key", RateLimitAction::SecondFactor, now),
            RateLimitDecision::Limited
        );
        // Cooldown outlives the attempt window.
        let after_cooldown = now + COOLDOWN_DURATION + Duration::from_secs(1);
        assert_eq!(
            limiter.check_at("key", RateLimitAction::SecondFactor, after_cooldown),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let limiter = SlidingWindowRateLimiter::new();
        let now = Instant::now();
        for _ in 0..FAILURE_LIMIT - 1 {
            limiter.record_failure_at("key", RateLimitAction::SecondFactor, now);
        }
        limiter.record_success("key", RateLimitAction::SecondFactor);
        limiter.record_failure_at("key", RateLimitAction::SecondFactor, now);
        assert_eq!(
            limiter.check_at("key", RateLimitAction::SecondFactor, now),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn idle_keys_are_evicted_after_the_window() {
        let limiter = SlidingWindowRateLimiter::new();
        let start = Instant::now();
        for n in 0..1000 {
            limiter.check_at(&format!("10.0.{}.{}", n / 256, n % 256), RateLimitAction::Signin, start);
        }
        assert_eq!(limiter.tracked_keys(), 1000);

        let later = start + ATTEMPT_WINDOW + COOLDOWN_DURATION + Duration::from_secs(1);
        limiter.check_at("fresh", RateLimitAction::Signin, later);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn cooling_keys_survive_eviction() {
        let limiter = SlidingWindowRateLimiter::new();
        let start = Instant::now();
        for _ in 0..FAILURE_LIMIT {
            limiter.check_at("hot", RateLimitAction::SecondFactor, start);
            limiter.record_failure_at("hot", RateLimitAction::SecondFactor, start);
        }

        // Past the attempt window but inside the cooldown: the entry stays.
        let mid_cooldown = start + ATTEMPT_WINDOW + Duration::from_secs(1);
        limiter.check_at("other", RateLimitAction::SecondFactor, mid_cooldown);
        assert_eq!(
            limiter.check_at("hot", RateLimitAction::SecondFactor, mid_cooldown),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn keys_and_actions_are_independent() {
        let limiter = SlidingWindowRateLimiter::new();
        let now = Instant::now();
        for _ in 0..FAILURE_LIMIT {
            limiter.record_failure_at("alice", RateLimitAction::SecondFactor, now);
        }
        assert_eq!(
            limiter.check_at("bob", RateLimitAction::SecondFactor, now),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check_at("alice", RateLimitAction::Recovery, now),
            RateLimitDecision::Allowed
        );
    }
}
