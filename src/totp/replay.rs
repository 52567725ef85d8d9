//! One-shot cache for accepted TOTP codes.
//!
//! A code that already unlocked something must not unlock it again, even
//! inside its validity window. The cache keys on the step the code actually
//! matched, not the wall-clock step at verification time, so skew tolerance
//! does not open a second chance for the same code.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::engine::{TOTP_SKEW, TOTP_STEP_SECONDS};

// A code stops matching (2 * skew + 1) steps after its own step; entries
// older than that can never collide again.
const ENTRY_TTL_SECONDS: i64 = ((2 * TOTP_SKEW + 1) * TOTP_STEP_SECONDS) as i64;

#[derive(Debug, Default)]
pub struct SeenCodeCache {
    seen: Mutex<HashMap<(Uuid, String, u64), i64>>,
}

impl SeenCodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically consult and record one accepted code.
    ///
    /// Returns `true` if the code is fresh for this principal and step, and
    /// records it; `false` if it was already used. A poisoned lock fails
    /// closed and reports the code as seen.
    pub fn check_and_record(&self, principal: Uuid, code: &str, step: u64, now: i64) -> bool {
        let Ok(mut seen) = self.seen.lock() else {
            return false;
        };
        seen.retain(|_, recorded| now - *recorded < ENTRY_TTL_SECONDS);

        let key = (principal, code.to_string(), step);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn first_use_passes_second_is_blocked() {
        let cache = SeenCodeCache::new();
        let principal = Uuid::new_v4();
        assert!(cache.check_and_record(principal, "123456", 100, 3000));
        assert!(!cache.check_and_record(principal, "123456", 100, 3001));
    }

    #[test]
    fn other_principals_are_unaffected() {
        let cache = SeenCodeCache::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        assert!(cache.check_and_record(alice, "123456", 100, 3000));
        assert!(cache.check_and_record(bob, "123456", 100, 3000));
    }

    #[test]
    fn same_code_in_a_different_step_is_fresh() {
        // Six digits give repeats; a repeat in a later window is a new code.
        let cache = SeenCodeCache::new();
        let principal = Uuid::new_v4();
        assert!(cache.check_and_record(principal, "123456", 100, 3000));
        assert!(cache.check_and_record(principal, "123456", 103, 3090));
    }

    #[test]
    fn entries_expire_with_the_code() {
        let cache = SeenCodeCache::new();
        let principal = Uuid::new_v4();
        assert!(cache.check_and_record(principal, "123456", 100, 3000));
        // ENTRY_TTL_SECONDS later the code itself can no longer match, so
        // the cache may forget it.
        assert!(cache.check_and_record(principal, "123456", 100, 3000 + ENTRY_TTL_SECONDS));
    }
}
