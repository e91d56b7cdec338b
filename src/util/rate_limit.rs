//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::world::AccountId;

/// Keyed limiter type alias
pub type KeyedLimiter = RateLimiter<AccountId, DefaultKeyedStateStore<AccountId>, DefaultClock>;

/// Default player action quota (send, cancel, enqueue)
pub const ACTION_RATE_LIMIT: u32 = 5;

/// Per-account limiter for player actions.
///
/// The bucket map lives inside this value and is handed to the application
/// state at construction; it is empty again after a process restart.
#[derive(Clone)]
pub struct ActionRateLimiter {
    limiter: Arc<KeyedLimiter>,
}

impl ActionRateLimiter {
    pub fn new(actions_per_second: u32) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(actions_per_second).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Check if an action is allowed for this account (returns true if allowed)
    pub fn check(&self, account_id: AccountId) -> bool {
        self.limiter.check_key(&account_id).is_ok()
    }

    /// Drop buckets that have fully replenished
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }
}

impl Default for ActionRateLimiter {
    fn default() -> Self {
        Self::new(ACTION_RATE_LIMIT)
    }
}
