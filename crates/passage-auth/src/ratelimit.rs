//! Per-user token-bucket rate limiting.
//!
//! Each limited user gets a bucket holding ten seconds of their
//! requests-per-minute budget (floor ten), refilled continuously. A user
//! with no configured limit has no bucket and is always allowed.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rpm: u32) -> Self {
        // Burst of ~10 seconds of steady-state traffic, floor 10 requests.
        let capacity = (f64::from(rpm) / 6.0).max(10.0);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: f64::from(rpm) / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter keyed by username.
///
/// The map lock only guards structure; each bucket has its own lock held
/// only across the refill arithmetic.
#[derive(Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or reset) the bucket for a user. Called on catalog load for
    /// every user with a positive limit.
    pub fn set_limit(&self, username: &str, rpm: u32) {
        self.buckets
            .write()
            .insert(username.to_string(), Mutex::new(TokenBucket::new(rpm)));
    }

    /// Drop all buckets (catalog reload replaces the whole limit set).
    pub fn clear(&self) {
        self.buckets.write().clear();
    }

    /// Consume one token for the user. Users without a bucket are allowed.
    pub fn allow(&self, username: &str) -> bool {
        let buckets = self.buckets.read();
        match buckets.get(username) {
            Some(bucket) => bucket.lock().allow(),
            None => true,
        }
    }

    /// Current token balance, or `None` when the user has no limit.
    pub fn remaining_tokens(&self, username: &str) -> Option<f64> {
        let buckets = self.buckets.read();
        buckets.get(username).map(|bucket| bucket.lock().tokens)
    }
}
