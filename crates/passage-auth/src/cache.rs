//! Credential cache.
//!
//! bcrypt verification costs ~100 ms; a busy HTTP proxy authenticates every
//! request and would collapse without this cache. Keys never contain the
//! plaintext password: `lower(username) + ":" + sha256_hex(password)`.
//! Only positive validations are cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::hash::sha256_hex;
use crate::user::User;

struct CacheEntry {
    user: Arc<User>,
    valid_until: Instant,
}

pub(crate) struct CredentialCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl CredentialCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Build the cache key for a credential pair.
    pub(crate) fn key(username: &str, password: &str) -> String {
        format!("{}:{}", username.to_lowercase(), sha256_hex(password))
    }

    /// Fetch a fresh entry; expired entries are pruned on the way.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<User>> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if Instant::now() < entry.valid_until => {
                    return Some(entry.user.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Lazy pruning of the expired entry.
        self.entries.write().remove(key);
        None
    }

    pub(crate) fn insert(&self, key: String, user: Arc<User>) {
        let entry = CacheEntry {
            user,
            valid_until: Instant::now() + self.ttl,
        };
        self.entries.write().insert(key, entry);
    }

    /// Drop every entry belonging to `username`.
    pub(crate) fn invalidate_user(&self, username: &str) {
        let prefix = format!("{}:", username.to_lowercase());
        self.entries
            .write()
            .retain(|key, _| !key.starts_with(&prefix));
    }

    /// Drop all entries.
    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
