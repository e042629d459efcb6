//! The shared user store: catalog snapshot, credential cache, rate limiter.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use passage_core::CRED_CACHE_TTL_SECS;

use crate::cache::CredentialCache;
use crate::error::AuthError;
use crate::hash::verify_password;
use crate::ratelimit::RateLimiter;
use crate::user::{User, UserCatalog};

/// Shared authentication state for all engines.
///
/// The catalog is replaced whole-for-whole on reload; readers only hold the
/// lock long enough to clone the `Arc` handle. Reload linearizes with cache
/// inserts through the cache lock, so a stale entry cannot survive
/// [`UserStore::reload`].
pub struct UserStore {
    catalog: RwLock<Arc<UserCatalog>>,
    cache: CredentialCache,
    limiter: RateLimiter,
    path: PathBuf,
}

impl UserStore {
    /// Load the store from a `users.json` path.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let path = path.into();
        let catalog = Arc::new(UserCatalog::load(&path)?);
        let limiter = RateLimiter::new();
        install_limits(&limiter, &catalog);
        info!(users = catalog.len(), path = %path.display(), "user catalog loaded");
        Ok(Self {
            catalog: RwLock::new(catalog),
            cache: CredentialCache::new(Duration::from_secs(CRED_CACHE_TTL_SECS)),
            limiter,
            path,
        })
    }

    /// Re-read the catalog file and swap it in. Drops every cached
    /// credential and rebuilds the limiter bucket set.
    pub fn reload(&self) -> Result<usize, AuthError> {
        let catalog = Arc::new(UserCatalog::load(&self.path)?);
        install_limits_fresh(&self.limiter, &catalog);
        let count = catalog.len();
        *self.catalog.write() = catalog;
        self.cache.clear();
        info!(users = count, "user catalog reloaded");
        Ok(count)
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<UserCatalog> {
        self.catalog.read().clone()
    }

    /// Validate a credential pair.
    ///
    /// Fast path is the credential cache; a miss falls through to the
    /// bcrypt comparison (~100 ms). Only successes are cached.
    pub fn validate(&self, username: &str, password: &str) -> Option<Arc<User>> {
        let key = CredentialCache::key(username, password);
        if let Some(user) = self.cache.get(&key) {
            return Some(user);
        }

        let catalog = self.catalog();
        let user = catalog.get(username)?.clone();
        if !verify_password(password, &user.password_hash) {
            debug!(user = %username, "credential validation failed");
            return None;
        }

        self.cache.insert(key, user.clone());
        Some(user)
    }

    /// True when the whitelist is empty or contains `ip`.
    pub fn client_allowed(&self, ip: IpAddr) -> bool {
        self.catalog().client_allowed(ip)
    }

    /// The super_admin user when `ip` is inside a super-admin CIDR.
    pub fn super_admin_for(&self, ip: IpAddr) -> Option<Arc<User>> {
        self.catalog().super_admin_for(ip).cloned()
    }

    /// True when `ip` falls inside a super-admin CIDR.
    pub fn is_super_admin_ip(&self, ip: IpAddr) -> bool {
        self.catalog().is_super_admin_ip(ip)
    }

    /// Consume one rate-limit token for the user. Unknown users are
    /// rejected; a zero limit always passes.
    pub fn check_rate_limit(&self, username: &str) -> bool {
        let catalog = self.catalog();
        let Some(user) = catalog.get(username) else {
            return false;
        };
        if user.rate_limit_rpm == 0 {
            return true;
        }
        self.limiter.allow(&user.username)
    }

    /// False once the account is past its expiry timestamp.
    pub fn check_expiry(&self, username: &str) -> bool {
        match self.catalog().get(username) {
            Some(user) => !user.expired(chrono::Utc::now()),
            None => false,
        }
    }

    /// Look up an enabled user.
    pub fn get(&self, username: &str) -> Option<Arc<User>> {
        self.catalog().get(username).cloned()
    }

    /// Number of enabled users.
    pub fn user_count(&self) -> usize {
        self.catalog().len()
    }

    /// Drop cached credentials for one user.
    pub fn invalidate(&self, username: &str) {
        self.cache.invalidate_user(username);
    }

    /// Drop all cached credentials.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Token balance for metrics; `None` when the user has no limit.
    pub fn remaining_tokens(&self, username: &str) -> Option<f64> {
        self.limiter.remaining_tokens(username)
    }
}

fn install_limits(limiter: &RateLimiter, catalog: &UserCatalog) {
    for user in catalog.iter() {
        if user.rate_limit_rpm > 0 {
            limiter.set_limit(&user.username, user.rate_limit_rpm);
        }
    }
}

fn install_limits_fresh(limiter: &RateLimiter, catalog: &UserCatalog) {
    limiter.clear();
    install_limits(limiter, catalog);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::hash::hash_password;

    fn users_json(extra_user: Option<&str>) -> String {
        let hash = hash_password("pw", 4).unwrap();
        let mut users = vec![format!(
            r#"{{"username": "alice", "role": "user", "password_hash": "{hash}",
                "rate_limit_rpm": 60, "enabled": true}}"#
        )];
        if let Some(extra) = extra_user {
            users.push(extra.to_string());
        }
        format!(
            r#"{{"users": [{}], "ip_whitelist": [], "super_admin_ips": ["127.0.0.0/8"]}}"#,
            users.join(",")
        )
    }

    fn store_with(json: &str) -> (UserStore, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let store = UserStore::load(file.path()).unwrap();
        (store, file)
    }

    #[test]
    fn validate_hits_cache_after_first_success() {
        let (store, _file) = store_with(&users_json(None));

        let start = std::time::Instant::now();
        assert!(store.validate("alice", "pw").is_some());
        let cold = start.elapsed();

        let start = std::time::Instant::now();
        for _ in 0..100 {
            assert!(store.validate("ALICE", "pw").is_some());
        }
        let warm = start.elapsed();
        // 100 cached validations must be far cheaper than one bcrypt.
        assert!(warm < cold * 10, "cache ineffective: cold {cold:?} warm {warm:?}");
    }

    #[test]
    fn negatives_are_never_cached() {
        let (store, _file) = store_with(&users_json(None));
        assert!(store.validate("alice", "wrong").is_none());
        assert!(store.validate("nobody", "pw").is_none());
        // The same wrong password fails again (no poisoned positive entry).
        assert!(store.validate("alice", "wrong").is_none());
        assert!(store.validate("alice", "pw").is_some());
    }

    #[test]
    fn invalidate_all_forces_rehash() {
        let (store, _file) = store_with(&users_json(None));
        assert!(store.validate("alice", "pw").is_some());
        store.invalidate_all();
        // Still validates, but through the slow path; cache internals are
        // covered in the cache tests.
        assert!(store.validate("alice", "pw").is_some());
    }

    #[test]
    fn reload_swaps_catalog_and_clears_cache() {
        let hash = hash_password("pw", 4).unwrap();
        let (store, file) = store_with(&users_json(None));
        assert!(store.validate("alice", "pw").is_some());

        // Rewrite the file with alice disabled.
        let json = format!(
            r#"{{"users": [{{"username": "alice", "password_hash": "{hash}",
                 "rate_limit_rpm": 60, "enabled": false}}]}}"#
        );
        std::fs::write(file.path(), json).unwrap();
        store.reload().unwrap();

        // The cached credential must not outlive the reload.
        assert!(store.validate("alice", "pw").is_none());
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn rate_limit_consumes_burst_then_rejects() {
        let (store, _file) = store_with(&users_json(None));
        let mut allowed = 0;
        for _ in 0..50 {
            if store.check_rate_limit("alice") {
                allowed += 1;
            }
        }
        assert!((10..=11).contains(&allowed), "allowed {allowed}");
    }

    #[test]
    fn zero_rpm_never_rate_limits() {
        let hash = hash_password("pw", 4).unwrap();
        let json = format!(
            r#"{{"users": [{{"username": "free", "password_hash": "{hash}",
                 "rate_limit_rpm": 0, "enabled": true}}]}}"#
        );
        let (store, _file) = store_with(&json);
        for _ in 0..1000 {
            assert!(store.check_rate_limit("free"));
        }
    }

    #[test]
    fn super_admin_lookup_respects_cidr() {
        let hash = hash_password("pw", 4).unwrap();
        let admin = format!(
            r#"{{"username": "root", "role": "super_admin", "password_hash": "{hash}",
                "rate_limit_rpm": 0, "enabled": true}}"#
        );
        let (store, _file) = store_with(&users_json(Some(&admin)));
        assert!(store.super_admin_for("127.0.0.1".parse().unwrap()).is_some());
        assert!(store.super_admin_for("8.8.8.8".parse().unwrap()).is_none());
    }
}
