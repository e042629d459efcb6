//! Authentication and authorization for the passage proxy.
//!
//! The [`UserStore`] owns an atomically swappable user catalog loaded from
//! `users.json`, a short-lived credential cache in front of the bcrypt
//! comparison, and the per-user request-rate limiter. All engines share one
//! store; a reload replaces the catalog whole-for-whole and drops every
//! cached credential.

mod cache;
mod error;
mod hash;
mod ratelimit;
mod store;
mod user;

pub use error::AuthError;
pub use hash::{hash_password, sha256_hex, verify_password};
pub use ratelimit::RateLimiter;
pub use store::UserStore;
pub use user::{Role, User, UserCatalog};
