//! Password hashing utilities.
//!
//! Stored credentials are bcrypt hashes (the adaptive cost is the reason
//! the credential cache exists — a verify takes on the order of 100 ms).
//! SHA-256 is only used to build cache keys, never to store passwords.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 digest and return it as lowercase hex.
#[inline]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a plaintext password against a stored bcrypt hash.
///
/// A malformed hash counts as a failed verification.
#[inline]
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Hash a password for storage in `users.json`.
pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, cost)
}
