//! Error type constants used as metric labels.
//!
//! These labels flow into `errors_total{type=...}` and must stay stable;
//! dashboards key on them.

/// TLS handshake failed or timed out.
pub const ERROR_TLS_HANDSHAKE: &str = "tls_handshake";
/// Failed to read the inner ClientHello.
pub const ERROR_PEEK_FAILED: &str = "peek_failed";
/// Inner SNI missing or not in the allow-list.
pub const ERROR_UNAUTHORIZED_SNI: &str = "unauthorized_sni";
/// Upstream dial failed.
pub const ERROR_DIAL_FAILED: &str = "dial_failed";
/// Forwarding an HTTP request to the target failed.
pub const ERROR_REQUEST_FAILED: &str = "request_failed";
/// Generic I/O failure on an established session.
pub const ERROR_IO: &str = "io";
/// Malformed client protocol bytes.
pub const ERROR_PROTOCOL: &str = "protocol";
/// Configuration problem detected at runtime.
pub const ERROR_CONFIG: &str = "config";

/// Authentication failure labels for `auth_failures_total{type=...}`.
pub const AUTH_FAIL_IP_BLOCKED: &str = "ip_blocked";
pub const AUTH_FAIL_NO_CREDENTIALS: &str = "no_credentials";
pub const AUTH_FAIL_INVALID_CREDENTIALS: &str = "invalid_credentials";
pub const AUTH_FAIL_NO_AUTH_METHOD: &str = "no_auth_method";
