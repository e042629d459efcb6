//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Timeout Defaults
// ============================================================================

/// Default idle relay timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default graceful drain timeout in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
/// Deadline for reading the inner ClientHello on the Signal listener.
pub const DEFAULT_PEEK_TIMEOUT_SECS: u64 = 10;
/// Upstream dial timeout for the Signal engine.
pub const DEFAULT_SIGNAL_DIAL_TIMEOUT_SECS: u64 = 10;
/// Upstream dial timeout for the HTTP and SOCKS5 engines.
pub const DEFAULT_PROXY_DIAL_TIMEOUT_SECS: u64 = 30;
/// Initial handshake deadline for a SOCKS5 connection.
pub const DEFAULT_SOCKS5_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
/// TCP keep-alive interval on CONNECT tunnel sockets.
pub const DEFAULT_TUNNEL_KEEPALIVE_SECS: u64 = 30;

// ============================================================================
// Buffer / Size Defaults
// ============================================================================

/// Relay copy buffer size (32 KiB).
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32 * 1024;
/// Maximum bytes read when peeking the inner ClientHello.
pub const DEFAULT_PEEK_BUFFER_SIZE: usize = 16 * 1024;
/// TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;

// ============================================================================
// Admission Defaults
// ============================================================================

/// Default global admission capacity.
pub const DEFAULT_MAX_CONNS: usize = 1000;

// ============================================================================
// Credential Cache Defaults
// ============================================================================

/// How long a successful credential validation is cached, in seconds.
pub const CRED_CACHE_TTL_SECS: u64 = 300;

// ============================================================================
// Bandwidth Defaults
// ============================================================================

/// Interval between bandwidth usage file rewrites, in seconds.
pub const USAGE_PERSIST_INTERVAL_SECS: u64 = 300;

// ============================================================================
// Outbound HTTP Client Defaults
// ============================================================================

/// Pooled client: idle connections per host.
pub const DEFAULT_CLIENT_MAX_IDLE_PER_HOST: usize = 10;
/// Pooled client: idle connection timeout in seconds.
pub const DEFAULT_CLIENT_IDLE_TIMEOUT_SECS: u64 = 90;
