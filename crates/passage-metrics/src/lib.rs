//! Metrics collection and Prometheus exporter for passage.
//!
//! Engines call the plain recording functions below and never see the
//! backend; the binary installs the Prometheus exporter when a metrics
//! address is configured, and tests run against the default no-op recorder.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on the given address.
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = normalize_addr(listen)
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    Ok(())
}

/// Accept the Go-style ":9090" shorthand for "0.0.0.0:9090".
fn normalize_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

// ============================================================================
// Metric Names — Signal tunnel engine
// ============================================================================

/// Relays started, by SNI.
pub const RELAY_TOTAL: &str = "passage_relay_total";
/// Currently active Signal tunnel sessions.
pub const ACTIVE_CONNS: &str = "passage_active_conns";
/// Bytes relayed, by SNI and direction ("upstream"/"downstream").
pub const BYTES_TOTAL: &str = "passage_bytes_total";
/// Session duration histogram (seconds).
pub const CONNECTION_DURATION_SECONDS: &str = "passage_connection_duration_seconds";
/// Accepts rejected by the admission semaphore.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "passage_connections_rejected_total";

// ============================================================================
// Metric Names — shared failure accounting
// ============================================================================

/// Errors by type (see `passage_core::errors` for the labels).
pub const ERRORS_TOTAL: &str = "passage_errors_total";
/// Authentication failures by type.
pub const AUTH_FAILURES_TOTAL: &str = "passage_auth_failures_total";
/// Requests rejected by the per-user rate limiter.
pub const RATE_LIMITED_TOTAL: &str = "passage_rate_limited_total";

// ============================================================================
// Metric Names — HTTP proxy engine
// ============================================================================

/// Proxy requests by user and method.
pub const HTTP_REQUESTS_TOTAL: &str = "passage_http_requests_total";
/// Bytes moved for a user, by direction.
pub const HTTP_BYTES_TOTAL: &str = "passage_http_bytes_total";
/// Currently active HTTP proxy connections.
pub const HTTP_ACTIVE_CONNECTIONS: &str = "passage_http_active_connections";
/// HTTP request/tunnel duration histogram (seconds).
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "passage_http_request_duration_seconds";

// ============================================================================
// Metric Names — SOCKS5 engine
// ============================================================================

/// Established SOCKS5 relays by user.
pub const SOCKS5_CONNECTIONS_TOTAL: &str = "passage_socks5_connections_total";
/// Bytes moved for a user, by direction.
pub const SOCKS5_BYTES_TOTAL: &str = "passage_socks5_bytes_total";
/// Currently active SOCKS5 connections.
pub const SOCKS5_ACTIVE_CONNECTIONS: &str = "passage_socks5_active_connections";
/// SOCKS5 session duration histogram (seconds).
pub const SOCKS5_DURATION_SECONDS: &str = "passage_socks5_duration_seconds";

// ============================================================================
// Recording Functions — Signal tunnel engine
// ============================================================================

/// Record a relay session started for an allow-listed SNI.
#[inline]
pub fn record_relay(sni: &str) {
    counter!(RELAY_TOTAL, "sni" => sni.to_string()).increment(1);
}

#[inline]
pub fn record_session_opened() {
    gauge!(ACTIVE_CONNS).increment(1.0);
}

#[inline]
pub fn record_session_closed(duration_secs: f64) {
    gauge!(ACTIVE_CONNS).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(duration_secs);
}

/// Record bytes relayed for an SNI in one direction.
#[inline]
pub fn record_sni_bytes(sni: &str, direction: &'static str, bytes: u64) {
    counter!(BYTES_TOTAL, "sni" => sni.to_string(), "direction" => direction).increment(bytes);
}

/// Record an accept rejected at the admission semaphore.
#[inline]
pub fn record_connection_rejected() {
    counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
}

// ============================================================================
// Recording Functions — shared failure accounting
// ============================================================================

/// Record an error by type label.
#[inline]
pub fn record_error(error_type: &'static str) {
    counter!(ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Record an authentication failure by type label.
#[inline]
pub fn record_auth_failure(failure_type: &'static str) {
    counter!(AUTH_FAILURES_TOTAL, "type" => failure_type).increment(1);
}

/// Record a request rejected by the per-user rate limiter.
#[inline]
pub fn record_rate_limited(user: &str) {
    counter!(RATE_LIMITED_TOTAL, "user" => user.to_string()).increment(1);
}

// ============================================================================
// Recording Functions — HTTP proxy engine
// ============================================================================

#[inline]
pub fn record_http_request(user: &str, method: &str) {
    counter!(HTTP_REQUESTS_TOTAL, "user" => user.to_string(), "method" => method.to_string())
        .increment(1);
}

#[inline]
pub fn record_http_bytes(user: &str, direction: &'static str, bytes: u64) {
    counter!(HTTP_BYTES_TOTAL, "user" => user.to_string(), "direction" => direction)
        .increment(bytes);
}

#[inline]
pub fn record_http_conn_opened() {
    gauge!(HTTP_ACTIVE_CONNECTIONS).increment(1.0);
}

#[inline]
pub fn record_http_conn_closed(duration_secs: f64) {
    gauge!(HTTP_ACTIVE_CONNECTIONS).decrement(1.0);
    histogram!(HTTP_REQUEST_DURATION_SECONDS).record(duration_secs);
}

// ============================================================================
// Recording Functions — SOCKS5 engine
// ============================================================================

#[inline]
pub fn record_socks5_connection(user: &str) {
    counter!(SOCKS5_CONNECTIONS_TOTAL, "user" => user.to_string()).increment(1);
}

#[inline]
pub fn record_socks5_bytes(user: &str, direction: &'static str, bytes: u64) {
    counter!(SOCKS5_BYTES_TOTAL, "user" => user.to_string(), "direction" => direction)
        .increment(bytes);
}

#[inline]
pub fn record_socks5_opened() {
    gauge!(SOCKS5_ACTIVE_CONNECTIONS).increment(1.0);
}

#[inline]
pub fn record_socks5_closed(duration_secs: f64) {
    gauge!(SOCKS5_ACTIVE_CONNECTIONS).decrement(1.0);
    histogram!(SOCKS5_DURATION_SECONDS).record(duration_secs);
}
