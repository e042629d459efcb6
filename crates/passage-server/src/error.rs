//! Server error types.

use passage_auth::AuthError;
use passage_core::{ERROR_CONFIG, ERROR_DIAL_FAILED, ERROR_IO, ERROR_PROTOCOL, ERROR_TLS_HANDSHAKE};
use passage_proto::socks5::Socks5Error;

/// Errors surfaced by the engines and supervisor.
///
/// Only configuration and listener-bind failures propagate out of an
/// engine; everything else stays inside a single session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("socks5: {0}")]
    Socks5(#[from] Socks5Error),
    #[error("config: {0}")]
    Config(String),
    #[error("upstream dial failed: {0}")]
    Dial(String),
}

impl ServerError {
    /// Metric label for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Io(_) => ERROR_IO,
            ServerError::Tls(_) => ERROR_TLS_HANDSHAKE,
            ServerError::Auth(_) => ERROR_CONFIG,
            ServerError::Socks5(_) => ERROR_PROTOCOL,
            ServerError::Config(_) => ERROR_CONFIG,
            ServerError::Dial(_) => ERROR_DIAL_FAILED,
        }
    }
}
