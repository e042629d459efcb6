//! Wire-level parsing shared by the passage engines.
//!
//! - [`sni`] — stateless extraction of the server name from a raw TLS
//!   ClientHello record (RFC 8446/5246 framing, RFC 6066 extension)
//! - [`socks5`] — SOCKS5 framing per RFC 1928 with username/password
//!   sub-negotiation per RFC 1929

pub mod sni;
pub mod socks5;

pub use sni::extract_sni;
