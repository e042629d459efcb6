//! The passage proxy server: engines, TLS hot-reload, and the lifecycle
//! supervisor.
//!
//! Three data-plane engines share one substrate: the Signal TLS-in-TLS
//! tunnel, the HTTP/HTTPS forward proxy, and the SOCKS5 proxy. The
//! supervisor in [`supervisor`] picks an engine set from the configured
//! proxy mode, wires up signal handling, and coordinates graceful drain.

pub mod engine;
pub mod error;
pub mod relay;
pub mod supervisor;
pub mod tls;
pub mod util;

pub use engine::{Engine, HttpEngine, SignalEngine, Socks5Engine};
pub use error::ServerError;
pub use tls::ReloadableCert;

// Re-exported so the binary and tests share one import path.
pub use tokio_util::sync::CancellationToken;
