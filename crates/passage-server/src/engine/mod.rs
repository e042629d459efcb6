//! The three data-plane engines and the PAC responder.

mod http;
mod pac;
mod signal;
mod socks5;

pub use http::HttpEngine;
pub use pac::PacHandler;
pub use signal::SignalEngine;
pub use socks5::Socks5Engine;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// An engine is a listener plus its session handling. The supervisor
/// composes whichever set the proxy mode calls for.
///
/// `run` binds the listener, accepts until `shutdown` fires, then drains
/// in-flight sessions (bounded by the drain deadline) before returning.
/// A bind failure is the only error an engine surfaces.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError>;
}
