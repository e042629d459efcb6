//! I/O primitives shared by all proxy engines.
//!
//! The relay is the heart of every tunnel session; the prefixed stream
//! replays peeked bytes, and the throttled stream enforces per-user speed
//! caps.

mod prefixed;
mod relay;
mod throttle;

pub use prefixed::PrefixedStream;
pub use relay::{relay_bidirectional, NoOpMetrics, RelayMetrics, RelayStats};
pub use throttle::ThrottledStream;
