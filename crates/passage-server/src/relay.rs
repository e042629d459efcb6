//! Engine-facing relay helpers: metrics adapters and optional throttling.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::either::Either;

use passage_core::io::{RelayMetrics, ThrottledStream};
use passage_metrics::{record_http_bytes, record_sni_bytes, record_socks5_bytes};

/// Records relay bytes against an SNI label (Signal engine).
pub struct SniRelayMetrics<'a> {
    pub sni: &'a str,
}

impl RelayMetrics for SniRelayMetrics<'_> {
    #[inline]
    fn record_up(&self, bytes: u64) {
        record_sni_bytes(self.sni, "upstream", bytes);
    }
    #[inline]
    fn record_down(&self, bytes: u64) {
        record_sni_bytes(self.sni, "downstream", bytes);
    }
}

/// Records relay bytes against a user label (HTTP engine).
pub struct HttpRelayMetrics<'a> {
    pub user: &'a str,
}

impl RelayMetrics for HttpRelayMetrics<'_> {
    #[inline]
    fn record_up(&self, bytes: u64) {
        record_http_bytes(self.user, "upstream", bytes);
    }
    #[inline]
    fn record_down(&self, bytes: u64) {
        record_http_bytes(self.user, "downstream", bytes);
    }
}

/// Records relay bytes against a user label (SOCKS5 engine).
pub struct Socks5RelayMetrics<'a> {
    pub user: &'a str,
}

impl RelayMetrics for Socks5RelayMetrics<'_> {
    #[inline]
    fn record_up(&self, bytes: u64) {
        record_socks5_bytes(self.user, "upstream", bytes);
    }
    #[inline]
    fn record_down(&self, bytes: u64) {
        record_socks5_bytes(self.user, "downstream", bytes);
    }
}

/// Wrap a stream in the byte-rate throttler when the user carries a speed
/// cap; zero passes the stream through untouched.
pub fn maybe_throttle<S>(stream: S, speed_mbps: u32) -> Either<ThrottledStream<S>, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if speed_mbps > 0 {
        Either::Left(ThrottledStream::new(stream, speed_mbps))
    } else {
        Either::Right(stream)
    }
}
