//! Bidirectional relay between a client and an upstream.
//!
//! Both directions are driven as independent poll-based copy legs inside
//! a single future, so back-pressure on one direction never stalls the
//! other. When a direction hits EOF its destination is half-closed
//! (`poll_shutdown`), which lets peers that depend on client-side EOF
//! (e.g. chunked uploads) complete correctly. Cancellation and an idle
//! deadline both end the session while still reporting accumulated bytes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

/// Per-direction byte accounting hook.
///
/// The server records to Prometheus and the bandwidth tracker; tests use
/// an in-memory recorder; [`NoOpMetrics`] discards everything.
pub trait RelayMetrics {
    /// Bytes delivered from the client to the upstream.
    fn record_up(&self, bytes: u64);
    /// Bytes delivered from the upstream to the client.
    fn record_down(&self, bytes: u64);
}

/// Metrics recorder that discards all samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl RelayMetrics for NoOpMetrics {
    #[inline]
    fn record_up(&self, _bytes: u64) {}
    #[inline]
    fn record_down(&self, _bytes: u64) {}
}

/// Bytes moved in each direction during a relay session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client → upstream.
    pub up: u64,
    /// Upstream → client.
    pub down: u64,
}

impl RelayStats {
    /// Total bytes in both directions.
    #[inline]
    pub fn total(self) -> u64 {
        self.up + self.down
    }
}

/// One copy direction: bytes staged through an owned buffer between a
/// reader and a writer.
///
/// Progress is tracked with buffer cursors rather than explicit states:
/// staged bytes are always drained to the writer before the reader is
/// touched again, and a flush is issued only once the reader has nothing
/// more to give (`Pending`) or hit EOF. Buffered writers such as TLS
/// streams therefore see one flush per burst instead of one per read.
/// After EOF the destination is flushed and half-closed so the peer
/// observes end-of-stream in that direction.
struct CopyLeg {
    buf: Box<[u8]>,
    /// Cursor pair delimiting staged-but-unwritten bytes.
    start: usize,
    end: usize,
    /// Bytes written to the destination since the last flush.
    unflushed: usize,
    read_closed: bool,
    closed: bool,
}

/// Outcome of one [`CopyLeg::poll_copy`] step.
enum CopyStep {
    /// A flush pushed this many bytes out; count them for accounting.
    Flushed(usize),
    /// EOF reached, destination flushed and half-closed.
    Closed,
}

impl CopyLeg {
    fn new(buffer_size: usize) -> Self {
        Self {
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start: 0,
            end: 0,
            unflushed: 0,
            read_closed: false,
            closed: false,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
        writer: &mut W,
    ) -> Poll<io::Result<CopyStep>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.closed {
            return Poll::Ready(Ok(CopyStep::Closed));
        }

        loop {
            // Drain staged bytes before touching the reader again.
            while self.start < self.end {
                match Pin::new(&mut *writer).poll_write(cx, &self.buf[self.start..self.end]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.start += n;
                        self.unflushed += n;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if self.read_closed {
                if self.unflushed > 0 {
                    return self.poll_report_flush(cx, writer);
                }
                return match Pin::new(&mut *writer).poll_shutdown(cx) {
                    Poll::Ready(_) => {
                        self.closed = true;
                        Poll::Ready(Ok(CopyStep::Closed))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            let mut read_buf = ReadBuf::new(&mut self.buf);
            match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        self.read_closed = true;
                    } else {
                        self.start = 0;
                        self.end = n;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    // Source idle: flush what accumulated, or go quiet.
                    if self.unflushed > 0 {
                        return self.poll_report_flush(cx, writer);
                    }
                    return Poll::Pending;
                }
            }
        }
    }

    fn poll_report_flush<W>(
        &mut self,
        cx: &mut Context<'_>,
        writer: &mut W,
    ) -> Poll<io::Result<CopyStep>>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match Pin::new(&mut *writer).poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                let flushed = self.unflushed;
                self.unflushed = 0;
                Poll::Ready(Ok(CopyStep::Flushed(flushed)))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Relay bytes between `client` and `upstream` until both directions hit
/// EOF, an I/O error ends the session, the idle deadline expires, or
/// `cancel` fires.
///
/// Both streams are owned and dropped (closed) on return. The returned
/// [`RelayStats`] reflect bytes actually written to each destination —
/// sessions that end by error, timeout, or cancellation still report what
/// they moved.
pub async fn relay_bidirectional<C, U, M>(
    client: C,
    upstream: U,
    idle_timeout: Duration,
    buffer_size: usize,
    cancel: &CancellationToken,
    metrics: &M,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
    M: RelayMetrics,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let mut up = CopyLeg::new(buffer_size);
    let mut down = CopyLeg::new(buffer_size);

    let idle_sleep = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle_sleep);

    let mut up_done = false;
    let mut down_done = false;
    let mut stats = RelayStats::default();

    loop {
        if up_done && down_done {
            return stats;
        }

        // Poll both legs in one future; each registers its own waker so a
        // blocked write in one direction cannot stall the other.
        let both = std::future::poll_fn(|cx| {
            let mut any_ready = false;
            let mut activity = false;
            let mut error: Option<io::Error> = None;

            if !up_done {
                match up.poll_copy(cx, &mut client_r, &mut upstream_w) {
                    Poll::Ready(Ok(CopyStep::Flushed(n))) => {
                        let bytes = n as u64;
                        metrics.record_up(bytes);
                        stats.up += bytes;
                        activity = true;
                        any_ready = true;
                    }
                    Poll::Ready(Ok(CopyStep::Closed)) => {
                        up_done = true;
                        any_ready = true;
                    }
                    Poll::Ready(Err(e)) => {
                        error = Some(e);
                        any_ready = true;
                    }
                    Poll::Pending => {}
                }
            }

            if !down_done {
                match down.poll_copy(cx, &mut upstream_r, &mut client_w) {
                    Poll::Ready(Ok(CopyStep::Flushed(n))) => {
                        let bytes = n as u64;
                        metrics.record_down(bytes);
                        stats.down += bytes;
                        activity = true;
                        any_ready = true;
                    }
                    Poll::Ready(Ok(CopyStep::Closed)) => {
                        down_done = true;
                        any_ready = true;
                    }
                    Poll::Ready(Err(e)) => {
                        error = Some(e);
                        any_ready = true;
                    }
                    Poll::Pending => {}
                }
            }

            if let Some(e) = error {
                return Poll::Ready(Err(e));
            }
            if any_ready {
                Poll::Ready(Ok(activity))
            } else {
                Poll::Pending
            }
        });

        tokio::select! {
            result = both => {
                // An I/O error on either leg ends the session; the bytes it
                // moved were already recorded through `metrics` and `stats`.
                match result {
                    Ok(activity) => {
                        if activity {
                            idle_sleep.as_mut().reset(TokioInstant::now() + idle_timeout);
                        }
                    }
                    Err(_) => return stats,
                }
            }
            _ = idle_sleep.as_mut() => {
                return stats;
            }
            _ = cancel.cancelled() => {
                return stats;
            }
        }
    }
}
