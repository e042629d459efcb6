//! Token-bucket speed limiting for a bidirectional stream.
//!
//! Tokens are bytes. The bucket holds one second of bandwidth, refills
//! continuously, and every read/write first waits until at least one token
//! is available, then performs the full operation and consumes tokens for
//! the bytes actually moved. An operation larger than the balance drives
//! it negative; the resulting debt delays the next operation, which is
//! what paces sustained throughput to the target rate. The relay's copy
//! buffer bounds how deep a single operation can overdraw.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Upper bound on a single pacing sleep; keeps the stream responsive to
/// shutdown and deadline checks.
const MAX_WAIT: Duration = Duration::from_millis(100);
const MIN_WAIT: Duration = Duration::from_millis(1);

struct ByteBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl ByteBucket {
    fn new(speed_mbps: u32) -> Self {
        let bytes_per_sec = f64::from(speed_mbps) * 1024.0 * 1024.0 / 8.0;
        Self {
            tokens: bytes_per_sec,
            capacity: bytes_per_sec,
            refill_per_sec: bytes_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn consume(&mut self, n: usize) {
        self.tokens -= n as f64;
    }

    /// How long to sleep before the balance could reach one token.
    fn wait_hint(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(1.0);
        let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
        wait.clamp(MIN_WAIT, MAX_WAIT)
    }
}

/// Wraps a stream with byte-rate pacing at `speed_mbps` megabits/second.
///
/// A speed of zero means "unthrottled" and must be handled by the caller;
/// the engines only wrap streams for users that carry a speed cap.
pub struct ThrottledStream<S> {
    inner: S,
    bucket: ByteBucket,
    read_sleep: Option<Pin<Box<Sleep>>>,
    write_sleep: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    /// Wrap `inner`, pacing both directions at `speed_mbps`.
    ///
    /// # Panics
    /// Panics if `speed_mbps` is zero.
    pub fn new(inner: S, speed_mbps: u32) -> Self {
        assert!(speed_mbps > 0, "a zero speed cap means no throttling");
        Self {
            inner,
            bucket: ByteBucket::new(speed_mbps),
            read_sleep: None,
            write_sleep: None,
        }
    }

    fn poll_tokens(
        bucket: &mut ByteBucket,
        sleep: &mut Option<Pin<Box<Sleep>>>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        loop {
            if let Some(pending) = sleep.as_mut() {
                match pending.as_mut().poll(cx) {
                    Poll::Ready(()) => *sleep = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            bucket.refill();
            if bucket.tokens >= 1.0 {
                return Poll::Ready(());
            }
            *sleep = Some(Box::pin(tokio::time::sleep(bucket.wait_hint())));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if Self::poll_tokens(&mut this.bucket, &mut this.read_sleep, cx).is_pending() {
            return Poll::Pending;
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.bucket.consume(n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if Self::poll_tokens(&mut this.bucket, &mut this.write_sleep, cx).is_pending() {
            return Poll::Pending;
        }
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.bucket.consume(n);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn passes_data_through_unmodified() {
        let (client, server) = duplex(64 * 1024);
        let mut throttled = ThrottledStream::new(client, 100);
        let mut server = server;

        throttled.write_all(b"throttled payload").await.unwrap();
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"throttled payload");

        server.write_all(b"reply").await.unwrap();
        let n = throttled.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn sustained_writes_are_paced() {
        // 1 Mbps = 131072 bytes/sec. Writing in relay-sized chunks, the
        // first bucket's worth goes out as a free burst and pushes the
        // balance into debt; every later chunk waits for refill, so the
        // transfer takes close to a second end to end.
        let (client, server) = duplex(1024 * 1024);
        let mut throttled = ThrottledStream::new(client, 1);

        let reader = tokio::spawn(async move {
            let mut server = server;
            let mut sink = vec![0u8; 64 * 1024];
            let mut total = 0usize;
            loop {
                match server.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n,
                }
            }
            total
        });

        let payload = vec![0u8; 2 * 131072];
        let start = Instant::now();
        for chunk in payload.chunks(32 * 1024) {
            throttled.write_all(chunk).await.unwrap();
        }
        throttled.shutdown().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(reader.await.unwrap(), payload.len());
        assert!(
            elapsed >= Duration::from_millis(500),
            "2x bucket capacity at 1 Mbps finished in {elapsed:?}, expected pacing"
        );
    }

    #[tokio::test]
    async fn oversized_write_goes_through_whole_and_leaves_debt() {
        // One token is enough to admit the operation; the full buffer is
        // written and the balance goes negative afterward.
        let (client, server) = duplex(1024 * 1024);
        let mut throttled = ThrottledStream::new(client, 1);

        let payload = vec![0u8; 200_000]; // well above the 131072 capacity
        throttled.write_all(&payload).await.unwrap();
        assert!(
            throttled.bucket.tokens < 0.0,
            "balance should be in debt, got {}",
            throttled.bucket.tokens
        );

        let mut server = server;
        let mut sink = vec![0u8; 64 * 1024];
        let mut total = 0usize;
        while total < payload.len() {
            total += server.read(&mut sink).await.unwrap();
        }
        assert_eq!(total, payload.len());
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let mut bucket = ByteBucket::new(8); // 8 Mbps = 1 MiB/s
        std::thread::sleep(Duration::from_millis(20));
        bucket.refill();
        assert!(bucket.tokens <= bucket.capacity);

        bucket.consume(4096);
        let before = bucket.tokens;
        bucket.refill();
        assert!(bucket.tokens >= before);
        assert!(bucket.tokens <= bucket.capacity);
    }

    #[test]
    fn wait_hint_is_clamped() {
        let mut bucket = ByteBucket::new(1);
        bucket.tokens = -10_000_000.0;
        assert_eq!(bucket.wait_hint(), MAX_WAIT);
        bucket.tokens = 0.9999;
        assert!(bucket.wait_hint() >= MIN_WAIT);
    }
}
