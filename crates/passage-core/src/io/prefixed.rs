//! Prefixed stream adapter for replaying peeked bytes.
//!
//! The Signal engine reads the inner ClientHello off the decrypted stream
//! to extract the SNI before it knows where the bytes should go. Wrapping
//! the stream in `PrefixedStream` puts those bytes back in front so the
//! relay sees an untouched byte sequence.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper that yields a prefetched prefix before reading from the
/// inner stream. Writes, flushes, and shutdown pass straight through.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// Remaining unread prefix bytes.
    pub fn prefix_remaining(&self) -> usize {
        self.prefix.len().saturating_sub(self.pos)
    }

    /// Consumes the wrapper, returning the inner stream. Unread prefix
    /// bytes are lost.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefix_is_read_before_inner() {
        let (mut client, server) = duplex(1024);

        let mut prefixed = PrefixedStream::new(Bytes::from_static(b"\x16\x03\x01"), server);

        client.write_all(b"rest-of-hello").await.unwrap();
        drop(client);

        let mut total = Vec::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = prefixed.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total.extend_from_slice(&buf[..n]);
        }
        assert_eq!(total, b"\x16\x03\x01rest-of-hello");
    }

    #[tokio::test]
    async fn short_reads_drain_prefix_incrementally() {
        let (_client, server) = duplex(1024);
        let mut prefixed = PrefixedStream::new(Bytes::from_static(b"abcdef"), server);

        let mut buf = [0u8; 4];
        let n = prefixed.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(prefixed.prefix_remaining(), 2);

        let n = prefixed.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
        assert_eq!(prefixed.prefix_remaining(), 0);
    }

    #[tokio::test]
    async fn writes_bypass_prefix() {
        let (mut client, server) = duplex(1024);
        let mut prefixed = PrefixedStream::new(Bytes::from_static(b"unused"), server);

        prefixed.write_all(b"direct").await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"direct");
    }
}
