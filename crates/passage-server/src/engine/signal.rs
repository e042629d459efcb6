//! Signal tunnel engine.
//!
//! Terminates the outer TLS session, peeks the inner ClientHello that the
//! Signal client sends through the tunnel, routes by its SNI against the
//! allow-list, and relays bytes to the mapped upstream. Sessions are
//! anonymous; accounting is per SNI.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bytes::Bytes;
use passage_config::Config;
use passage_core::io::{relay_bidirectional, PrefixedStream};
use passage_core::{
    DEFAULT_CONNECTION_BACKLOG, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_PEEK_BUFFER_SIZE,
    DEFAULT_PEEK_TIMEOUT_SECS, DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_SIGNAL_DIAL_TIMEOUT_SECS,
    ERROR_PEEK_FAILED, ERROR_TLS_HANDSHAKE, ERROR_UNAUTHORIZED_SNI,
};
use passage_metrics::{
    record_connection_rejected, record_error, record_relay, record_session_closed,
    record_session_opened,
};
use passage_proto::extract_sni;

use crate::engine::Engine;
use crate::error::ServerError;
use crate::relay::SniRelayMetrics;
use crate::tls::{server_config, ReloadableCert};
use crate::util::{create_listener, dial, normalize_listen, ConnectionTracker};

pub struct SignalEngine {
    config: Arc<Config>,
    tls: Arc<ReloadableCert>,
    admission: Arc<Semaphore>,
    bound: OnceLock<SocketAddr>,
}

impl SignalEngine {
    pub fn new(config: Arc<Config>, tls: Arc<ReloadableCert>, admission: Arc<Semaphore>) -> Self {
        Self {
            config,
            tls,
            admission,
            bound: OnceLock::new(),
        }
    }

    /// Address the listener actually bound to (useful with port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }
}

#[async_trait]
impl Engine for SignalEngine {
    fn name(&self) -> &'static str {
        "signal"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let tls_config = server_config(self.tls.clone())?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let listen: SocketAddr = normalize_listen(&self.config.listen)
            .parse()
            .map_err(|_| ServerError::Config("invalid listen address".into()))?;
        let listener = create_listener(listen, DEFAULT_CONNECTION_BACKLOG)?;
        let local = listener.local_addr()?;
        let _ = self.bound.set(local);
        info!(address = %local, hosts = self.config.hosts.len(), "signal tunnel listening");

        let tracker = ConnectionTracker::new();
        let idle_timeout = Duration::from_secs(self.config.timeout_sec);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("signal engine stopping accepts");
                    break;
                }

                result = listener.accept() => {
                    let (tcp, peer) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    // Load shedding, not backpressure: a full semaphore
                    // rejects the connection outright.
                    let permit = match self.admission.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            record_connection_rejected();
                            warn!(peer = %peer, "connection rejected: at max capacity");
                            drop(tcp);
                            continue;
                        }
                    };

                    let acceptor = acceptor.clone();
                    let config = self.config.clone();
                    let cancel = shutdown.clone();
                    let guard = tracker.track();

                    tokio::spawn(async move {
                        let _guard = guard;
                        let _permit = permit;
                        record_session_opened();
                        let start = Instant::now();

                        let handshake_timeout =
                            Duration::from_secs(DEFAULT_PEEK_TIMEOUT_SECS);
                        match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                            Ok(Ok(tls)) => {
                                handle_session(tls, peer, &config, idle_timeout, cancel).await;
                            }
                            Ok(Err(e)) => {
                                record_error(ERROR_TLS_HANDSHAKE);
                                debug!(peer = %peer, error = %e, "outer TLS handshake failed");
                            }
                            Err(_) => {
                                record_error(ERROR_TLS_HANDSHAKE);
                                debug!(peer = %peer, "outer TLS handshake timed out");
                            }
                        }

                        record_session_closed(start.elapsed().as_secs_f64());
                    });
                }
            }
        }

        drain(&tracker).await;
        info!("signal engine stopped");
        Ok(())
    }
}

/// Wait for in-flight sessions after the accept loop closes.
pub(crate) async fn drain(tracker: &ConnectionTracker) {
    let active = tracker.active();
    if active == 0 {
        return;
    }
    info!(active, "draining sessions");
    if tracker
        .wait_idle(Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS))
        .await
    {
        info!("all sessions drained");
    } else {
        warn!(active = tracker.active(), "drain deadline reached, forcing shutdown");
    }
}

/// One tunnel session on an already-terminated outer TLS stream.
async fn handle_session<S>(
    mut stream: S,
    peer: SocketAddr,
    config: &Config,
    idle_timeout: Duration,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Peek the inner ClientHello under its own deadline.
    let mut peek_buf = vec![0u8; DEFAULT_PEEK_BUFFER_SIZE];
    let peek_deadline = Duration::from_secs(DEFAULT_PEEK_TIMEOUT_SECS);
    let n = match tokio::time::timeout(peek_deadline, stream.read(&mut peek_buf)).await {
        Ok(Ok(0)) => return,
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            record_error(ERROR_PEEK_FAILED);
            debug!(peer = %peer, error = %e, "failed to peek inner hello");
            return;
        }
        Err(_) => {
            record_error(ERROR_PEEK_FAILED);
            debug!(peer = %peer, "inner hello peek timed out");
            return;
        }
    };
    let initial = &peek_buf[..n];

    let sni = extract_sni(initial).unwrap_or("").to_lowercase();
    let target = match config.upstream_for(&sni).filter(|_| !sni.is_empty()) {
        Some(target) => target.to_string(),
        None => {
            // A first byte that is not a TLS handshake means a browser (or
            // probe) talked plain HTTP through the outer tunnel; answer it
            // in-band instead of treating it as a broken hello.
            if initial.first() != Some(&0x16) {
                serve_inband_http(stream, peer).await;
                return;
            }
            record_error(ERROR_UNAUTHORIZED_SNI);
            warn!(peer = %peer, sni = %sni, "unauthorized SNI");
            return;
        }
    };

    let upstream =
        match dial(&target, Duration::from_secs(DEFAULT_SIGNAL_DIAL_TIMEOUT_SECS)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                record_error(e.error_type());
                warn!(peer = %peer, target = %target, error = %e, "upstream unreachable");
                return;
            }
        };

    record_relay(&sni);
    debug!(peer = %peer, sni = %sni, target = %target, "relay started");

    // The peek consumed the inner ClientHello; replaying it in front of the
    // client stream makes it the upstream's first bytes and keeps it inside
    // the relay's byte accounting.
    peek_buf.truncate(n);
    let client = PrefixedStream::new(Bytes::from(peek_buf), stream);

    let metrics = SniRelayMetrics { sni: &sni };
    let stats = relay_bidirectional(
        client,
        upstream,
        idle_timeout,
        DEFAULT_RELAY_BUFFER_SIZE,
        &cancel,
        &metrics,
    )
    .await;
    info!(
        peer = %peer,
        sni = %sni,
        up = stats.up,
        down = stats.down,
        "relay finished"
    );
}

/// Minimal in-band responder for plain-HTTP bytes on the Signal port.
///
/// The statistics API that historically shared this port lives behind a
/// separate listener; anything arriving here gets a terse 404 and a close.
async fn serve_inband_http<S>(mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(peer = %peer, "plain HTTP on signal listener");
    let _ = stream
        .write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
        .await;
    let _ = stream.shutdown().await;
}
