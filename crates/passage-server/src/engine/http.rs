//! HTTP/HTTPS forward proxy engine.
//!
//! Two listeners (plaintext and optional TLS) feed one handler: PAC path,
//! client-CIDR gate, Basic auth, then the policy gauntlet. CONNECT requests
//! hijack the connection via the HTTP upgrade machinery and hand both ends
//! to the relay; every other verb must be absolute-form and is forwarded
//! through a pooled outbound client with hop-by-hop headers stripped.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use passage_auth::{Role, User, UserStore};
use passage_bandwidth::Tracker;
use passage_config::EnvConfig;
use passage_core::io::relay_bidirectional;
use passage_core::{
    AUTH_FAIL_INVALID_CREDENTIALS, AUTH_FAIL_IP_BLOCKED, AUTH_FAIL_NO_CREDENTIALS,
    DEFAULT_CLIENT_IDLE_TIMEOUT_SECS, DEFAULT_CLIENT_MAX_IDLE_PER_HOST,
    DEFAULT_CONNECTION_BACKLOG, DEFAULT_PROXY_DIAL_TIMEOUT_SECS, DEFAULT_RELAY_BUFFER_SIZE,
    DEFAULT_TUNNEL_KEEPALIVE_SECS, ERROR_DIAL_FAILED, ERROR_REQUEST_FAILED, ERROR_TLS_HANDSHAKE,
};
use passage_metrics::{
    record_auth_failure, record_connection_rejected, record_error, record_http_bytes,
    record_http_conn_closed, record_http_conn_opened, record_http_request, record_rate_limited,
};

use crate::engine::signal::drain;
use crate::engine::{Engine, PacHandler};
use crate::error::ServerError;
use crate::relay::{maybe_throttle, HttpRelayMetrics};
use crate::tls::{server_config, ReloadableCert};
use crate::util::{
    create_listener, dial, normalize_listen, set_keepalive, ConnectionTracker, UserConnGuard,
};

const PAC_PATH: &str = "/proxy.pac";

/// Headers that must not cross the proxy boundary (RFC 7230 §6.1).
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct HttpEngine {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    env: EnvConfig,
    users: Arc<UserStore>,
    tracker: Arc<Tracker>,
    tls: Option<Arc<ReloadableCert>>,
    admission: Arc<Semaphore>,
    idle_timeout: Duration,
    pac: Option<PacHandler>,
    client: Client<HttpConnector, Incoming>,
    bound: OnceLock<SocketAddr>,
    bound_tls: OnceLock<SocketAddr>,
}

impl HttpEngine {
    pub fn new(
        env: EnvConfig,
        users: Arc<UserStore>,
        tracker: Arc<Tracker>,
        tls: Option<Arc<ReloadableCert>>,
        admission: Arc<Semaphore>,
        idle_timeout: Duration,
    ) -> Self {
        let pac = env.pac_enabled.then(|| {
            info!("PAC endpoint enabled at {PAC_PATH}");
            PacHandler::new(&env, users.clone())
        });

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(DEFAULT_PROXY_DIAL_TIMEOUT_SECS)));
        connector.set_keepalive(Some(Duration::from_secs(DEFAULT_TUNNEL_KEEPALIVE_SECS)));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(DEFAULT_CLIENT_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(DEFAULT_CLIENT_IDLE_TIMEOUT_SECS))
            .build(connector);

        Self {
            inner: Arc::new(HttpInner {
                env,
                users,
                tracker,
                tls,
                admission,
                idle_timeout,
                pac,
                client,
                bound: OnceLock::new(),
                bound_tls: OnceLock::new(),
            }),
        }
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.get().copied()
    }

    pub fn bound_tls_addr(&self) -> Option<SocketAddr> {
        self.inner.bound_tls.get().copied()
    }
}

#[async_trait]
impl Engine for HttpEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let inner = &self.inner;

        let listen: SocketAddr = normalize_listen(&inner.env.http_proxy_port)
            .parse()
            .map_err(|_| ServerError::Config("invalid HTTP proxy listen address".into()))?;
        let listener = create_listener(listen, DEFAULT_CONNECTION_BACKLOG)?;
        let _ = inner.bound.set(listener.local_addr()?);
        info!(address = %listener.local_addr()?, "HTTP proxy listening");

        let tls_listener = match (&inner.tls, inner.env.http_proxy_tls) {
            (Some(tls), true) => {
                let listen: SocketAddr = normalize_listen(&inner.env.http_proxy_tls_port)
                    .parse()
                    .map_err(|_| {
                        ServerError::Config("invalid HTTPS proxy listen address".into())
                    })?;
                let listener = create_listener(listen, DEFAULT_CONNECTION_BACKLOG)?;
                let _ = inner.bound_tls.set(listener.local_addr()?);
                info!(address = %listener.local_addr()?, "HTTPS proxy listening (TLS)");
                let acceptor = TlsAcceptor::from(Arc::new(server_config(tls.clone())?));
                Some((listener, acceptor))
            }
            _ => None,
        };

        let sessions = ConnectionTracker::new();

        match tls_listener {
            Some((listener_tls, acceptor)) => {
                tokio::join!(
                    accept_loop(inner.clone(), listener, None, shutdown.clone(), sessions.clone()),
                    accept_loop(
                        inner.clone(),
                        listener_tls,
                        Some(acceptor),
                        shutdown.clone(),
                        sessions.clone()
                    ),
                );
            }
            None => {
                accept_loop(inner.clone(), listener, None, shutdown.clone(), sessions.clone())
                    .await;
            }
        }

        drain(&sessions).await;
        info!("HTTP engine stopped");
        Ok(())
    }
}

async fn accept_loop(
    inner: Arc<HttpInner>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    sessions: ConnectionTracker,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("HTTP engine stopping accepts");
                return;
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let permit = match inner.admission.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        record_connection_rejected();
                        warn!(peer = %peer, "HTTP connection rejected: at max capacity");
                        drop(stream);
                        continue;
                    }
                };

                // Keep-alive probes keep mobile NAT mappings pinned for
                // long-lived CONNECT tunnels.
                let _ = stream.set_nodelay(true);
                let _ = set_keepalive(&stream);

                let inner = inner.clone();
                let acceptor = acceptor.clone();
                let cancel = shutdown.clone();
                let guard = sessions.track();

                tokio::spawn(async move {
                    let _guard = guard;
                    let _permit = permit;

                    let service_inner = inner.clone();
                    let service = service_fn(move |req| {
                        let inner = service_inner.clone();
                        let cancel = cancel.clone();
                        async move {
                            Ok::<_, Infallible>(inner.handle(req, peer, cancel).await)
                        }
                    });

                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls) => {
                                http1::Builder::new()
                                    .preserve_header_case(true)
                                    .title_case_headers(true)
                                    .serve_connection(TokioIo::new(tls), service)
                                    .with_upgrades()
                                    .await
                            }
                            Err(e) => {
                                record_error(ERROR_TLS_HANDSHAKE);
                                debug!(peer = %peer, error = %e, "proxy TLS handshake failed");
                                return;
                            }
                        },
                        None => {
                            http1::Builder::new()
                                .preserve_header_case(true)
                                .title_case_headers(true)
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades()
                                .await
                        }
                    };

                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "proxy connection ended");
                    }
                });
            }
        }
    }
}

impl HttpInner {
    /// One proxy request. The checks short-circuit in the documented
    /// order; every rejection carries its protocol-appropriate status.
    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if let Some(pac) = &self.pac {
            if req.uri().path() == PAC_PATH {
                return pac.handle(req.method(), req.uri(), peer.ip());
            }
        }

        if !self.users.client_allowed(peer.ip()) {
            record_auth_failure(AUTH_FAIL_IP_BLOCKED);
            warn!(peer = %peer, "client IP blocked");
            return text_response(StatusCode::FORBIDDEN, "Forbidden");
        }

        let Some((username, password)) = parse_proxy_auth(req.headers()) else {
            record_auth_failure(AUTH_FAIL_NO_CREDENTIALS);
            return proxy_auth_required();
        };
        let Some(user) = self.users.validate(&username, &password) else {
            record_auth_failure(AUTH_FAIL_INVALID_CREDENTIALS);
            warn!(peer = %peer, user = %username, "proxy auth failed");
            return proxy_auth_required();
        };

        let bypass = user.role == Role::SuperAdmin && self.users.is_super_admin_ip(peer.ip());
        if bypass {
            info!(peer = %peer, user = %user.username, "super_admin verified");
        } else {
            if !self.users.check_rate_limit(&user.username) {
                record_rate_limited(&user.username);
                warn!(user = %user.username, "rate limited");
                return text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            }
            if !self.users.check_expiry(&user.username) {
                warn!(user = %user.username, "account expired");
                return text_response(StatusCode::FORBIDDEN, "Account Expired");
            }
            if !self.tracker.check_allowance(&user.username, user.bandwidth_limit_gb) {
                warn!(user = %user.username, "bandwidth limit exceeded");
                return text_response(StatusCode::FORBIDDEN, "Bandwidth Limit Exceeded");
            }
            if !self.tracker.check_conn_limit(&user.username, user.max_connections) {
                warn!(user = %user.username, "connection limit reached");
                return text_response(StatusCode::TOO_MANY_REQUESTS, "Connection Limit Reached");
            }
        }

        let session = SessionAccounting::open(self.tracker.clone(), &user.username);

        if req.method() == Method::CONNECT {
            self.handle_connect(req, user, peer, session, cancel).await
        } else {
            self.handle_forward(req, user, session).await
        }
    }

    /// CONNECT: dial the target, answer 200, take over the client socket
    /// via upgrade, and splice the two.
    async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
        user: Arc<User>,
        peer: SocketAddr,
        session: SessionAccounting,
        cancel: CancellationToken,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        record_http_request(&user.username, "CONNECT");

        let Some(target) = connect_target(req.uri()) else {
            debug!(peer = %peer, uri = %req.uri(), "CONNECT without authority");
            return text_response(StatusCode::BAD_REQUEST, "CONNECT must be to a host:port");
        };

        let upstream = match dial(
            &target,
            Duration::from_secs(DEFAULT_PROXY_DIAL_TIMEOUT_SECS),
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                record_error(ERROR_DIAL_FAILED);
                warn!(peer = %peer, target = %target, error = %e, "CONNECT dial failed");
                return text_response(StatusCode::BAD_GATEWAY, "Failed to connect to target");
            }
        };
        let _ = set_keepalive(&upstream);

        let engine = self.clone();
        tokio::spawn(async move {
            let _session = session;
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = maybe_throttle(TokioIo::new(upgraded), user.bandwidth_speed_mbps);
                    let upstream = maybe_throttle(upstream, user.bandwidth_speed_mbps);
                    let metrics = HttpRelayMetrics {
                        user: &user.username,
                    };
                    let stats = relay_bidirectional(
                        client,
                        upstream,
                        engine.idle_timeout,
                        DEFAULT_RELAY_BUFFER_SIZE,
                        &cancel,
                        &metrics,
                    )
                    .await;
                    engine.tracker.record(&user.username, stats.up, stats.down);
                    debug!(
                        peer = %peer,
                        target = %target,
                        user = %user.username,
                        up = stats.up,
                        down = stats.down,
                        "tunnel finished"
                    );
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "CONNECT upgrade failed");
                }
            }
        });

        // hyper turns this into the 200 that completes the upgrade.
        Response::new(empty())
    }

    /// Absolute-form forwarding through the pooled client.
    async fn handle_forward(
        self: Arc<Self>,
        req: Request<Incoming>,
        user: Arc<User>,
        session: SessionAccounting,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        record_http_request(&user.username, req.method().as_str());

        if req.uri().scheme().is_none() || req.uri().host().is_none() {
            return text_response(StatusCode::BAD_REQUEST, "Bad Request: absolute URL required");
        }

        let (mut parts, body) = req.into_parts();
        strip_hop_headers(&mut parts.headers);
        let outbound = Request::from_parts(parts, body);

        match self.client.request(outbound).await {
            Ok(resp) => {
                let username = user.username.clone();
                let tracker = self.tracker.clone();
                resp.map(|body| CountingBody::new(body, username, tracker, session).boxed())
            }
            Err(e) => {
                record_error(ERROR_REQUEST_FAILED);
                warn!(user = %user.username, error = %e, "forward request failed");
                text_response(StatusCode::BAD_GATEWAY, "Failed to reach target")
            }
        }
    }
}

/// Gauge + duration + per-user connection slot for one proxy session.
/// Everything unwinds on drop, wherever the session ends.
struct SessionAccounting {
    _conns: UserConnGuard,
    started: Instant,
}

impl SessionAccounting {
    fn open(tracker: Arc<Tracker>, username: &str) -> Self {
        record_http_conn_opened();
        Self {
            _conns: UserConnGuard::register(tracker, username),
            started: Instant::now(),
        }
    }
}

impl Drop for SessionAccounting {
    fn drop(&mut self) {
        record_http_conn_closed(self.started.elapsed().as_secs_f64());
    }
}

/// Response body wrapper that counts downstream bytes into the bandwidth
/// tracker once the stream completes (or is dropped mid-flight).
struct CountingBody<B> {
    inner: B,
    username: String,
    tracker: Arc<Tracker>,
    bytes: u64,
    _session: SessionAccounting,
}

impl<B> CountingBody<B> {
    fn new(inner: B, username: String, tracker: Arc<Tracker>, session: SessionAccounting) -> Self {
        Self {
            inner,
            username,
            tracker,
            bytes: 0,
            _session: session,
        }
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Unpin,
{
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                    record_http_bytes(&this.username, "downstream", data.len() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CountingBody<B> {
    fn drop(&mut self) {
        self.tracker.record(&self.username, 0, self.bytes);
    }
}

/// CONNECT target from the authority-form URI, defaulting to port 443.
fn connect_target(uri: &Uri) -> Option<String> {
    let authority = uri.authority()?;
    if authority.port().is_some() {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:443"))
    }
}

/// Extract Basic credentials from `Proxy-Authorization` (RFC 7617).
fn parse_proxy_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::PROXY_AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (username, password) = credentials.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn text_response(
    status: StatusCode,
    message: &'static str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(message));
    *resp.status_mut() = status;
    resp
}

fn proxy_auth_required() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = text_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy Authentication Required",
    );
    resp.headers_mut().insert(
        header::PROXY_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Proxy Authentication Required\""),
    );
    resp
}
