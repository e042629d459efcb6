//! SOCKS5 engine (RFC 1928/1929, CONNECT only).
//!
//! Per-connection state machine: method negotiation, username/password
//! sub-negotiation, request parsing, then the shared policy gauntlet and
//! relay. Username/password is the only regular method; no-auth is honored
//! solely for clients inside a super-admin CIDR.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use passage_auth::{Role, User, UserStore};
use passage_bandwidth::Tracker;
use passage_core::io::relay_bidirectional;
use passage_core::{
    AUTH_FAIL_INVALID_CREDENTIALS, AUTH_FAIL_IP_BLOCKED, AUTH_FAIL_NO_AUTH_METHOD,
    DEFAULT_CONNECTION_BACKLOG, DEFAULT_PROXY_DIAL_TIMEOUT_SECS, DEFAULT_RELAY_BUFFER_SIZE,
    DEFAULT_SOCKS5_HANDSHAKE_TIMEOUT_SECS, ERROR_PROTOCOL,
};
use passage_metrics::{
    record_auth_failure, record_connection_rejected, record_error, record_rate_limited,
    record_socks5_closed, record_socks5_connection, record_socks5_opened,
};
use passage_proto::socks5::{
    self, DestAddr, CMD_CONNECT, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, METHOD_USERPASS,
    REPLY_COMMAND_NOT_SUPPORTED, REPLY_CONNECTION_NOT_ALLOWED, REPLY_HOST_UNREACHABLE,
    REPLY_SUCCEEDED, USERPASS_FAILURE, USERPASS_SUCCESS,
};

use crate::engine::signal::drain;
use crate::engine::Engine;
use crate::error::ServerError;
use crate::relay::{maybe_throttle, Socks5RelayMetrics};
use crate::util::{create_listener, dial, normalize_listen, ConnectionTracker, UserConnGuard};

pub struct Socks5Engine {
    listen: String,
    users: Arc<UserStore>,
    tracker: Arc<Tracker>,
    admission: Arc<Semaphore>,
    idle_timeout: Duration,
    bound: OnceLock<SocketAddr>,
}

impl Socks5Engine {
    pub fn new(
        listen: String,
        users: Arc<UserStore>,
        tracker: Arc<Tracker>,
        admission: Arc<Semaphore>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            listen,
            users,
            tracker,
            admission,
            idle_timeout,
            bound: OnceLock::new(),
        }
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }
}

#[async_trait]
impl Engine for Socks5Engine {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listen: SocketAddr = normalize_listen(&self.listen)
            .parse()
            .map_err(|_| ServerError::Config("invalid SOCKS5 listen address".into()))?;
        let listener = create_listener(listen, DEFAULT_CONNECTION_BACKLOG)?;
        let local = listener.local_addr()?;
        let _ = self.bound.set(local);
        info!(address = %local, "SOCKS5 proxy listening");

        let sessions = ConnectionTracker::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("SOCKS5 engine stopping accepts");
                    break;
                }

                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let permit = match self.admission.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            record_connection_rejected();
                            warn!(peer = %peer, "SOCKS5 connection rejected: at max capacity");
                            drop(stream);
                            continue;
                        }
                    };

                    let engine = SessionContext {
                        users: self.users.clone(),
                        tracker: self.tracker.clone(),
                        idle_timeout: self.idle_timeout,
                    };
                    let cancel = shutdown.clone();
                    let guard = sessions.track();

                    tokio::spawn(async move {
                        let _guard = guard;
                        let _permit = permit;
                        engine.handle(stream, peer, cancel).await;
                    });
                }
            }
        }

        drain(&sessions).await;
        info!("SOCKS5 engine stopped");
        Ok(())
    }
}

struct SessionContext {
    users: Arc<UserStore>,
    tracker: Arc<Tracker>,
    idle_timeout: Duration,
}

impl SessionContext {
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        if !self.users.client_allowed(peer.ip()) {
            record_auth_failure(AUTH_FAIL_IP_BLOCKED);
            warn!(peer = %peer, "SOCKS5 client IP blocked");
            return;
        }

        record_socks5_opened();
        let start = Instant::now();
        self.session(&mut stream, peer, cancel).await;
        record_socks5_closed(start.elapsed().as_secs_f64());
    }

    /// The state machine proper. Protocol errors close the connection
    /// silently after a best-effort reply.
    async fn session(&self, stream: &mut TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let handshake = Duration::from_secs(DEFAULT_SOCKS5_HANDSHAKE_TIMEOUT_SECS);
        let negotiated =
            match tokio::time::timeout(handshake, self.negotiate(stream, peer)).await {
                Ok(Some(negotiated)) => negotiated,
                Ok(None) => return,
                Err(_) => {
                    debug!(peer = %peer, "SOCKS5 handshake timed out");
                    return;
                }
            };
        let (user, dest) = negotiated;
        let username = user.username.as_str();

        let bypass = user.role == Role::SuperAdmin && self.users.is_super_admin_ip(peer.ip());
        if bypass {
            info!(peer = %peer, user = %username, "SOCKS5 super_admin verified");
        } else {
            if !self.users.check_rate_limit(username) {
                record_rate_limited(username);
                warn!(peer = %peer, user = %username, "SOCKS5 rate limited");
                return;
            }
            if !self.users.check_expiry(username) {
                let _ = socks5::send_reply_unspecified(stream, REPLY_CONNECTION_NOT_ALLOWED).await;
                warn!(peer = %peer, user = %username, "SOCKS5 account expired");
                return;
            }
            if !self.tracker.check_allowance(username, user.bandwidth_limit_gb) {
                let _ = socks5::send_reply_unspecified(stream, REPLY_HOST_UNREACHABLE).await;
                warn!(peer = %peer, user = %username, "SOCKS5 bandwidth exceeded");
                return;
            }
            if !self.tracker.check_conn_limit(username, user.max_connections) {
                record_rate_limited(username);
                warn!(peer = %peer, user = %username, "SOCKS5 connection limit reached");
                return;
            }
        }

        let _conns = UserConnGuard::register(self.tracker.clone(), username);

        let target = dest.to_string();
        let upstream = match dial(
            &target,
            Duration::from_secs(DEFAULT_PROXY_DIAL_TIMEOUT_SECS),
        )
        .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                record_error(e.error_type());
                warn!(peer = %peer, target = %target, error = %e, "SOCKS5 dial failed");
                let _ = socks5::send_reply_unspecified(stream, REPLY_HOST_UNREACHABLE).await;
                return;
            }
        };

        let bind_addr = match upstream.local_addr() {
            Ok(addr) => addr,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 0u16)),
        };
        if socks5::send_reply(stream, REPLY_SUCCEEDED, &bind_addr)
            .await
            .is_err()
        {
            return;
        }

        record_socks5_connection(username);
        debug!(peer = %peer, user = %username, target = %target, "SOCKS5 relay started");

        let client = maybe_throttle(stream, user.bandwidth_speed_mbps);
        let upstream = maybe_throttle(upstream, user.bandwidth_speed_mbps);

        let metrics = Socks5RelayMetrics { user: username };
        let stats = relay_bidirectional(
            client,
            upstream,
            self.idle_timeout,
            DEFAULT_RELAY_BUFFER_SIZE,
            &cancel,
            &metrics,
        )
        .await;
        self.tracker.record(username, stats.up, stats.down);
        info!(
            peer = %peer,
            user = %username,
            up = stats.up,
            down = stats.down,
            "SOCKS5 relay finished"
        );
    }

    /// METHOD_WAIT → AUTH_WAIT → REQUEST_WAIT.
    ///
    /// Returns the authenticated user and the CONNECT destination, or
    /// `None` after a best-effort error reply.
    async fn negotiate(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
    ) -> Option<(Arc<User>, DestAddr)> {
        let methods = match socks5::read_methods(stream).await {
            Ok(methods) => methods,
            Err(e) => {
                record_error(ERROR_PROTOCOL);
                debug!(peer = %peer, error = %e, "SOCKS5 greeting failed");
                return None;
            }
        };

        let user: Arc<User> = if methods.contains(&METHOD_USERPASS) {
            socks5::send_method(stream, METHOD_USERPASS).await.ok()?;
            let (username, password) = match socks5::read_userpass(stream).await {
                Ok(creds) => creds,
                Err(e) => {
                    record_error(ERROR_PROTOCOL);
                    debug!(peer = %peer, error = %e, "SOCKS5 sub-negotiation failed");
                    return None;
                }
            };
            match self.users.validate(&username, &password) {
                Some(user) => {
                    socks5::send_userpass_status(stream, USERPASS_SUCCESS)
                        .await
                        .ok()?;
                    user
                }
                None => {
                    let _ = socks5::send_userpass_status(stream, USERPASS_FAILURE).await;
                    record_auth_failure(AUTH_FAIL_INVALID_CREDENTIALS);
                    warn!(peer = %peer, user = %username, "SOCKS5 auth failed");
                    return None;
                }
            }
        } else if methods.contains(&METHOD_NO_AUTH) {
            // No-auth is a privilege of super-admin CIDRs only.
            match self.users.super_admin_for(peer.ip()) {
                Some(admin) => {
                    socks5::send_method(stream, METHOD_NO_AUTH).await.ok()?;
                    admin
                }
                None => {
                    let _ = socks5::send_method(stream, METHOD_NO_ACCEPTABLE).await;
                    record_auth_failure(AUTH_FAIL_NO_AUTH_METHOD);
                    return None;
                }
            }
        } else {
            let _ = socks5::send_method(stream, METHOD_NO_ACCEPTABLE).await;
            record_auth_failure(AUTH_FAIL_NO_AUTH_METHOD);
            return None;
        };

        let (command, dest) = match socks5::read_request(stream).await {
            Ok(request) => request,
            Err(e) => {
                record_error(ERROR_PROTOCOL);
                debug!(peer = %peer, error = %e, "SOCKS5 request parse failed");
                let _ = socks5::send_reply_unspecified(stream, REPLY_COMMAND_NOT_SUPPORTED).await;
                return None;
            }
        };
        if command != CMD_CONNECT {
            let _ = socks5::send_reply_unspecified(stream, REPLY_COMMAND_NOT_SUPPORTED).await;
            debug!(peer = %peer, command, "SOCKS5 command not supported");
            return None;
        }

        Some((user, dest))
    }
}
