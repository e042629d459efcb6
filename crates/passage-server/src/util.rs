//! Listener and connection utilities shared by the engines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::ServerError;
use passage_core::DEFAULT_TUNNEL_KEEPALIVE_SECS;

/// Expand the ":8080" listen shorthand to a bindable address.
pub fn normalize_listen(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Create a TCP listener with an explicit backlog.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(std::net::TcpListener::from(socket))?)
}

/// Dial a target within `timeout`, mapping both the timer and connect
/// failure into [`ServerError::Dial`].
pub async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, ServerError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ServerError::Dial(format!("{target}: {e}"))),
        Err(_) => Err(ServerError::Dial(format!("{target}: connect timed out"))),
    }
}

/// Enable TCP keep-alive on a socket. Mobile NATs drop idle mappings;
/// tunnels need the probes to stay pinned.
pub fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive =
        TcpKeepalive::new().with_time(Duration::from_secs(DEFAULT_TUNNEL_KEEPALIVE_SECS));
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Counts in-flight sessions so an engine can drain on shutdown.
///
/// The count lives in a watch channel: session guards bump it through
/// their own sender handles, and draining is just waiting for the value
/// to reach zero.
#[derive(Clone)]
pub struct ConnectionTracker {
    count: watch::Sender<usize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Register a session; the returned guard deregisters it on drop.
    pub fn track(&self) -> SessionGuard {
        self.count.send_modify(|active| *active += 1);
        SessionGuard {
            count: self.count.clone(),
        }
    }

    pub fn active(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until every session finished, up to `timeout`. Returns false
    /// when sessions were still active at the deadline.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut watched = self.count.subscribe();
        let result = tokio::time::timeout(timeout, watched.wait_for(|active| *active == 0)).await;
        matches!(result, Ok(Ok(_)))
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for one tracked session.
pub struct SessionGuard {
    count: watch::Sender<usize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.count.send_modify(|active| *active = active.saturating_sub(1));
    }
}

/// Holds one per-user active-connection slot in the bandwidth tracker.
pub struct UserConnGuard {
    tracker: Arc<passage_bandwidth::Tracker>,
    username: String,
}

impl UserConnGuard {
    pub fn register(tracker: Arc<passage_bandwidth::Tracker>, username: &str) -> Self {
        tracker.increment_conns(username);
        Self {
            tracker,
            username: username.to_string(),
        }
    }
}

impl Drop for UserConnGuard {
    fn drop(&mut self) {
        self.tracker.decrement_conns(&self.username);
    }
}
