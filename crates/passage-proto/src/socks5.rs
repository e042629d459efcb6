//! SOCKS5 server-side framing: RFC 1928 greeting/request/reply plus the
//! RFC 1929 username/password sub-negotiation.
//!
//! This module only moves bytes; policy (which methods to offer, whether a
//! user may connect) lives in the engine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USERPASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Sub-negotiation version for RFC 1929 username/password auth.
pub const USERPASS_VERSION: u8 = 0x01;
pub const USERPASS_SUCCESS: u8 = 0x00;
pub const USERPASS_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0:#04x}")]
    InvalidVersion(u8),
    #[error("unsupported auth sub-negotiation version {0:#04x}")]
    InvalidAuthVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("username or password is not valid UTF-8")]
    BadCredentialEncoding,
    #[error("domain name is not valid UTF-8")]
    BadDomainEncoding,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination requested by a CONNECT command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestHost {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestAddr {
    pub host: DestHost,
    pub port: u16,
}

impl std::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            DestHost::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            DestHost::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            DestHost::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Read the client greeting and return the offered method set.
pub async fn read_methods<S>(stream: &mut S) -> Result<Vec<u8>, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Answer the greeting with the selected method byte.
pub async fn send_method<S>(stream: &mut S, method: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, method]).await
}

/// Read the RFC 1929 username/password sub-negotiation.
pub async fn read_userpass<S>(stream: &mut S) -> Result<(String, String), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != USERPASS_VERSION {
        return Err(Socks5Error::InvalidAuthVersion(header[0]));
    }

    let mut username = vec![0u8; header[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut password = vec![0u8; len[0] as usize];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8(username).map_err(|_| Socks5Error::BadCredentialEncoding)?;
    let password = String::from_utf8(password).map_err(|_| Socks5Error::BadCredentialEncoding)?;
    Ok((username, password))
}

/// Send the RFC 1929 sub-negotiation status (`01 00` success, `01 01` fail).
pub async fn send_userpass_status<S>(stream: &mut S, status: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[USERPASS_VERSION, status]).await
}

/// Read a request header and its destination address.
///
/// The command byte is returned alongside the address so the engine can
/// reject everything except CONNECT with the proper reply code.
pub async fn read_request<S>(stream: &mut S) -> Result<(u8, DestAddr), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::InvalidVersion(header[0]));
    }
    let command = header[1];
    let atyp = header[3];

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            DestHost::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| Socks5Error::BadDomainEncoding)?;
            DestHost::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            DestHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok((command, DestAddr { host, port }))
}

/// Send a reply with the given code and bound address.
pub async fn send_reply<S>(
    stream: &mut S,
    reply: u8,
    bind_addr: &SocketAddr,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(22);
    buf.push(VERSION);
    buf.push(reply);
    buf.push(0x00); // RSV
    match bind_addr {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    stream.write_all(&buf).await
}

/// Send an error reply with a zeroed bind address (`0.0.0.0:0`).
pub async fn send_reply_unspecified<S>(stream: &mut S, reply: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], 0u16));
    send_reply(stream, reply, &addr).await
}
