//! End-to-end tests for the three engines.
//!
//! Each test drives a real listener with raw protocol bytes: SOCKS5
//! negotiation frames, an HTTP CONNECT request, or an outer-TLS session
//! carrying an inner ClientHello.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use passage_auth::UserStore;
use passage_bandwidth::Tracker;
use passage_config::{Config, EnvConfig};
use passage_server::{
    CancellationToken, Engine, HttpEngine, ReloadableCert, SignalEngine, Socks5Engine,
};

// ============================================================================
// Helpers
// ============================================================================

/// A TCP server that echoes everything back.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

struct TestEnv {
    users: Arc<UserStore>,
    tracker: Arc<Tracker>,
    env: EnvConfig,
    // Keeps the temp files alive for the duration of the test.
    _dir: tempfile::TempDir,
}

/// users.json with alice (rpm 100), bob (1 GiB cap), and no IP whitelist.
fn test_env() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let hash = passage_auth::hash_password("pw", 4).unwrap();
    let users_path = dir.path().join("users.json");
    let json = format!(
        r#"{{
            "users": [
                {{"username": "alice", "role": "user", "password_hash": "{hash}",
                  "rate_limit_rpm": 100, "enabled": true}},
                {{"username": "bob", "role": "user", "password_hash": "{hash}",
                  "rate_limit_rpm": 0, "bandwidth_limit_gb": 1, "enabled": true}}
            ],
            "ip_whitelist": [],
            "super_admin_ips": []
        }}"#
    );
    std::fs::write(&users_path, json).unwrap();

    let users = Arc::new(UserStore::load(&users_path).unwrap());
    let tracker = Arc::new(Tracker::new(dir.path().join("bandwidth_usage.json")));

    let env = EnvConfig::from_lookup(|key| match key {
        "HTTP_PROXY_PORT" => Some("127.0.0.1:0".to_string()),
        "HTTP_PROXY_TLS" => Some("false".to_string()),
        "SOCKS5_PORT" => Some("127.0.0.1:0".to_string()),
        "PAC_ENABLED" => Some("false".to_string()),
        _ => None,
    });

    TestEnv {
        users,
        tracker,
        env,
        _dir: dir,
    }
}

async fn wait_bound(get: impl Fn() -> Option<SocketAddr>) -> SocketAddr {
    for _ in 0..300 {
        if let Some(addr) = get() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine did not bind in time");
}

fn start_socks5(test: &TestEnv) -> (Arc<Socks5Engine>, CancellationToken) {
    let engine = Arc::new(Socks5Engine::new(
        "127.0.0.1:0".to_string(),
        test.users.clone(),
        test.tracker.clone(),
        Arc::new(Semaphore::new(64)),
        Duration::from_secs(30),
    ));
    let token = CancellationToken::new();
    let run = engine.clone();
    let cancel = token.clone();
    tokio::spawn(async move { run.run(cancel).await });
    (engine, token)
}

/// Drive the SOCKS5 greeting and RFC 1929 sub-negotiation.
async fn socks5_authenticate(stream: &mut TcpStream, user: &str, pass: &str) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02], "server must select username/password");

    let mut frame = vec![0x01, user.len() as u8];
    frame.extend_from_slice(user.as_bytes());
    frame.push(pass.len() as u8);
    frame.extend_from_slice(pass.as_bytes());
    stream.write_all(&frame).await.unwrap();

    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x01);
    reply[1]
}

/// Send a CONNECT request for an IPv4 target and return the reply code.
async fn socks5_connect(stream: &mut TcpStream, target: SocketAddr) -> u8 {
    let SocketAddr::V4(v4) = target else {
        panic!("test targets are IPv4");
    };
    let mut frame = vec![0x05, 0x01, 0x00, 0x01];
    frame.extend_from_slice(&v4.ip().octets());
    frame.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&frame).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[3], 0x01, "bind address is IPv4");
    reply[1]
}

// ============================================================================
// SOCKS5
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks5_round_trip() {
    let test = test_env();
    let echo = start_echo_server().await;
    let (engine, token) = start_socks5(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(socks5_authenticate(&mut stream, "alice", "pw").await, 0x00);
    assert_eq!(socks5_connect(&mut stream, echo).await, 0x00);

    stream.write_all(b"ping through socks").await.unwrap();
    let mut buf = [0u8; 18];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping through socks");

    drop(stream);
    // The relay reports its bytes to the tracker when the session ends.
    for _ in 0..100 {
        if test.tracker.usage("alice").total_bytes >= 36 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let usage = test.tracker.usage("alice");
    assert_eq!(usage.bytes_up, 18);
    assert_eq!(usage.bytes_down, 18);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks5_rejects_bad_password() {
    let test = test_env();
    let (engine, token) = start_socks5(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(
        socks5_authenticate(&mut stream, "alice", "wrong").await,
        0x01
    );

    // The server closes after the failure reply.
    let mut buf = [0u8; 1];
    match stream.read(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
    }

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks5_bandwidth_cap_replies_host_unreachable() {
    let test = test_env();
    let echo = start_echo_server().await;
    // bob has a 1 GiB monthly cap; burn it before connecting.
    test.tracker.record("bob", 1 << 30, 0);

    let (engine, token) = start_socks5(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(socks5_authenticate(&mut stream, "bob", "pw").await, 0x00);
    assert_eq!(socks5_connect(&mut stream, echo).await, 0x04);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks5_rejects_unsupported_command() {
    let test = test_env();
    let (engine, token) = start_socks5(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(socks5_authenticate(&mut stream, "alice", "pw").await, 0x00);

    // BIND is not supported.
    let mut frame = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1];
    frame.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&frame).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07, "command not supported");

    token.cancel();
}

// ============================================================================
// HTTP proxy
// ============================================================================

fn start_http(test: &TestEnv) -> (Arc<HttpEngine>, CancellationToken) {
    let engine = Arc::new(HttpEngine::new(
        test.env.clone(),
        test.users.clone(),
        test.tracker.clone(),
        None,
        Arc::new(Semaphore::new(64)),
        Duration::from_secs(30),
    ));
    let token = CancellationToken::new();
    let run = engine.clone();
    let cancel = token.clone();
    tokio::spawn(async move { run.run(cancel).await });
    (engine, token)
}

/// Read one HTTP response head (through the blank line).
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before response head completed");
        head.push(byte[0]);
        assert!(head.len() < 16 * 1024, "response head unreasonably large");
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_connect_tunnels_and_accounts_bytes() {
    let test = test_env();
    let echo = start_echo_server().await;
    let (engine, token) = start_http(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // base64("alice:pw") = YWxpY2U6cHc=
    let request = format!(
        "CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: Basic YWxpY2U6cHc=\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");

    stream.write_all(b"tunnel payload").await.unwrap();
    let mut buf = [0u8; 14];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel payload");

    drop(stream);
    for _ in 0..100 {
        if test.tracker.usage("alice").total_bytes >= 28 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(test.tracker.usage("alice").bytes_up, 14);
    assert_eq!(test.tracker.usage("alice").bytes_down, 14);

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_missing_credentials_get_407() {
    let test = test_env();
    let (engine, token) = start_http(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 407"), "unexpected response: {head}");
    assert!(
        head.to_lowercase().contains("proxy-authenticate: basic"),
        "407 must carry a Proxy-Authenticate challenge: {head}"
    );

    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_wrong_password_gets_407() {
    let test = test_env();
    let (engine, token) = start_http(&test);
    let addr = wait_bound(|| engine.bound_addr()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // base64("alice:wrong") = YWxpY2U6d3Jvbmc=
    stream
        .write_all(
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\
              Proxy-Authorization: Basic YWxpY2U6d3Jvbmc=\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 407"), "unexpected response: {head}");

    token.cancel();
}

// ============================================================================
// Signal tunnel
// ============================================================================

/// Assemble a minimal ClientHello record carrying `host` as the SNI.
fn client_hello_with_sni(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    let mut ext_body = Vec::new();
    ext_body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext_body.push(0x00);
    ext_body.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext_body.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0x0000u16.to_be_bytes());
    extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&ext_body);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    let len = (body.len() as u32).to_be_bytes();
    handshake.extend_from_slice(&len[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

struct SignalHarness {
    engine: Arc<SignalEngine>,
    token: CancellationToken,
    connector: tokio_rustls::TlsConnector,
    _dir: tempfile::TempDir,
}

/// Start a Signal engine with a self-signed cert and an allow-list mapping
/// `chat.example` to the echo server; returns a client connector trusting
/// that cert.
async fn start_signal(echo: SocketAddr) -> SignalHarness {
    use rcgen::{generate_simple_self_signed, CertifiedKey as RcgenKey};
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    let dir = tempfile::tempdir().unwrap();
    let RcgenKey {
        cert, signing_key, ..
    } = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("server.crt");
    let key_path = dir.path().join("server.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, signing_key.serialize_pem()).unwrap();

    let config = Config {
        listen: "127.0.0.1:0".to_string(),
        cert_file: cert_path.display().to_string(),
        key_file: key_path.display().to_string(),
        timeout_sec: 30,
        max_conns: 64,
        metrics_listen: None,
        hosts: [("chat.example".to_string(), echo.to_string())]
            .into_iter()
            .collect(),
    };

    let tls = ReloadableCert::load(&config.cert_file, &config.key_file).unwrap();
    let engine = Arc::new(SignalEngine::new(
        Arc::new(config),
        tls,
        Arc::new(Semaphore::new(64)),
    ));
    let token = CancellationToken::new();
    let run = engine.clone();
    let cancel = token.clone();
    tokio::spawn(async move { run.run(cancel).await });

    let mut roots = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(std::fs::File::open(&cert_path).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    SignalHarness {
        engine,
        token,
        connector,
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_relays_allowlisted_sni() {
    use tokio_rustls::rustls::pki_types::ServerName;

    let echo = start_echo_server().await;
    let harness = start_signal(echo).await;
    let addr = wait_bound(|| harness.engine.bound_addr()).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = harness.connector.connect(server_name, tcp).await.unwrap();

    // The inner hello reaches the upstream verbatim as its first bytes;
    // the echo server sends it straight back through the tunnel.
    let hello = client_hello_with_sni("chat.example");
    tls.write_all(&hello).await.unwrap();

    let mut buf = vec![0u8; hello.len()];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, hello);

    // And the tunnel stays open for follow-up bytes.
    tls.write_all(b"after-hello").await.unwrap();
    let mut buf = [0u8; 11];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after-hello");

    harness.token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_closes_unauthorized_sni() {
    use tokio_rustls::rustls::pki_types::ServerName;

    let echo = start_echo_server().await;
    let harness = start_signal(echo).await;
    let addr = wait_bound(|| harness.engine.bound_addr()).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = harness.connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(&client_hello_with_sni("evil.example"))
        .await
        .unwrap();

    // No upstream dial, no bytes back; the session just ends.
    let mut buf = [0u8; 1];
    match tls.read(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, read {n} bytes"),
    }

    harness.token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_answers_plain_http_inband() {
    use tokio_rustls::rustls::pki_types::ServerName;

    let echo = start_echo_server().await;
    let harness = start_signal(echo).await;
    let addr = wait_bound(|| harness.engine.bound_addr()).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = harness.connector.connect(server_name, tcp).await.unwrap();

    tls.write_all(b"GET /api/stats HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match tls.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
    }
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");

    harness.token.cancel();
}
