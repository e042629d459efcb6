//! Proxy auto-config responder.
//!
//! Serves a generated PAC script on the HTTP proxy listener. Credentials
//! are only embedded when the caller supplies a password that validates;
//! otherwise the script carries host:port alone and the browser negotiates
//! auth itself. Optionally gated by a shared token and a per-IP
//! minute-window rate limit (Android refetches the PAC aggressively, hence
//! the cache header).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{header, Method, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use parking_lot::Mutex;
use tracing::{debug, warn};

use passage_auth::UserStore;
use passage_config::EnvConfig;

use crate::engine::http::{full, text_response};

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

struct RateWindow {
    count: u32,
    started: Instant,
}

pub struct PacHandler {
    proxy_host: String,
    http_port: String,
    socks5_port: String,
    token: Option<String>,
    default_user: Option<String>,
    rate_limit_rpm: u32,
    users: Arc<UserStore>,
    windows: Mutex<HashMap<IpAddr, RateWindow>>,
}

impl PacHandler {
    pub fn new(env: &EnvConfig, users: Arc<UserStore>) -> Self {
        Self {
            proxy_host: env.domain.clone(),
            http_port: env.http_proxy_port.trim_start_matches(':').to_string(),
            socks5_port: env.socks5_port.trim_start_matches(':').to_string(),
            token: env.pac_token.clone(),
            default_user: env.pac_default_user.clone(),
            rate_limit_rpm: env.pac_rate_limit_rpm,
            users,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(
        &self,
        method: &Method,
        uri: &Uri,
        peer: IpAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if method != Method::GET {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        if self.rate_limit_rpm > 0 && !self.check_rate_limit(peer) {
            warn!(peer = %peer, "PAC rate limited");
            return text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
        }

        let query = parse_query(uri.query().unwrap_or(""));

        if let Some(expected) = &self.token {
            if query.get("token").map(String::as_str) != Some(expected.as_str()) {
                warn!(peer = %peer, "PAC invalid token");
                return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
            }
        }

        let username = query
            .get("user")
            .cloned()
            .or_else(|| self.default_user.clone());
        let Some(username) = username else {
            return self.pac_response(error_script("No user specified. Use ?user=USERNAME"));
        };

        match query.get("pass") {
            None => {
                // No password: host:port only, browser prompts for auth.
                debug!(peer = %peer, user = %username, "PAC served without credentials");
                self.pac_response(self.placeholder_script(&username))
            }
            Some(password) => {
                if self.users.validate(&username, password).is_none() {
                    warn!(peer = %peer, user = %username, "PAC invalid credentials");
                    return text_response(StatusCode::UNAUTHORIZED, "Invalid credentials");
                }
                debug!(peer = %peer, user = %username, "PAC served with embedded credentials");
                self.pac_response(self.credential_script(&username, password))
            }
        }
    }

    fn pac_response(&self, script: String) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, PAC_CONTENT_TYPE)
            .header(header::CACHE_CONTROL, "public, max-age=300")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS")
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type")
            .body(full(script))
            .expect("static response headers are valid")
    }

    fn credential_script(&self, username: &str, password: &str) -> String {
        let proxy = format!(
            "{username}:{password}@{}:{}",
            self.proxy_host, self.http_port
        );
        let socks = format!(
            "{username}:{password}@{}:{}",
            self.proxy_host, self.socks5_port
        );
        pac_script(&format!("PROXY {proxy}; SOCKS5 {socks}; DIRECT"), None)
    }

    fn placeholder_script(&self, username: &str) -> String {
        let proxy = format!("{}:{}", self.proxy_host, self.http_port);
        let socks = format!("{}:{}", self.proxy_host, self.socks5_port);
        pac_script(
            &format!("PROXY {proxy}; SOCKS5 {socks}; DIRECT"),
            Some(&format!(
                "PAC for user: {username}. The proxy requires authentication; \
                 your browser or system will prompt for the password."
            )),
        )
    }

    fn check_rate_limit(&self, peer: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let window = windows.entry(peer).or_insert(RateWindow {
            count: 0,
            started: now,
        });
        if now.duration_since(window.started) > Duration::from_secs(60) {
            window.count = 0;
            window.started = now;
        }
        if window.count < self.rate_limit_rpm {
            window.count += 1;
            true
        } else {
            false
        }
    }
}

/// The script body shared by every variant: local nets go DIRECT,
/// everything else through the proxy chain.
fn pac_script(route: &str, comment: Option<&str>) -> String {
    let comment = comment
        .map(|c| format!("    // {c}\n"))
        .unwrap_or_default();
    format!(
        r#"function FindProxyForURL(url, host) {{
{comment}    if (isPlainHostName(host) ||
        shExpMatch(host, "*.local") ||
        isInNet(host, "192.168.0.0", "255.255.0.0") ||
        isInNet(host, "10.0.0.0", "255.0.0.0") ||
        isInNet(host, "172.16.0.0", "255.240.0.0") ||
        host == "localhost" ||
        host == "127.0.0.1") {{
        return "DIRECT";
    }}

    return "{route}";
}}
"#
    )
}

fn error_script(message: &str) -> String {
    format!(
        "// Error: {message}\nfunction FindProxyForURL(url, host) {{\n    return \"DIRECT\";\n}}\n"
    )
}

/// Minimal query-string parse with percent decoding.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
