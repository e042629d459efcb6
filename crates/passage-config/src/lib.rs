//! Configuration loading: a JSON config file plus an environment overlay.
//!
//! The file carries the Signal-mode essentials (listener, certificate
//! paths, SNI allow-list); the environment selects the proxy mode and the
//! per-engine bind addresses. Unknown file keys are rejected so typos
//! surface at startup instead of silently using defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use passage_core::{DEFAULT_MAX_CONNS, DEFAULT_TIMEOUT_SECS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation: {0}")]
    Validation(String),
}

/// Proxy mode selected through `PROXY_MODE`.
///
/// `https`, `general`, and `http` all start the HTTP + SOCKS5 engine set;
/// anything else falls back to the Signal tunnel, matching the historical
/// behavior of the deployment scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    #[default]
    Signal,
    Https,
    General,
    Http,
}

impl ProxyMode {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "https" => Self::Https,
            "general" => Self::General,
            "http" => Self::Http,
            _ => Self::Signal,
        }
    }

    /// True for every mode that runs the HTTP/SOCKS5 engine set.
    pub fn is_forward_proxy(self) -> bool {
        !matches!(self, Self::Signal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Https => "https",
            Self::General => "general",
            Self::Http => "http",
        }
    }
}

/// Application environment from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    #[default]
    Development,
    Production,
}

impl AppEnv {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" => Self::Production,
            _ => Self::Development,
        }
    }
}

/// The JSON configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Signal-mode listener address.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Certificate chain path (PEM).
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    /// Private key path (PEM).
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Idle relay timeout in seconds.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Global admission capacity.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Prometheus exporter address; metrics are disabled when unset.
    #[serde(default)]
    pub metrics_listen: Option<String>,
    /// SNI → upstream "host:port" allow-list. Keys are case-folded on load.
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            timeout_sec: default_timeout_sec(),
            max_conns: default_max_conns(),
            metrics_listen: None,
            hosts: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from a JSON file, falling back to defaults when the file does
    /// not exist. Parse failures and unknown keys are errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<Config>(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.normalize_hosts();
        Ok(config)
    }

    /// Case-fold and trim SNI keys so lookups can use the parsed SNI
    /// verbatim.
    fn normalize_hosts(&mut self) {
        self.hosts = self
            .hosts
            .drain()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .collect();
    }

    /// Upstream for an SNI, if allow-listed.
    pub fn upstream_for(&self, sni: &str) -> Option<&str> {
        self.hosts.get(&sni.to_lowercase()).map(String::as_str)
    }
}

/// Validate the pieces the selected mode actually uses.
pub fn validate_config(config: &Config, mode: ProxyMode) -> Result<(), ConfigError> {
    let mut errs = Vec::new();

    if config.listen.trim().is_empty() {
        errs.push("listen address is required".to_string());
    }
    if config.timeout_sec == 0 {
        errs.push("timeout_sec must be positive".to_string());
    }
    if config.max_conns == 0 {
        errs.push("max_conns must be positive".to_string());
    }

    // The Signal listener always terminates TLS; the forward-proxy modes
    // load certificate material lazily when their TLS listener is enabled.
    if mode == ProxyMode::Signal {
        if !Path::new(&config.cert_file).exists() {
            errs.push(format!("certificate file not found: {}", config.cert_file));
        }
        if !Path::new(&config.key_file).exists() {
            errs.push(format!("key file not found: {}", config.key_file));
        }
        if config.hosts.is_empty() {
            errs.push("at least one host mapping is required".to_string());
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(errs.join("; ")))
    }
}

/// Environment overlay: mode selection, engine bind addresses, file paths,
/// and the PAC responder knobs.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub app_env: AppEnv,
    pub proxy_mode: ProxyMode,
    pub log_level: String,
    /// Public hostname embedded into generated PAC scripts.
    pub domain: String,

    pub http_proxy_port: String,
    pub http_proxy_tls: bool,
    pub http_proxy_tls_port: String,
    pub socks5_port: String,

    pub users_file: String,
    pub bandwidth_file: String,

    pub pac_enabled: bool,
    pub pac_token: Option<String>,
    pub pac_default_user: Option<String>,
    pub pac_rate_limit_rpm: u32,
}

impl EnvConfig {
    /// Read the overlay from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the overlay through an arbitrary lookup (testable).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get_or = |key: &str, default: &str| -> String {
            match get(key) {
                Some(v) if !v.is_empty() => v,
                _ => default.to_string(),
            }
        };
        let get_bool = |key: &str, default: bool| -> bool {
            match get(key) {
                Some(v) if !v.is_empty() => v.eq_ignore_ascii_case("true"),
                _ => default,
            }
        };

        let app_env = AppEnv::parse(&get_or("APP_ENV", "development"));
        let log_level = get_or(
            "LOG_LEVEL",
            if app_env == AppEnv::Production {
                "info"
            } else {
                "debug"
            },
        );

        Self {
            app_env,
            proxy_mode: ProxyMode::parse(&get_or("PROXY_MODE", "signal")),
            log_level,
            domain: get_or("DOMAIN", "localhost"),
            http_proxy_port: get_or("HTTP_PROXY_PORT", ":8080"),
            http_proxy_tls: get_bool("HTTP_PROXY_TLS", true),
            http_proxy_tls_port: get_or("HTTP_PROXY_TLS_PORT", ":8443"),
            socks5_port: get_or("SOCKS5_PORT", ":1080"),
            users_file: get_or("USERS_FILE", "users.json"),
            bandwidth_file: get_or("BANDWIDTH_FILE", "bandwidth_usage.json"),
            pac_enabled: get_bool("PAC_ENABLED", true),
            pac_token: get("PAC_TOKEN").filter(|v| !v.is_empty()),
            pac_default_user: get("PAC_DEFAULT_USER").filter(|v| !v.is_empty()),
            pac_rate_limit_rpm: get("PAC_RATE_LIMIT_RPM")
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

fn default_listen() -> String {
    ":8443".to_string()
}
fn default_cert_file() -> String {
    "server.crt".to_string()
}
fn default_key_file() -> String {
    "server.key".to_string()
}
fn default_timeout_sec() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_max_conns() -> usize {
    DEFAULT_MAX_CONNS
}
