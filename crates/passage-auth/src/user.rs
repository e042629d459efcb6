//! User records and the immutable catalog loaded from `users.json`.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// User role. `super_admin` clients connecting from a trusted CIDR bypass
/// rate, expiry, and quota checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
    SuperAdmin,
}

/// A proxy user as stored in `users.json`.
///
/// All limits use `0` to mean "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub role: Role,
    pub password_hash: String,
    #[serde(default)]
    pub rate_limit_rpm: u32,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub bandwidth_limit_gb: u64,
    #[serde(default)]
    pub bandwidth_speed_mbps: u32,
    #[serde(default)]
    pub max_connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl User {
    /// Whether the account is past its expiry timestamp.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }
}

/// On-disk shape of `users.json`.
#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    ip_whitelist: Vec<String>,
    #[serde(default)]
    super_admin_ips: Vec<String>,
}

/// An immutable snapshot of the user catalog.
///
/// The data plane never mutates a catalog; reloads build a fresh one and
/// swap it in behind the store's lock.
#[derive(Debug, Default)]
pub struct UserCatalog {
    users: HashMap<String, Arc<User>>,
    ip_whitelist: Vec<IpNet>,
    super_admin_ips: Vec<IpNet>,
    super_admin: Option<Arc<User>>,
}

impl UserCatalog {
    /// Load and validate a catalog from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    /// Parse a catalog from JSON text.
    pub fn parse(data: &str) -> Result<Self, AuthError> {
        let file: UsersFile = serde_json::from_str(data)
            .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;

        let mut users = HashMap::with_capacity(file.users.len());
        let mut seen = HashSet::with_capacity(file.users.len());
        let mut super_admin: Option<Arc<User>> = None;

        for user in file.users {
            let key = user.username.to_lowercase();
            // Uniqueness holds across the whole catalog, disabled entries
            // included, so a disabled account cannot shadow a later one.
            if !seen.insert(key.clone()) {
                return Err(AuthError::DuplicateUser(key));
            }
            // Disabled users never authenticate; keep them out of the map.
            if !user.enabled {
                continue;
            }
            let user = Arc::new(user);
            if user.role == Role::SuperAdmin {
                if super_admin.is_some() {
                    return Err(AuthError::InvalidConfig(
                        "more than one super_admin user".into(),
                    ));
                }
                super_admin = Some(user.clone());
            }
            users.insert(key, user);
        }

        Ok(Self {
            users,
            ip_whitelist: parse_cidrs(&file.ip_whitelist)?,
            super_admin_ips: parse_cidrs(&file.super_admin_ips)?,
            super_admin,
        })
    }

    /// Look up an enabled user by case-folded username.
    pub fn get(&self, username: &str) -> Option<&Arc<User>> {
        self.users.get(&username.to_lowercase())
    }

    /// Number of enabled users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// True when the whitelist is empty (allow all) or contains `ip`.
    pub fn client_allowed(&self, ip: IpAddr) -> bool {
        self.ip_whitelist.is_empty() || self.ip_whitelist.iter().any(|net| net.contains(&ip))
    }

    /// The super_admin user, only when one exists and `ip` is inside a
    /// super-admin CIDR.
    pub fn super_admin_for(&self, ip: IpAddr) -> Option<&Arc<User>> {
        let admin = self.super_admin.as_ref()?;
        if self.super_admin_ips.iter().any(|net| net.contains(&ip)) {
            Some(admin)
        } else {
            None
        }
    }

    /// True when `ip` falls inside a super-admin CIDR.
    pub fn is_super_admin_ip(&self, ip: IpAddr) -> bool {
        self.super_admin_ips.iter().any(|net| net.contains(&ip))
    }

    /// Iterate over enabled users.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<User>> {
        self.users.values()
    }
}

/// Parse CIDR entries; a bare IP implies /32 (v4) or /128 (v6).
fn parse_cidrs(entries: &[String]) -> Result<Vec<IpNet>, AuthError> {
    entries.iter().map(|entry| parse_cidr(entry)).collect()
}

fn parse_cidr(entry: &str) -> Result<IpNet, AuthError> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry.parse().map_err(|e: ipnet::AddrParseError| AuthError::InvalidCidr {
            entry: entry.to_string(),
            reason: e.to_string(),
        })
    } else {
        let ip: IpAddr = entry.parse().map_err(|e: std::net::AddrParseError| {
            AuthError::InvalidCidr {
                entry: entry.to_string(),
                reason: e.to_string(),
            }
        })?;
        let prefix = if ip.is_ipv4() { 32 } else { 128 };
        IpNet::new(ip, prefix).map_err(|e| AuthError::InvalidCidr {
            entry: entry.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(json: &str) -> UserCatalog {
        UserCatalog::parse(json).unwrap()
    }

    const SAMPLE: &str = r#"{
        "users": [
            {"username": "Alice", "role": "user", "password_hash": "$2b$04$x", "rate_limit_rpm": 100, "enabled": true},
            {"username": "root", "role": "super_admin", "password_hash": "$2b$04$y", "rate_limit_rpm": 0, "enabled": true},
            {"username": "mallory", "role": "user", "password_hash": "$2b$04$z", "rate_limit_rpm": 10, "enabled": false}
        ],
        "ip_whitelist": ["10.0.0.0/8", "192.168.1.5"],
        "super_admin_ips": ["10.1.0.0/16"]
    }"#;

    #[test]
    fn usernames_are_case_folded() {
        let cat = catalog(SAMPLE);
        assert!(cat.get("alice").is_some());
        assert!(cat.get("ALICE").is_some());
        assert_eq!(cat.get("alice").unwrap().rate_limit_rpm, 100);
    }

    #[test]
    fn disabled_users_are_absent() {
        let cat = catalog(SAMPLE);
        assert!(cat.get("mallory").is_none());
        assert_eq!(cat.len(), 2);
    }

    #[test]
    fn duplicate_after_case_fold_is_rejected() {
        let json = r#"{"users": [
            {"username": "bob", "password_hash": "h", "enabled": true},
            {"username": "Bob", "password_hash": "h", "enabled": true}
        ]}"#;
        match UserCatalog::parse(json) {
            Err(AuthError::DuplicateUser(name)) => assert_eq!(name, "bob"),
            other => panic!("expected DuplicateUser, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_involving_disabled_user_is_rejected() {
        // A disabled entry still claims its username.
        let json = r#"{"users": [
            {"username": "mallory", "password_hash": "h", "enabled": false},
            {"username": "Mallory", "password_hash": "h", "enabled": true}
        ]}"#;
        match UserCatalog::parse(json) {
            Err(AuthError::DuplicateUser(name)) => assert_eq!(name, "mallory"),
            other => panic!("expected DuplicateUser, got {other:?}"),
        }

        let json = r#"{"users": [
            {"username": "mallory", "password_hash": "h", "enabled": false},
            {"username": "MALLORY", "password_hash": "h", "enabled": false}
        ]}"#;
        assert!(matches!(
            UserCatalog::parse(json),
            Err(AuthError::DuplicateUser(_))
        ));
    }

    #[test]
    fn two_super_admins_are_rejected() {
        let json = r#"{"users": [
            {"username": "a", "role": "super_admin", "password_hash": "h", "enabled": true},
            {"username": "b", "role": "super_admin", "password_hash": "h", "enabled": true}
        ]}"#;
        assert!(matches!(
            UserCatalog::parse(json),
            Err(AuthError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bad_cidr_is_rejected() {
        let json = r#"{"users": [], "ip_whitelist": ["10.0.0.0/33"]}"#;
        assert!(matches!(
            UserCatalog::parse(json),
            Err(AuthError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        assert!(matches!(
            UserCatalog::parse("{not json"),
            Err(AuthError::InvalidConfig(_))
        ));
    }

    #[test]
    fn whitelist_bare_ip_implies_host_net() {
        let cat = catalog(SAMPLE);
        assert!(cat.client_allowed("192.168.1.5".parse().unwrap()));
        assert!(!cat.client_allowed("192.168.1.6".parse().unwrap()));
        assert!(cat.client_allowed("10.200.0.1".parse().unwrap()));
        assert!(!cat.client_allowed("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_whitelist_allows_all() {
        let cat = catalog(r#"{"users": []}"#);
        assert!(cat.client_allowed("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn super_admin_requires_both_user_and_cidr() {
        let cat = catalog(SAMPLE);
        let admin = cat.super_admin_for("10.1.2.3".parse().unwrap());
        assert_eq!(admin.unwrap().username, "root");
        assert!(cat.super_admin_for("10.2.0.1".parse().unwrap()).is_none());

        // Super-admin CIDR configured but no super_admin user.
        let cat = catalog(
            r#"{"users": [], "super_admin_ips": ["10.1.0.0/16"]}"#,
        );
        assert!(cat.super_admin_for("10.1.2.3".parse().unwrap()).is_none());
    }

    #[test]
    fn expiry_check() {
        let json = r#"{"users": [
            {"username": "old", "password_hash": "h", "enabled": true,
             "expires_at": "2020-01-01T00:00:00Z"},
            {"username": "new", "password_hash": "h", "enabled": true,
             "expires_at": "2999-01-01T00:00:00Z"}
        ]}"#;
        let cat = catalog(json);
        let now = Utc::now();
        assert!(cat.get("old").unwrap().expired(now));
        assert!(!cat.get("new").unwrap().expired(now));
        // No expiry set: never expires.
        let cat = catalog(
            r#"{"users": [{"username": "u", "password_hash": "h", "enabled": true}]}"#,
        );
        assert!(!cat.get("u").unwrap().expired(now));
    }

    #[test]
    fn persist_reload_round_trip() {
        let cat = catalog(SAMPLE);
        // Re-serialize the enabled users and reload: identical catalog.
        let users: Vec<&User> = {
            let mut v: Vec<&User> = cat.iter().map(|u| u.as_ref()).collect();
            v.sort_by(|a, b| a.username.cmp(&b.username));
            v
        };
        let json = serde_json::json!({
            "users": users,
            "ip_whitelist": ["10.0.0.0/8", "192.168.1.5"],
            "super_admin_ips": ["10.1.0.0/16"],
        });
        let reloaded = UserCatalog::parse(&json.to_string()).unwrap();
        assert_eq!(reloaded.len(), cat.len());
        assert_eq!(
            reloaded.get("alice").unwrap().rate_limit_rpm,
            cat.get("alice").unwrap().rate_limit_rpm
        );
        assert!(reloaded.super_admin_for("10.1.0.1".parse().unwrap()).is_some());
    }
}
