//! Typed daemon configuration.
//!
//! Loaded from a TOML file. Every key the engines consume is represented
//! here with its documented default, so the rest of the codebase never
//! touches untyped key/value lookups.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_banner")]
    pub banner: String,

    /// Port the SMTP trap listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address of a backup MX whose greylist entries pass on first sight.
    #[serde(default)]
    pub low_prio_mx: Option<String>,

    /// Per-connection inactivity window in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: i64,

    #[serde(default)]
    pub grey: GreyConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default, rename = "blacklist")]
    pub blacklists: Vec<BlacklistConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        for bl in &config.blacklists {
            if bl.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "blacklist.name",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").map_or_else(
            |_| unreachable!("empty config must deserialize"),
            |config| config,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GreyConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Seconds before a retry of a grey tuple is accepted.
    #[serde(default = "default_pass_time")]
    pub pass_time: i64,

    /// Lifetime of a tuple that has not yet passed.
    #[serde(default = "default_grey_expiry")]
    pub grey_expiry: i64,

    /// Lifetime of a whitelist entry.
    #[serde(default = "default_white_exp")]
    pub white_exp: i64,

    /// Lifetime of a trapped entry.
    #[serde(default = "default_trap_expiry")]
    pub trap_expiry: i64,

    /// Seconds between stuttered reply bytes on the tarpit path.
    #[serde(default = "default_stutter")]
    pub stutter: i64,

    #[serde(default = "default_scan_interval")]
    pub db_scan_interval: i64,

    #[serde(default = "default_traplist_name")]
    pub traplist_name: String,

    #[serde(default = "default_traplist_message")]
    pub traplist_message: String,

    /// File of permitted recipient domains, one per line.
    #[serde(default)]
    pub permitted_domains: Option<PathBuf>,

    /// Also consult permitted-domain records stored in the database.
    #[serde(default)]
    pub db_permitted_domains: bool,
}

impl Default for GreyConfig {
    fn default() -> Self {
        toml::from_str("").map_or_else(
            |_| unreachable!("empty grey section must deserialize"),
            |grey| grey,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_sync_port")]
    pub port: u16,

    #[serde(default = "default_sync_ttl")]
    pub ttl: u32,

    /// Unicast peers, resolved by name at startup.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Local address to bind; doubles as the multicast interface address.
    #[serde(default)]
    pub bind_address: Option<String>,

    /// IPv4 multicast group; multicast is enabled when this is set.
    #[serde(default)]
    pub mcast_address: Option<String>,

    #[serde(default = "default_sync_key")]
    pub key: PathBuf,

    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        toml::from_str("").map_or_else(
            |_| unreachable!("empty sync section must deserialize"),
            |sync| sync,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallConfig {
    #[serde(default = "default_fw_driver")]
    pub driver: String,

    /// Cap on concurrently stuttered (blacklisted) connections.
    #[serde(default = "default_max_black")]
    pub max_black: usize,

    /// Cap on concurrent connections overall.
    #[serde(default = "default_max_cons")]
    pub max_cons: usize,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        toml::from_str("").map_or_else(
            |_| unreachable!("empty firewall section must deserialize"),
            |fw| fw,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_driver")]
    pub driver: String,

    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub pass: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        toml::from_str("").map_or_else(
            |_| unreachable!("empty database section must deserialize"),
            |db| db,
        )
    }
}

/// One blacklist definition fed to the registry at startup and on reload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlacklistConfig {
    pub name: String,

    /// Rejection message; `%A` expands to the peer address and a literal
    /// `\n` forces a line break in the reply.
    pub message: String,

    /// SMTP reply code used on the tarpit path.
    #[serde(default = "default_reject_code")]
    pub code: u16,

    #[serde(default)]
    pub cidrs: Vec<String>,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_banner() -> String {
    "greyd IP-based SPAM blocker".to_string()
}

const fn default_timeout() -> i64 {
    400
}

const fn default_port() -> u16 {
    8025
}

const fn default_true() -> bool {
    true
}

const fn default_pass_time() -> i64 {
    25 * 60
}

const fn default_grey_expiry() -> i64 {
    4 * 60 * 60
}

const fn default_white_exp() -> i64 {
    36 * 24 * 60 * 60
}

const fn default_trap_expiry() -> i64 {
    24 * 60 * 60
}

const fn default_stutter() -> i64 {
    10
}

const fn default_scan_interval() -> i64 {
    60
}

fn default_traplist_name() -> String {
    "greyd-greytrap".to_string()
}

fn default_traplist_message() -> String {
    "Your address %A has mailed to spamtraps here".to_string()
}

const fn default_sync_port() -> u16 {
    8025
}

const fn default_sync_ttl() -> u32 {
    1
}

fn default_sync_key() -> PathBuf {
    PathBuf::from("/etc/greyd/greyd.key")
}

fn default_fw_driver() -> String {
    "log".to_string()
}

const fn default_max_black() -> usize {
    800
}

const fn default_max_cons() -> usize {
    800
}

fn default_db_driver() -> String {
    "file".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/greyd")
}

fn default_db_name() -> String {
    "greyd.db".to_string()
}

const fn default_reject_code() -> u16 {
    450
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 8025);
        assert_eq!(config.timeout, 400);
        assert!(config.grey.enable);
        assert_eq!(config.grey.pass_time, 25 * 60);
        assert_eq!(config.grey.white_exp, 36 * 24 * 60 * 60);
        assert_eq!(config.grey.db_scan_interval, 60);
        assert!(!config.sync.enable);
        assert_eq!(config.sync.port, 8025);
        assert_eq!(config.sync.ttl, 1);
        assert_eq!(config.firewall.max_cons, 800);
        assert_eq!(config.database.driver, "file");
        assert!(config.blacklists.is_empty());
    }

    #[test]
    fn parse_full() {
        let config = Config::parse(
            r#"
            hostname = "greyd.org"
            banner = "greyd IP-based SPAM blocker"
            low_prio_mx = "192.179.21.3"

            [grey]
            enable = true
            stutter = 15
            grey_expiry = 3600
            traplist_name = "test traplist"
            traplist_message = "you have been trapped"
            db_permitted_domains = true

            [sync]
            enable = true
            hosts = ["peer1.example.com"]
            mcast_address = "224.0.1.240"
            verify = false

            [firewall]
            driver = "log"
            max_cons = 4
            max_black = 4

            [database]
            driver = "memory"

            [[blacklist]]
            name = "blacklist_1"
            message = "You (%A) are on blacklist 1"
            cidrs = ["10.10.10.1/32"]
            "#,
        )
        .unwrap();

        assert_eq!(config.hostname, "greyd.org");
        assert_eq!(config.low_prio_mx.as_deref(), Some("192.179.21.3"));
        assert_eq!(config.grey.stutter, 15);
        assert_eq!(config.grey.grey_expiry, 3600);
        assert_eq!(config.grey.traplist_name, "test traplist");
        assert!(config.grey.db_permitted_domains);
        assert!(config.sync.enable);
        assert!(!config.sync.verify);
        assert_eq!(config.firewall.max_cons, 4);
        assert_eq!(config.blacklists.len(), 1);
        assert_eq!(config.blacklists[0].code, 450);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::parse("no_such_key = 1").is_err());
    }

    #[test]
    fn rejects_empty_blacklist_name() {
        let raw = r#"
            [[blacklist]]
            name = ""
            message = "m"
        "#;
        assert!(Config::parse(raw).is_err());
    }
}
