//! Cadence Config
//!
//! The daemon's configuration: who this host is, which zones it belongs to,
//! which ports it listens on and what environment executed commands receive.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default configuration file
pub const CONF_FILE: &str = "/etc/cadence.conf";

/// Placeholder host name used until one is configured
pub const DEFAULT_SELF: &str = "host.example.com";

/// Control-channel port
pub const DEFAULT_CLIENT_PORT: u16 = 6442;

/// Peer/host port
pub const DEFAULT_HOST_PORT: u16 = 3002;

pub const DEFAULT_LOG_FILE: &str = "cadence.log";

pub const DEFAULT_RECORDS_FILE: &str = "cadence.db";

// ============================================================================
// Zone
// ============================================================================

/// A named group of hosts sharing a port and autonomy setting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub autonomous: bool,
}

impl Zone {
    /// Hosts of this zone other than `self_host`
    pub fn peers<'a>(&'a self, self_host: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.hosts
            .iter()
            .map(String::as_str)
            .filter(move |h| *h != self_host)
    }
}

// ============================================================================
// Conf
// ============================================================================

/// Cadence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conf {
    /// This host's name
    #[serde(rename = "self", default = "default_self")]
    pub self_host: String,

    /// Index into `zones` of the zone this host belongs to
    #[serde(default)]
    pub my_zone: usize,

    #[serde(default = "default_client_port")]
    pub client_port: u16,

    #[serde(default = "default_host_port")]
    pub host_port: u16,

    #[serde(default)]
    pub autonomous: bool,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Where finished-task records of `persist` tasks are stored
    #[serde(default = "default_records_file")]
    pub records_file: PathBuf,

    #[serde(default = "default_zones")]
    pub zones: Vec<Zone>,

    /// Exported to every executed command
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            self_host: default_self(),
            zones: default_zones(),
            my_zone: 0,
            client_port: DEFAULT_CLIENT_PORT,
            host_port: DEFAULT_HOST_PORT,
            autonomous: false,
            log_file: default_log_file(),
            records_file: default_records_file(),
            environment: HashMap::new(),
        }
    }
}

impl Conf {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Parse TOML content
    pub fn parse(content: &str) -> Result<Self> {
        let conf: Conf = toml::from_str(content)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Write the TOML form to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// True for a configuration that was never initialized
    pub fn is_zero(&self) -> bool {
        self.client_port == 0 && self.self_host.is_empty() && self.host_port == 0
    }

    /// The zone this host belongs to
    pub fn my_zone(&self) -> Option<&Zone> {
        self.zones.get(self.my_zone)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if !self.zones.is_empty() && self.my_zone >= self.zones.len() {
            return Err(Error::Config(format!(
                "my_zone index {} out of range ({} zones)",
                self.my_zone,
                self.zones.len()
            )));
        }
        if self.client_port != 0 && self.client_port == self.host_port {
            return Err(Error::Config(format!(
                "client_port and host_port must differ (both {})",
                self.client_port
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn self_host(mut self, host: impl Into<String>) -> Self {
        self.self_host = host.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

fn default_self() -> String {
    DEFAULT_SELF.to_string()
}

fn default_zones() -> Vec<Zone> {
    vec![Zone::default()]
}

fn default_client_port() -> u16 {
    DEFAULT_CLIENT_PORT
}

fn default_host_port() -> u16 {
    DEFAULT_HOST_PORT
}

fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE)
}

fn default_records_file() -> PathBuf {
    PathBuf::from(DEFAULT_RECORDS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Conf::default();
        assert_eq!(conf.self_host, "host.example.com");
        assert_eq!(conf.client_port, 6442);
        assert_eq!(conf.host_port, 3002);
        assert!(!conf.autonomous);
        assert_eq!(conf.zones.len(), 1);
        assert!(conf.my_zone().is_some());
        assert!(!conf.is_zero());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Conf::load(dir.path().join("absent.conf")).unwrap();
        assert_eq!(conf, Conf::default());
    }

    #[test]
    fn test_parse_partial() {
        let conf = Conf::parse(
            r#"
            self = "alpha.local"
            client_port = 7000

            [[zones]]
            hosts = ["alpha.local", "beta.local"]
            port = 3002

            [environment]
            PATH_EXTRA = "/opt/bin"
            "#,
        )
        .unwrap();

        assert_eq!(conf.self_host, "alpha.local");
        assert_eq!(conf.client_port, 7000);
        assert_eq!(conf.host_port, DEFAULT_HOST_PORT);
        assert_eq!(conf.environment.get("PATH_EXTRA").unwrap(), "/opt/bin");

        let peers: Vec<&str> = conf.my_zone().unwrap().peers(&conf.self_host).collect();
        assert_eq!(peers, vec!["beta.local"]);
    }

    #[test]
    fn test_zone_index_out_of_range() {
        let result = Conf::parse("my_zone = 3\n[[zones]]\nhosts = []\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_ports_must_differ() {
        let result = Conf::parse("client_port = 4000\nhost_port = 4000\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cadence.conf");

        let conf = Conf::new().self_host("gamma.local").env("A", "1");
        conf.save(&path).unwrap();

        let loaded = Conf::load(&path).unwrap();
        assert_eq!(loaded, conf);
    }

    #[test]
    fn test_is_zero() {
        let conf = Conf {
            self_host: String::new(),
            client_port: 0,
            host_port: 0,
            ..Conf::default()
        };
        assert!(conf.is_zero());
    }
}
