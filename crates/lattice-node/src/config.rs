//! TOML-based configuration for the node service.
//!
//! Raw string fields are kept as written in the file and converted into
//! domain types (network IDs, CIDRs, socket addresses) by the accessors
//! at the bottom, so a malformed entry is reported with its section and
//! value rather than as a serde type error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use lattice_core::{InetCidr, NetworkId, NodeAddr};

use crate::error::ServiceError;
use crate::networks::NetworkSettings;
use crate::paths::LocalConfig;

/// Top-level service configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub physical: PhysicalSection,
    #[serde(default)]
    pub networks: Vec<NetworkEntry>,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

/// The `[service]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    /// Home directory for identity, cached configs, and the auth token.
    /// Defaults to `~/.lattice`.
    pub home_path: Option<String>,
    /// Primary UDP port; 0 means hunt for a random one.
    #[serde(default)]
    pub primary_port: u16,
    /// Secondary UDP port; 0 derives one from the node address.
    #[serde(default)]
    pub secondary_port: u16,
    /// Port-mapping UDP port; 0 probes upward from the secondary.
    #[serde(default)]
    pub mapping_port: u16,
    #[serde(default = "default_true")]
    pub allow_network_caching: bool,
    #[serde(default = "default_true")]
    pub allow_peer_caching: bool,
    /// Whether the `[physical]` and `[[peers]]` tables are honored.
    #[serde(default)]
    pub allow_local_conf: bool,
    #[serde(default = "default_true")]
    pub port_mapping: bool,
    /// Nonzero enables multipath and tightens refresh intervals.
    #[serde(default)]
    pub multipath_mode: u32,
}

fn default_true() -> bool {
    true
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            home_path: None,
            primary_port: 0,
            secondary_port: 0,
            mapping_port: 0,
            allow_network_caching: true,
            allow_peer_caching: true,
            allow_local_conf: false,
            port_mapping: true,
            multipath_mode: 0,
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// The `[physical]` section: binding and blacklist policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhysicalSection {
    #[serde(default)]
    pub interface_prefix_blacklist: Vec<String>,
    #[serde(default)]
    pub blacklist_v4: Vec<String>,
    #[serde(default)]
    pub blacklist_v6: Vec<String>,
    /// When non-empty, bind exactly these endpoints instead of
    /// enumerating interfaces.
    #[serde(default)]
    pub explicit_bind: Vec<String>,
    #[serde(default)]
    pub allow_management_from: Vec<String>,
}

/// A `[[networks]]` entry: per-network managed-address policy.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkEntry {
    /// 16-hex-digit network ID.
    pub nwid: String,
    #[serde(default = "default_true")]
    pub allow_managed: bool,
    #[serde(default)]
    pub allow_global: bool,
    #[serde(default)]
    pub allow_default: bool,
    #[serde(default)]
    pub allow_managed_whitelist: Vec<String>,
}

/// A `[[peers]]` entry: operator hints and blacklists for one peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    /// 10-hex-digit node address.
    pub address: String,
    /// Preferred remote endpoints to try for this peer.
    #[serde(default, rename = "try")]
    pub try_addrs: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ServiceError> {
        toml::from_str(s).map_err(|e| ServiceError::Config(format!("failed to parse config: {e}")))
    }

    /// The effective home directory.
    pub fn home_path(&self) -> PathBuf {
        match &self.service.home_path {
            Some(p) => PathBuf::from(p),
            None => platform_default_home_path(),
        }
    }

    /// Explicit bind endpoints, parsed.
    pub fn explicit_bind(&self) -> Result<Vec<SocketAddr>, ServiceError> {
        self.physical
            .explicit_bind
            .iter()
            .map(|s| parse_socket_addr(s))
            .collect()
    }

    /// Build the memoized local-config tables. When `allow_local_conf`
    /// is off, the `[physical]` blacklists and all `[[peers]]` entries
    /// are ignored.
    pub fn local_config(&self) -> Result<LocalConfig, ServiceError> {
        let mut local = LocalConfig::default();
        if !self.service.allow_local_conf {
            if !self.peers.is_empty()
                || !self.physical.blacklist_v4.is_empty()
                || !self.physical.blacklist_v6.is_empty()
            {
                tracing::warn!(
                    "local configuration tables present but allow_local_conf is off; ignoring"
                );
            }
            return Ok(local);
        }

        local.interface_prefix_blacklist = self.physical.interface_prefix_blacklist.clone();
        for s in &self.physical.blacklist_v4 {
            local.global_v4_blacklist.push(parse_cidr(s)?);
        }
        for s in &self.physical.blacklist_v6 {
            local.global_v6_blacklist.push(parse_cidr(s)?);
        }
        for s in &self.physical.allow_management_from {
            local.allow_management_from.push(parse_cidr(s)?);
        }

        for entry in &self.peers {
            let peer = parse_node_addr(&entry.address)?;
            for s in &entry.try_addrs {
                let addr = parse_socket_addr(s)?;
                if addr.is_ipv4() {
                    local.v4_hints.entry(peer).or_default().push(addr);
                } else {
                    local.v6_hints.entry(peer).or_default().push(addr);
                }
            }
            for s in &entry.blacklist {
                let cidr = parse_cidr(s)?;
                match cidr.addr() {
                    std::net::IpAddr::V4(_) => {
                        local.v4_blacklists.entry(peer).or_default().push(cidr)
                    }
                    std::net::IpAddr::V6(_) => {
                        local.v6_blacklists.entry(peer).or_default().push(cidr)
                    }
                }
            }
        }
        Ok(local)
    }

    /// Per-network managed-address policy, keyed by network ID.
    pub fn network_settings(&self) -> Result<HashMap<NetworkId, NetworkSettings>, ServiceError> {
        let mut out = HashMap::new();
        for entry in &self.networks {
            let nwid = parse_network_id(&entry.nwid)?;
            let mut whitelist = Vec::new();
            for s in &entry.allow_managed_whitelist {
                whitelist.push(parse_cidr(s)?);
            }
            out.insert(
                nwid,
                NetworkSettings {
                    allow_managed: entry.allow_managed,
                    allow_global: entry.allow_global,
                    allow_default: entry.allow_default,
                    allow_managed_whitelist: whitelist,
                },
            );
        }
        Ok(out)
    }
}

/// The platform default home path (`~/.lattice`, or `./.lattice` when no
/// home directory can be determined).
pub fn platform_default_home_path() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".lattice"),
        None => PathBuf::from(".lattice"),
    }
}

/// Parse a socket address string like "0.0.0.0:9993".
pub fn parse_socket_addr(s: &str) -> Result<SocketAddr, ServiceError> {
    s.parse()
        .map_err(|e| ServiceError::Config(format!("invalid socket address '{s}': {e}")))
}

/// Parse a CIDR string like "10.0.0.0/8".
pub fn parse_cidr(s: &str) -> Result<InetCidr, ServiceError> {
    s.parse()
        .map_err(|e| ServiceError::Config(format!("invalid CIDR '{s}': {e}")))
}

/// Parse a 16-hex-digit network ID.
pub fn parse_network_id(s: &str) -> Result<NetworkId, ServiceError> {
    s.parse()
        .map_err(|e| ServiceError::Config(format!("invalid network ID '{s}': {e}")))
}

/// Parse a 10-hex-digit node address.
pub fn parse_node_addr(s: &str) -> Result<NodeAddr, ServiceError> {
    s.parse()
        .map_err(|e| ServiceError::Config(format!("invalid node address '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = ServiceConfig::parse("").unwrap();
        assert_eq!(config.service.primary_port, 0);
        assert!(config.service.allow_network_caching);
        assert!(config.service.allow_peer_caching);
        assert!(!config.service.allow_local_conf);
        assert!(config.service.port_mapping);
        assert_eq!(config.service.multipath_mode, 0);
        assert_eq!(config.logging.level, "info");
        assert!(config.networks.is_empty());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[service]
home_path = "/var/lib/lattice"
primary_port = 9993
allow_network_caching = false
allow_local_conf = true
multipath_mode = 1

[logging]
level = "debug"

[physical]
interface_prefix_blacklist = ["docker", "veth"]
blacklist_v4 = ["192.0.2.0/24"]
blacklist_v6 = ["2001:db8::/32"]
explicit_bind = ["0.0.0.0:9993"]

[[networks]]
nwid = "8056c2e21c000001"
allow_global = true
allow_default = true
allow_managed_whitelist = ["10.0.0.0/8"]

[[peers]]
address = "a1b2c3d4e5"
try = ["203.0.113.1:9993", "[2001:db8::9]:9993"]
blacklist = ["198.51.100.0/24"]
"#;
        let config = ServiceConfig::parse(toml).unwrap();
        assert_eq!(config.home_path(), PathBuf::from("/var/lib/lattice"));
        assert_eq!(config.service.primary_port, 9993);
        assert!(!config.service.allow_network_caching);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.explicit_bind().unwrap().len(), 1);

        let local = config.local_config().unwrap();
        assert_eq!(local.interface_prefix_blacklist, vec!["docker", "veth"]);
        assert_eq!(local.global_v4_blacklist.len(), 1);
        assert_eq!(local.global_v6_blacklist.len(), 1);

        let peer: NodeAddr = "a1b2c3d4e5".parse().unwrap();
        assert_eq!(local.v4_hints[&peer].len(), 1);
        assert_eq!(local.v6_hints[&peer].len(), 1);
        assert_eq!(local.v4_blacklists[&peer].len(), 1);

        let settings = config.network_settings().unwrap();
        let nwid: NetworkId = "8056c2e21c000001".parse().unwrap();
        assert!(settings[&nwid].allow_global);
        assert!(settings[&nwid].allow_default);
        assert_eq!(settings[&nwid].allow_managed_whitelist.len(), 1);
    }

    #[test]
    fn local_conf_tables_ignored_unless_enabled() {
        let toml = r#"
[physical]
blacklist_v4 = ["192.0.2.0/24"]

[[peers]]
address = "a1b2c3d4e5"
try = ["203.0.113.1:9993"]
"#;
        let config = ServiceConfig::parse(toml).unwrap();
        let local = config.local_config().unwrap();
        assert!(local.global_v4_blacklist.is_empty());
        assert!(local.v4_hints.is_empty());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(ServiceConfig::parse("[service").is_err());
        assert!(ServiceConfig::parse("[service]\nprimary_port = ").is_err());
        assert!(ServiceConfig::parse("[service]\nprimary_port = \"many\"").is_err());
    }

    #[test]
    fn bad_domain_values_are_reported_with_context() {
        let toml = r#"
[service]
allow_local_conf = true

[[peers]]
address = "not-hex"
"#;
        let config = ServiceConfig::parse(toml).unwrap();
        let err = config.local_config().unwrap_err();
        assert!(err.to_string().contains("not-hex"));

        let toml = r#"
[[networks]]
nwid = "zzz"
"#;
        let config = ServiceConfig::parse(toml).unwrap();
        assert!(config.network_settings().is_err());
    }

    #[test]
    fn default_home_is_under_home_dir() {
        let config = ServiceConfig::parse("").unwrap();
        let home = config.home_path();
        assert!(home.ends_with(".lattice"));
    }
}
