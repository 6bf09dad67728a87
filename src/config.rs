//! Daemon configuration: TOML file with CLI overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Top-level configuration for the meshwire daemon.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub tun: TunConfig,
}

/// Mesh node settings.
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// Peer roster: one host per line.
    #[serde(default = "default_peer_file")]
    pub peer_file: PathBuf,
    /// TCP port every node listens on and dials peers at.
    #[serde(default = "default_port")]
    pub listen_port: u16,
    /// This node's own IPv4 mesh address (dial tie-breaking).
    pub self_v4: Option<Ipv4Addr>,
    /// This node's own IPv6 mesh address.
    pub self_v6: Option<Ipv6Addr>,
    /// Kernel ipset mirroring the live peer set.
    #[serde(default = "default_ipset")]
    pub ipset: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_file: default_peer_file(),
            listen_port: default_port(),
            self_v4: None,
            self_v6: None,
            ipset: default_ipset(),
        }
    }
}

/// TUN interface settings.
#[derive(Debug, Deserialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,
    /// Interface address; falls back to the node's IPv4 mesh address.
    pub address: Option<Ipv4Addr>,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: None,
            netmask: default_netmask(),
            mtu: default_mtu(),
        }
    }
}

fn default_peer_file() -> PathBuf {
    PathBuf::from("/etc/meshwire/peers")
}
fn default_port() -> u16 {
    4747
}
fn default_ipset() -> String {
    "meshwire".to_string()
}
fn default_tun_name() -> String {
    "mesh0".to_string()
}
fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}
fn default_mtu() -> u16 {
    1420
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from the default paths or fall back to built-in defaults.
    pub fn load_or_default() -> Self {
        let paths = ["/etc/meshwire/config.toml", "./meshwire.toml"];
        for path in paths {
            if Path::new(path).exists() {
                if let Ok(config) = Self::load(path) {
                    return config;
                }
            }
        }
        Self::default()
    }
}
