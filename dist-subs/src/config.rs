//! `dist_subs.conf` loading.
//!
//! The file is TOML. Only `fault_tolerance_level` is usually present; the
//! optional `[cluster]` table moves the cluster to other hosts or ports.
//!
//! ```toml
//! fault_tolerance_level = 2
//!
//! [cluster]
//! host = "127.0.0.1"
//! node_ids = [1, 2, 3]
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::membership::{ClusterMembership, NodeId, PortBases};

pub const DEFAULT_CONFIG_PATH: &str = "dist_subs.conf";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DistSubsConfig {
    #[serde(default = "default_fault_tolerance_level")]
    pub fault_tolerance_level: i32,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_node_ids")]
    pub node_ids: Vec<NodeId>,
    #[serde(default = "default_admin_port_base")]
    pub admin_port_base: u16,
    #[serde(default = "default_client_port_base")]
    pub client_port_base: u16,
    #[serde(default = "default_peer_port_base")]
    pub peer_port_base: u16,
}

impl Default for DistSubsConfig {
    fn default() -> Self {
        Self {
            fault_tolerance_level: default_fault_tolerance_level(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            node_ids: default_node_ids(),
            admin_port_base: default_admin_port_base(),
            client_port_base: default_client_port_base(),
            peer_port_base: default_peer_port_base(),
        }
    }
}

fn default_fault_tolerance_level() -> i32 {
    1
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_node_ids() -> Vec<NodeId> {
    vec![1, 2, 3]
}

fn default_admin_port_base() -> u16 {
    PortBases::default().admin
}

fn default_client_port_base() -> u16 {
    PortBases::default().client
}

fn default_peer_port_base() -> u16 {
    PortBases::default().peer
}

impl DistSubsConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid dist_subs configuration")?;
        ensure!(
            config.fault_tolerance_level >= 0,
            "fault_tolerance_level must not be negative, got {}",
            config.fault_tolerance_level
        );
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Loads `path` if given; otherwise the default file when it exists,
    /// falling back to built-in defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn membership(&self) -> Result<ClusterMembership> {
        let bases = PortBases {
            admin: self.cluster.admin_port_base,
            client: self.cluster.client_port_base,
            peer: self.cluster.peer_port_base,
        };
        ClusterMembership::new(self.cluster.host, bases, self.cluster.node_ids.clone())
    }
}
