use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crest_gateway::config as gateway_config;
use crest_types::{NetAddress, Network};

#[derive(Deserialize)]
pub struct GatewayConfig {
    /// Listen address; the port defaults to the network's gateway port.
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Port peers should dial back; defaults to the listen port.
    #[serde(default)]
    pub advertised_port: Option<u16>,

    #[serde(default)]
    pub bootstrap: Vec<NetAddress>,

    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    #[serde(default = "default_well_connected")]
    pub well_connected_threshold: usize,

    #[serde(default = "default_fully_connected")]
    pub fully_connected_threshold: usize,

    /// Admit loopback and private peer addresses; meant for devnets.
    #[serde(default)]
    pub allow_local_addresses: bool,
}

fn default_max_nodes() -> usize {
    crest_gateway::MAX_NODES
}

fn default_well_connected() -> usize {
    gateway_config::WELL_CONNECTED_THRESHOLD
}

fn default_fully_connected() -> usize {
    gateway_config::FULLY_CONNECTED_THRESHOLD
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: None,
            advertised_port: None,
            bootstrap: Vec::new(),
            max_nodes: default_max_nodes(),
            well_connected_threshold: default_well_connected(),
            fully_connected_threshold: default_fully_connected(),
            allow_local_addresses: false,
        }
    }
}

impl GatewayConfig {
    pub fn to_gateway_config(&self, network: Network, data_dir: &Path) -> gateway_config::Config {
        gateway_config::Config {
            listen: self
                .listen
                .unwrap_or_else(|| ([0, 0, 0, 0], network.default_port()).into()),
            advertised_port: self.advertised_port,
            bootstrap: self.bootstrap.clone(),
            data_dir: data_dir.join("gateway"),
            max_nodes: self.max_nodes,
            well_connected_threshold: self.well_connected_threshold,
            fully_connected_threshold: self.fully_connected_threshold,
            allow_local_addresses: self.allow_local_addresses
                || network == Network::Devnet,
            ..gateway_config::Config::default()
        }
    }
}
