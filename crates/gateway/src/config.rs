//! Gateway configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crest_types::NetAddress;

use crate::mux;
use crate::nodes::MAX_NODES;

/// Keep at least this many outbound peers.
pub const WELL_CONNECTED_THRESHOLD: usize = 8;
/// Start kicking inbound peers at this many total peers.
pub const FULLY_CONNECTED_THRESHOLD: usize = 128;
/// Pause between connection attempts and accepted connections.
pub const ACCEPT_INTERVAL: Duration = Duration::from_secs(3);
/// Pause when the node list has nothing to offer.
pub const NO_NODES_DELAY: Duration = Duration::from_secs(20);
/// Pause while the outbound target is met.
pub const WELL_CONNECTED_DELAY: Duration = Duration::from_secs(60);
/// Throttle on node-list writes.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway listens on.
    pub listen: SocketAddr,
    /// Port peers should dial us back on; defaults to the listen port.
    pub advertised_port: Option<u16>,
    /// Addresses seeded into the node table at startup.
    pub bootstrap: Vec<NetAddress>,
    /// Directory holding the node list file.
    pub data_dir: PathBuf,
    pub max_nodes: usize,
    pub well_connected_threshold: usize,
    pub fully_connected_threshold: usize,
    pub accept_interval: Duration,
    pub no_nodes_delay: Duration,
    pub well_connected_delay: Duration,
    pub persist_interval: Duration,
    /// Admit loopback and private addresses into the node table. Meant
    /// for development networks.
    pub allow_local_addresses: bool,
    pub mux: mux::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 23112).into(),
            advertised_port: None,
            bootstrap: Vec::new(),
            data_dir: PathBuf::from("."),
            max_nodes: MAX_NODES,
            well_connected_threshold: WELL_CONNECTED_THRESHOLD,
            fully_connected_threshold: FULLY_CONNECTED_THRESHOLD,
            accept_interval: ACCEPT_INTERVAL,
            no_nodes_delay: NO_NODES_DELAY,
            well_connected_delay: WELL_CONNECTED_DELAY,
            persist_interval: PERSIST_INTERVAL,
            allow_local_addresses: false,
            mux: mux::Config::default(),
        }
    }
}
