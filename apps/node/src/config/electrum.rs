use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crest_types::Network;

#[derive(Deserialize)]
pub struct ElectrumConfig {
    /// TCP listen address; the port defaults to the network's electrum
    /// port. Set `enable_tcp = false` to turn the transport off.
    #[serde(default)]
    pub listen_tcp: Option<SocketAddr>,

    #[serde(default = "default_true")]
    pub enable_tcp: bool,

    /// WebSocket listen address; the transport stays off unless set.
    #[serde(default)]
    pub listen_ws: Option<SocketAddr>,

    /// Seconds of silence before an idle client is dropped.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    crest_electrum::CONNECTION_TIMEOUT.as_secs()
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self {
            listen_tcp: None,
            enable_tcp: true,
            listen_ws: None,
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl ElectrumConfig {
    pub fn to_server_config(&self, network: Network) -> crest_electrum::Config {
        let listen_tcp = if self.enable_tcp {
            Some(
                self.listen_tcp
                    .unwrap_or_else(|| ([0, 0, 0, 0], network.default_electrum_port()).into()),
            )
        } else {
            None
        };

        crest_electrum::Config {
            listen_tcp,
            listen_ws: self.listen_ws,
            keepalive: Duration::from_secs(self.keepalive_secs),
        }
    }
}
