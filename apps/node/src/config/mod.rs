use config::Config;
use serde::Deserialize;

use crest_types::Network;

use std::path::PathBuf;

mod electrum;
pub use electrum::ElectrumConfig;

mod gateway;
pub use gateway::GatewayConfig;

mod logger;
pub use logger::LoggerConfig;

#[derive(Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: Network,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub electrum: ElectrumConfig,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    #[serde(default)]
    pub logger: LoggerConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".crest")
}

impl NodeConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
