use std::sync::Arc;
use std::time::Duration;

use eyre::Context;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crest_electrum::ElectrumServer;
use crest_gateway::Gateway;
use crest_types::ConsensusChange;

use crate::chain::ChainView;
use crate::config::NodeConfig;

/// The limit of time to wait for the node to shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Size of the consensus change channel feeding the electrum server.
const CONSENSUS_CHANNEL_SIZE: usize = 1000;

/// Node encapsulates the start of the node's services.
pub struct Node {
    config: NodeConfig,
    gateway: Gateway,
    electrum: ElectrumServer,
    /// Held so the consensus channel stays open for the node's lifetime;
    /// the consensus module publishes its changes through this sender.
    _consensus_tx: flume::Sender<ConsensusChange>,
    cancellation: CancellationToken,
}

impl Node {
    pub async fn new(config: NodeConfig) -> eyre::Result<Self> {
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)
                .wrap_err_with(|| format!("failed to create directory {:?}", config.data_dir))?;
        }

        let gateway = Gateway::new(
            config.gateway.to_gateway_config(config.network, &config.data_dir),
            config.network,
        )?;

        let chain = Arc::new(ChainView::default());
        let (consensus_tx, consensus_rx) = flume::bounded(CONSENSUS_CHANNEL_SIZE);
        let electrum = ElectrumServer::new(
            config.electrum.to_server_config(config.network),
            chain.clone(),
            chain,
            consensus_rx,
        );

        Ok(Self {
            config,
            gateway,
            electrum,
            _consensus_tx: consensus_tx,
            cancellation: CancellationToken::new(),
        })
    }

    /// Wait for the signal from any node's service about the cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        let gateway_addr = self
            .gateway
            .run()
            .await
            .wrap_err("failed to start gateway")?;
        info!("gateway bound to {gateway_addr}");

        let electrum_addrs = self
            .electrum
            .run(self.cancellation.clone())
            .await
            .wrap_err("failed to start electrum server")?;
        if let Some(addr) = electrum_addrs.tcp {
            info!("electrum tcp bound to {addr}");
        }
        if let Some(addr) = electrum_addrs.ws {
            info!("electrum websocket bound to {addr}");
        }

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down node, finishing received requests...");

        self.cancellation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            _ = async {
                self.gateway.close().await;
                self.electrum.close().await;
            } => {},
            _ = sleep(Duration::from_secs(timeout)) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}
