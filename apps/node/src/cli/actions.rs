use tokio::signal;
use tracing::info;

use crate::cli::arguments;
use crate::cli::node::Node;
use crate::config::NodeConfig;

pub async fn run(args: arguments::Run) -> eyre::Result<()> {
    let config = NodeConfig::from_path(args.config)?;
    config.logger.init();

    let node = Node::new(config).await?;
    node.run().await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Interrupt received");
        }
        _ = node.cancelled() => {}
    }

    node.shutdown().await;

    Ok(())
}
