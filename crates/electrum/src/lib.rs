//! Electrum JSON-RPC server for the crest node.
//!
//! Speaks JSON-RPC 2.0 (single and batch) over newline-delimited TCP and
//! WebSocket text frames, tracks per-connection subscription state, and
//! fans consensus-driven address status notifications out to
//! subscribers. Chain state is read through the [`Explorer`] and
//! [`TransactionPool`] collaborator traits; consensus changes arrive on
//! a channel owned by the consensus collaborator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crest_types::{ConsensusChange, Explorer, TransactionPool};

pub use error::{Error, RpcError};
pub use jsonrpc::{BatchRequest, Notification, Params, Request, Response};
pub use subscriptions::Update;
pub use version::{ProtocolVersion, SERVER_PROTOCOL_VERSION, SERVER_SOFTWARE_VERSION};

use connection::ServeContext;
use subscriptions::SubscriberHub;
use transport::{TcpTransport, WsTransport};

mod connection;
pub mod error;
pub mod jsonrpc;
mod status;
mod subscriptions;
mod transport;
pub mod version;

pub use status::address_status;

/// Idle clients are closed after this long without a request.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-connection update backlog before a client counts as
/// desynchronised.
const UPDATE_BACKLOG: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen address, if the TCP transport is enabled.
    pub listen_tcp: Option<SocketAddr>,
    /// WebSocket listen address, if the WebSocket transport is enabled.
    pub listen_ws: Option<SocketAddr>,
    /// Keepalive window per connection.
    pub keepalive: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_tcp: Some(([0, 0, 0, 0], 23113).into()),
            listen_ws: None,
            keepalive: CONNECTION_TIMEOUT,
        }
    }
}

/// Addresses the server actually bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenAddrs {
    pub tcp: Option<SocketAddr>,
    pub ws: Option<SocketAddr>,
}

struct ServerShared {
    config: Config,
    explorer: Arc<dyn Explorer>,
    pool: Arc<dyn TransactionPool>,
    hub: Arc<SubscriberHub>,
    tracker: TaskTracker,
}

impl ServerShared {
    fn serve_context(&self, cancellation: CancellationToken, peer: SocketAddr) -> ServeContext {
        ServeContext {
            explorer: self.explorer.clone(),
            pool: self.pool.clone(),
            hub: self.hub.clone(),
            keepalive: self.config.keepalive,
            cancellation,
            tracker: self.tracker.clone(),
            peer: peer.to_string(),
        }
    }
}

/// The Electrum server. Create it, then [`ElectrumServer::run`] it with
/// a cancellation token; [`ElectrumServer::close`] waits for every
/// connection task to wind down after the token fires.
pub struct ElectrumServer {
    shared: Arc<ServerShared>,
    consensus_rx: flume::Receiver<ConsensusChange>,
}

impl ElectrumServer {
    pub fn new(
        config: Config,
        explorer: Arc<dyn Explorer>,
        pool: Arc<dyn TransactionPool>,
        consensus_rx: flume::Receiver<ConsensusChange>,
    ) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                explorer,
                pool,
                hub: Arc::new(SubscriberHub::new(UPDATE_BACKLOG)),
                tracker: TaskTracker::new(),
            }),
            consensus_rx,
        }
    }

    /// Bind the configured transports and start serving. Returns the
    /// bound addresses.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<ListenAddrs, Error> {
        let mut addrs = ListenAddrs::default();

        self.shared.tracker.spawn(subscriptions::run_consensus_consumer(
            self.shared.explorer.clone(),
            self.shared.pool.clone(),
            self.consensus_rx.clone(),
            self.shared.hub.clone(),
            cancellation.clone(),
        ));

        if let Some(listen) = self.shared.config.listen_tcp {
            let listener = TcpListener::bind(listen).await?;
            addrs.tcp = Some(listener.local_addr()?);
            info!("electrum tcp transport listening on {}", addrs.tcp.unwrap());

            self.shared.tracker.spawn(run_tcp_accept_loop(
                self.shared.clone(),
                listener,
                cancellation.clone(),
            ));
        }

        if let Some(listen) = self.shared.config.listen_ws {
            let listener = TcpListener::bind(listen).await?;
            addrs.ws = Some(listener.local_addr()?);
            info!("electrum websocket transport listening on {}", addrs.ws.unwrap());

            self.shared.tracker.spawn(run_ws_accept_loop(
                self.shared.clone(),
                listener,
                cancellation.clone(),
            ));
        }

        Ok(addrs)
    }

    /// Wait until every server task has exited. Call after cancelling
    /// the token passed to [`ElectrumServer::run`].
    pub async fn close(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!("electrum server closed");
    }
}

async fn run_tcp_accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    cancellation: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancellation.cancelled() => return,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("electrum tcp accept failed: {err}");
                    continue;
                }
            },
        };

        debug!("electrum client connected from {peer}");
        let ctx = shared.serve_context(cancellation.clone(), peer);
        shared
            .tracker
            .spawn(connection::serve(TcpTransport::new(stream), ctx));
    }
}

async fn run_ws_accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    cancellation: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancellation.cancelled() => return,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("electrum websocket accept failed: {err}");
                    continue;
                }
            },
        };

        let shared = shared.clone();
        let cancellation = cancellation.clone();
        shared.tracker.clone().spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    debug!("electrum websocket client connected from {peer}");
                    let ctx = shared.serve_context(cancellation, peer);
                    connection::serve(WsTransport::new(ws), ctx).await;
                }
                Err(err) => debug!("websocket handshake with {peer} failed: {err}"),
            }
        });
    }
}
