//! Live peer connections and the per-peer stream listener.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crest_types::NetAddress;

use crate::handshake::ProtocolVersion;
use crate::mux;
use crate::rpc::{self, Registry};

/// How long an incoming stream may take to announce its handler name.
const NAME_DEADLINE: Duration = Duration::from_secs(10);

/// A connected peer. The gateway owns the peer map; each peer owns its
/// session.
pub(crate) struct Peer {
    pub address: NetAddress,
    pub inbound: bool,
    pub local: bool,
    pub version: ProtocolVersion,
    pub(crate) session: mux::Session,
}

impl Peer {
    pub(crate) fn new(
        address: NetAddress,
        inbound: bool,
        local: bool,
        version: ProtocolVersion,
        session: mux::Session,
    ) -> Self {
        Self {
            address,
            inbound,
            local,
            version,
            session,
        }
    }

    pub(crate) fn close(&self) {
        self.session.close();
    }

    pub(crate) fn info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address.clone(),
            inbound: self.inbound,
            local: self.local,
            version: self.version,
        }
    }
}

/// Diagnostic snapshot of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: NetAddress,
    pub inbound: bool,
    pub local: bool,
    pub version: ProtocolVersion,
}

/// Accept streams from a peer and dispatch them to registered handlers
/// by name. Exits when the session closes or the gateway shuts down.
pub(crate) async fn run_listener(
    session: mux::Session,
    remote: NetAddress,
    handlers: Arc<RwLock<Registry>>,
    tracker: TaskTracker,
    cancellation: CancellationToken,
) {
    loop {
        let mut stream = tokio::select! {
            _ = cancellation.cancelled() => break,
            res = session.accept_stream() => match res {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };

        let name = match timeout(NAME_DEADLINE, rpc::read_name(&mut stream)).await {
            Ok(Ok(name)) => name,
            Ok(Err(err)) => {
                trace!("{remote}: dropping stream with bad rpc preamble: {err}");
                continue;
            }
            Err(_) => {
                trace!("{remote}: dropping stream that never named an rpc");
                continue;
            }
        };

        let handler = handlers
            .read()
            .expect("rpc registry poisoned")
            .get(&name);
        match handler {
            Some(handler) => {
                let remote = remote.clone();
                tracker.spawn(async move {
                    if let Err(err) = handler.handle(stream, remote.clone()).await {
                        debug!("{remote}: rpc {name} failed: {err}");
                    }
                });
            }
            // Unknown names close the stream by dropping it.
            None => trace!("{remote}: ignoring stream for unknown rpc {name}"),
        }
    }
}
