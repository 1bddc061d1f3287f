//! Handler registration and name-framed dispatch over peer streams.
//!
//! Every stream a peer opens starts with a length-prefixed handler name;
//! what follows on the stream belongs to the handler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crest_types::NetAddress;

use crate::error::Error;
use crate::mux;
use crate::wire;

/// Upper bound on a handler name.
pub const MAX_RPC_NAME_LEN: usize = 16;

/// A handler serving streams opened by remote peers.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Serve one stream. Reads and writes on the stream are the
    /// handler's own business; returning drops (and thereby closes) it.
    async fn handle(&self, stream: mux::Stream, remote: NetAddress) -> Result<(), Error>;
}

/// An RPC the peer manager fires against every freshly connected
/// outbound peer, on a stream of its own.
#[async_trait]
pub trait InitRpc: Send + Sync {
    async fn call(&self, stream: mux::Stream, remote: NetAddress) -> Result<(), Error>;
}

/// Registered handlers, in stable registration order.
#[derive(Default)]
pub(crate) struct Registry {
    handlers: Vec<(String, Arc<dyn RpcHandler>)>,
    init_rpcs: Vec<(String, Arc<dyn InitRpc>)>,
}

impl Registry {
    /// Register a handler under `name`. The first registration wins;
    /// later ones are refused.
    pub(crate) fn register(&mut self, name: &str, handler: Arc<dyn RpcHandler>) -> bool {
        if name.is_empty() || name.len() > MAX_RPC_NAME_LEN {
            warn!("refusing rpc registration with invalid name {name:?}");
            return false;
        }
        if self.handlers.iter().any(|(n, _)| n == name) {
            warn!("rpc {name} is already registered");
            return false;
        }

        self.handlers.push((name.to_owned(), handler));
        true
    }

    pub(crate) fn register_init(&mut self, name: &str, rpc: Arc<dyn InitRpc>) -> bool {
        if name.is_empty() || name.len() > MAX_RPC_NAME_LEN {
            warn!("refusing init-rpc registration with invalid name {name:?}");
            return false;
        }
        if self.init_rpcs.iter().any(|(n, _)| n == name) {
            warn!("init-rpc {name} is already registered");
            return false;
        }

        self.init_rpcs.push((name.to_owned(), rpc));
        true
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handler)| handler.clone())
    }

    /// Init-RPCs in registration order.
    pub(crate) fn init_rpcs(&self) -> Vec<(String, Arc<dyn InitRpc>)> {
        self.init_rpcs.clone()
    }
}

/// Write the handler-name preamble of an outgoing RPC stream.
pub(crate) async fn write_name<W>(stream: &mut W, name: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    wire::write_short_string(stream, name, MAX_RPC_NAME_LEN).await
}

/// Read the handler-name preamble of an incoming stream.
pub(crate) async fn read_name<R>(stream: &mut R) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    wire::read_short_string(stream, MAX_RPC_NAME_LEN).await
}
