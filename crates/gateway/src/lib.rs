//! Peer-to-peer overlay for the crest node.
//!
//! The gateway discovers peers, performs versioned handshakes,
//! multiplexes streams over one TCP connection per peer, dispatches
//! name-framed RPCs over those streams, and keeps the mesh well
//! connected. It persists nothing beyond a node list file.

pub use config::Config;
pub use error::Error;
pub use gateway::{Gateway, PROTOCOL_VERSION};
pub use handshake::{InstanceId, ProtocolVersion, VersionHeader, MIN_ACCEPTED_VERSION};
pub use nodes::{Node, NodeTable, MAX_NODES};
pub use peer::PeerInfo;
pub use rpc::{InitRpc, RpcHandler, MAX_RPC_NAME_LEN};

pub mod config;
mod error;
mod gateway;
pub mod handshake;
pub mod mux;
mod nodes;
mod peer;
mod rpc;
mod wire;
