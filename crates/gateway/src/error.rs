use thiserror::Error as ThisError;

use crest_types::AddressError;

use crate::handshake::ProtocolVersion;
use crate::mux;

/// An error raised by the gateway.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("peer protocol version {0} is below the accepted minimum")]
    PeerVersionTooLow(ProtocolVersion),
    #[error("peer genesis block does not match ours")]
    PeerGenesisMismatch,
    #[error("dialed our own gateway")]
    SelfDial,
    #[error("peer rejected the connection")]
    PeerRejected,
    #[error("peer is already connected")]
    PeerAlreadyConnected,
    #[error("invalid peer address: {0}")]
    PeerAddressInvalid(#[from] AddressError),
    #[error("peer is not connected")]
    PeerNotConnected,
    #[error("no peers available")]
    NoPeers,
    #[error("transport was closed")]
    TransportClosed,
    #[error("handshake deadline expired")]
    HandshakeTimeout,
    #[error(transparent)]
    Mux(#[from] mux::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encode failure: {0}")]
    Encode(String),
    #[error("decode failure: {0}")]
    Decode(String),
}
