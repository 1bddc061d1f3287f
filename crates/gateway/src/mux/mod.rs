//! Stream multiplexer.
//!
//! Shares one reliable byte transport among many logical full-duplex
//! streams, with per-stream flow control. One side of the transport runs
//! the [`Session`] in client mode and allocates odd stream ids, the other
//! runs it in server mode and allocates even ids. Frame layout and
//! commands follow the SMUX wire format.
//!
//! The multiplexer sends `Nop` keepalives on an interval but enforces no
//! inactivity policy of its own; that belongs to the layer above.

use thiserror::Error as ThisError;

mod frame;
mod session;
mod stream;

pub use session::{Config, Session};
pub use stream::Stream;

/// Multiplexer failure.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The session was closed; no streams can be opened or accepted.
    #[error("session is closed")]
    SessionClosed,
    /// The peer broke the framing or flow-control rules.
    #[error("multiplexer protocol violation: {0}")]
    Protocol(&'static str),
    #[error("unknown frame version {0}")]
    UnknownVersion(u8),
    #[error("unknown frame command {0}")]
    UnknownCommand(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
