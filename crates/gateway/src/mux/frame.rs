//! Wire framing of the multiplexer.
//!
//! Every frame starts with an 8 byte header: protocol version, command,
//! payload length (LE) and stream id (LE). Only `Psh` and `Upd` frames
//! carry a payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::Error;

/// Protocol version carried in every frame header.
pub const VERSION: u8 = 1;

/// Size of an encoded frame header.
pub const HEADER_LEN: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Open a stream.
    Syn = 0,
    /// Half-close a stream.
    Fin = 1,
    /// Stream data.
    Psh = 2,
    /// Session keepalive, ignored by the receiver.
    Nop = 3,
    /// Receive-window credit update; payload is a 4 byte LE byte count.
    Upd = 4,
}

impl Command {
    fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            0 => Ok(Self::Syn),
            1 => Ok(Self::Fin),
            2 => Ok(Self::Psh),
            3 => Ok(Self::Nop),
            4 => Ok(Self::Upd),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub length: u16,
    pub stream_id: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = VERSION;
        out[1] = self.command as u8;
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.stream_id.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, Error> {
        if buf[0] != VERSION {
            return Err(Error::UnknownVersion(buf[0]));
        }

        Ok(Self {
            command: Command::from_byte(buf[1])?,
            length: u16::from_le_bytes([buf[2], buf[3]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// A full frame, ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, stream_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);

        Self {
            header: Header {
                command,
                length: payload.len() as u16,
                stream_id,
            },
            payload,
        }
    }

    pub fn control(command: Command, stream_id: u32) -> Self {
        Self::new(command, stream_id, Bytes::new())
    }

    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self::new(
            Command::Upd,
            stream_id,
            Bytes::copy_from_slice(&credit.to_le_bytes()),
        )
    }

    /// Credit carried by an `Upd` frame.
    pub fn credit(&self) -> Result<u32, Error> {
        let b: [u8; 4] = self.payload[..]
            .try_into()
            .map_err(|_| Error::Protocol("window update payload must be 4 bytes"))?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
