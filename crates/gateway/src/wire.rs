//! Length-prefixed framing helpers for gateway control messages.
//!
//! Structured messages travel as CBOR behind a `u32` LE length prefix;
//! short ASCII fields (ports, handler names, hosts) behind a single
//! length byte.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

pub(crate) async fn write_cbor<T, W>(writer: &mut W, value: &T, max_len: u32) -> Result<(), Error>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|err| Error::Encode(err.to_string()))?;
    if buf.len() > max_len as usize {
        return Err(Error::Encode(format!(
            "message of {} bytes exceeds the {} byte frame bound",
            buf.len(),
            max_len
        )));
    }

    writer.write_all(&(buf.len() as u32).to_le_bytes()).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_cbor<T, R>(reader: &mut R, max_len: u32) -> Result<T, Error>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > max_len {
        return Err(Error::Decode(format!(
            "message of {len} bytes exceeds the {max_len} byte frame bound"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    ciborium::de::from_reader(buf.as_slice()).map_err(|err| Error::Decode(err.to_string()))
}

pub(crate) async fn write_short_string<W>(
    writer: &mut W,
    value: &str,
    max_len: usize,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(max_len <= u8::MAX as usize);
    if value.is_empty() || value.len() > max_len {
        return Err(Error::Encode(format!(
            "string field must be 1..={max_len} bytes, got {}",
            value.len()
        )));
    }

    writer.write_all(&[value.len() as u8]).await?;
    writer.write_all(value.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_short_string<R>(reader: &mut R, max_len: usize) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 1];
    reader.read_exact(&mut len_buf).await?;
    let len = len_buf[0] as usize;
    if len == 0 || len > max_len {
        return Err(Error::Decode(format!(
            "string field must be 1..={max_len} bytes, got {len}"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    String::from_utf8(buf).map_err(|_| Error::Decode("string field is not UTF-8".into()))
}
