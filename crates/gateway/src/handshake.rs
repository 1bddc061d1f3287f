//! Version handshake between two gateways.
//!
//! The dialer writes its [`VersionHeader`] first; the acceptor validates
//! it and answers with its own, using `want_conn: false` to turn the
//! dialer away. The dialer then sends the port its own gateway listens
//! on, so the acceptor can re-derive a dialable address from the host it
//! observed. No node-table state is touched until the exchange succeeds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crest_types::BlockId;

use crate::error::Error;
use crate::wire;

/// Deadline covering a whole handshake, dial included.
pub const CONN_STD_DEADLINE: Duration = Duration::from_secs(5);

/// Oldest protocol version we still talk to.
pub const MIN_ACCEPTED_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Upper bound on an encoded [`VersionHeader`].
const MAX_HEADER_LEN: u32 = 1024;

/// Upper bound on the dial-back port field (five digits, some slack for
/// malformed peers; anything longer is cut off unread).
const MAX_PORT_LEN: usize = 13;

/// Gateway wire-protocol version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Random identity of a running gateway instance, used to detect dialing
/// ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId([u8; 8]);

impl InstanceId {
    pub fn random() -> Self {
        Self(fastrand::u64(..).to_le_bytes())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// First message exchanged on a fresh connection, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionHeader {
    pub version: ProtocolVersion,
    pub genesis_id: BlockId,
    pub unique_id: InstanceId,
    pub want_conn: bool,
}

fn validate(remote: &VersionHeader, local: &VersionHeader) -> Result<(), Error> {
    if remote.version < MIN_ACCEPTED_VERSION {
        return Err(Error::PeerVersionTooLow(remote.version));
    }
    if remote.genesis_id != local.genesis_id {
        return Err(Error::PeerGenesisMismatch);
    }
    if remote.unique_id == local.unique_id {
        return Err(Error::SelfDial);
    }
    if !remote.want_conn {
        return Err(Error::PeerRejected);
    }
    Ok(())
}

/// Dialer side of the handshake. On success the acceptor has been told
/// which port we listen on.
pub async fn exchange_as_dialer<T>(
    conn: &mut T,
    local: &VersionHeader,
    dialback_port: u16,
) -> Result<VersionHeader, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    wire::write_cbor(conn, local, MAX_HEADER_LEN).await?;

    let remote: VersionHeader = wire::read_cbor(conn, MAX_HEADER_LEN).await?;
    validate(&remote, local)?;

    wire::write_short_string(conn, &dialback_port.to_string(), MAX_PORT_LEN).await?;

    Ok(remote)
}

/// Acceptor side of the handshake. Returns the dialer's header and the
/// port it asked to be dialed back on.
pub async fn exchange_as_acceptor<T>(
    conn: &mut T,
    local: &VersionHeader,
) -> Result<(VersionHeader, u16), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let remote: VersionHeader = wire::read_cbor(conn, MAX_HEADER_LEN).await?;

    if let Err(err) = validate(&remote, local) {
        // Let the dialer know it was turned away before hanging up.
        let refusal = VersionHeader {
            want_conn: false,
            ..local.clone()
        };
        let _ = wire::write_cbor(conn, &refusal, MAX_HEADER_LEN).await;
        return Err(err);
    }

    wire::write_cbor(conn, local, MAX_HEADER_LEN).await?;

    let port_field = wire::read_short_string(conn, MAX_PORT_LEN).await?;
    let port: u16 = port_field
        .parse()
        .map_err(|_| Error::Decode(format!("invalid dial-back port {port_field:?}")))?;
    if port == 0 {
        return Err(Error::Decode("dial-back port must be nonzero".into()));
    }

    Ok((remote, port))
}

#[cfg(test)]
mod tests {
    use crest_types::Network;

    use super::*;

    fn header(network: Network) -> VersionHeader {
        VersionHeader {
            version: ProtocolVersion::new(1, 0, 2),
            genesis_id: network.genesis_block_id(),
            unique_id: InstanceId::random(),
            want_conn: true,
        }
    }

    #[tokio::test]
    async fn successful_exchange() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let dialer = header(Network::Devnet);
        let acceptor = header(Network::Devnet);

        let acceptor_task = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { exchange_as_acceptor(&mut b, &acceptor).await })
        };

        let seen = exchange_as_dialer(&mut a, &dialer, 23112).await.unwrap();
        assert_eq!(seen.unique_id, acceptor.unique_id);

        let (seen_by_acceptor, port) = acceptor_task.await.unwrap().unwrap();
        assert_eq!(seen_by_acceptor.unique_id, dialer.unique_id);
        assert_eq!(port, 23112);
    }

    #[tokio::test]
    async fn genesis_mismatch_rejects_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let dialer = header(Network::Devnet);
        let acceptor = header(Network::Testnet);

        let acceptor_task =
            tokio::spawn(async move { exchange_as_acceptor(&mut b, &acceptor).await });

        // The dialer sees the mismatch in the refusal header itself.
        let err = exchange_as_dialer(&mut a, &dialer, 23112)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerGenesisMismatch));

        let err = acceptor_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PeerGenesisMismatch));
    }

    #[tokio::test]
    async fn self_dial_is_detected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ours = header(Network::Devnet);
        let same = ours.clone();

        let acceptor_task = tokio::spawn(async move { exchange_as_acceptor(&mut b, &same).await });

        let err = exchange_as_dialer(&mut a, &ours, 23112).await.unwrap_err();
        // Both sides see the same instance id; the dialer learns it from
        // the refusal header first.
        assert!(matches!(err, Error::SelfDial | Error::PeerRejected));
        assert!(matches!(
            acceptor_task.await.unwrap().unwrap_err(),
            Error::SelfDial
        ));
    }

    #[tokio::test]
    async fn version_floor_is_enforced() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut dialer = header(Network::Devnet);
        dialer.version = ProtocolVersion::new(0, 9, 9);
        let acceptor = header(Network::Devnet);

        let acceptor_task =
            tokio::spawn(async move { exchange_as_acceptor(&mut b, &acceptor).await });

        assert!(matches!(
            exchange_as_dialer(&mut a, &dialer, 23112).await.unwrap_err(),
            Error::PeerRejected
        ));
        assert!(matches!(
            acceptor_task.await.unwrap().unwrap_err(),
            Error::PeerVersionTooLow(_)
        ));
    }
}
