//! Network addresses of peers.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Error validating or parsing a [`NetAddress`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing port separator")]
    MissingPort,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("loopback or unspecified host is not a valid remote address")]
    NotRemote,
}

/// A `host:port` peer address.
///
/// The host may be an IP address or a hostname; IPv6 hosts are kept in
/// bracketed form so the string always splits unambiguously on the last
/// colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetAddress {
    host: String,
    port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        if port == 0 {
            return Err(AddressError::InvalidPort("0".into()));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The same host paired with a different port. Used when a peer tells
    /// us the port it is actually listening on.
    pub fn with_port(&self, port: u16) -> Result<Self, AddressError> {
        Self::new(self.host.clone(), port)
    }

    fn ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    pub fn is_loopback(&self) -> bool {
        self.ip().map_or(false, |ip| ip.is_loopback())
    }

    /// Loopback or private-range addresses. Local peers are treated more
    /// leniently by the gateway's kicking policy.
    pub fn is_local(&self) -> bool {
        match self.ip() {
            Some(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            Some(IpAddr::V6(ip)) => ip.is_loopback(),
            None => false,
        }
    }

    /// Validate an address learned from the network: it must carry a
    /// routable host and a nonzero port.
    pub fn validate_remote(&self) -> Result<(), AddressError> {
        match self.ip() {
            Some(ip) if ip.is_loopback() || ip.is_unspecified() => Err(AddressError::NotRemote),
            _ => Ok(()),
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            SocketAddr::V6(v6) => format!("[{}]", v6.ip()),
        };
        Self {
            host,
            port: addr.port(),
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NetAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(AddressError::MissingPort)?;
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(port.into()))?;

        Self::new(host, port)
    }
}

impl Serialize for NetAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
