//! Electrum protocol-version negotiation argument.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::RpcError;

/// The protocol version this server implements.
pub const SERVER_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Software identification returned by `server.version`.
pub const SERVER_SOFTWARE_VERSION: &str =
    concat!("crest-electrum/", env!("CARGO_PKG_VERSION"));

/// An Electrum protocol version: two or three numeric segments, the
/// third defaulting to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion([u32; 3]);

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self([major, minor, patch])
    }
}

impl FromStr for ProtocolVersion {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('.').collect();
        if !(2..=3).contains(&segments.len()) {
            return Err(RpcError::invalid_params(format!(
                "protocol version {s:?} must have two or three segments"
            )));
        }

        let mut parts = [0u32; 3];
        for (i, segment) in segments.iter().enumerate() {
            parts[i] = segment.parse().map_err(|_| {
                RpcError::invalid_params(format!("protocol version segment {segment:?}"))
            })?;
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// The protocol argument of `server.version`: either one version string
/// or a `[min, max]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

impl VersionRange {
    pub fn from_param(value: &Value) -> Result<Self, RpcError> {
        match value {
            Value::String(s) => {
                let version: ProtocolVersion = s.parse()?;
                Ok(Self {
                    min: version,
                    max: version,
                })
            }
            Value::Array(items) => {
                if items.len() != 2 {
                    return Err(RpcError::invalid_params(
                        "protocol range must have exactly two entries",
                    ));
                }
                let min = version_from_value(&items[0])?;
                let max = version_from_value(&items[1])?;
                if min > max {
                    return Err(RpcError::invalid_params("protocol range is inverted"));
                }
                Ok(Self { min, max })
            }
            _ => Err(RpcError::invalid_params(
                "protocol argument must be a string or a two-entry array",
            )),
        }
    }

    pub fn contains(&self, version: ProtocolVersion) -> bool {
        self.min <= version && version <= self.max
    }
}

fn version_from_value(value: &Value) -> Result<ProtocolVersion, RpcError> {
    value
        .as_str()
        .ok_or_else(|| RpcError::invalid_params("protocol version must be a string"))?
        .parse()
}
