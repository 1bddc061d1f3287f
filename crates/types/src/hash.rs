//! Identifier hashes used across the node.

use std::fmt;
use std::str::FromStr;

use bitcoin_hashes::{hash_newtype, sha256, Hash};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

hash_newtype!(
    BlockId,
    sha256::Hash,
    32,
    doc = "Identifier of a block. The miner payout pseudo-transaction of a block shares its bytes."
);

hash_newtype!(TransactionId, sha256::Hash, 32, doc = "Identifier of a transaction.");

hash_newtype!(
    OutputId,
    sha256::Hash,
    32,
    doc = "Identifier of a coin or blockstake output, derived from the creating transaction."
);

/// Which output list of a transaction an output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Coin,
    Blockstake,
}

impl OutputId {
    /// Derive the identifier of the `index`-th output of `parent`.
    pub fn derive(kind: OutputKind, parent: &TransactionId, index: u64) -> Self {
        let domain: u8 = match kind {
            OutputKind::Coin => 0,
            OutputKind::Blockstake => 1,
        };

        let mut engine = sha256::Hash::engine();
        bitcoin_hashes::HashEngine::input(&mut engine, &[domain]);
        bitcoin_hashes::HashEngine::input(&mut engine, &parent.into_inner());
        bitcoin_hashes::HashEngine::input(&mut engine, &index.to_le_bytes());

        OutputId::from_inner(sha256::Hash::from_engine(engine).into_inner())
    }
}

impl TransactionId {
    /// Whether this transaction is the miner payout pseudo-transaction of `block`.
    pub fn is_miner_payout_of(&self, block: &BlockId) -> bool {
        self.into_inner() == block.into_inner()
    }
}

/// The condition type guarding an unlock hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnlockType {
    Nil = 0,
    PublicKey = 1,
    MultiSig = 3,
}

impl UnlockType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Nil),
            1 => Some(Self::PublicKey),
            3 => Some(Self::MultiSig),
            _ => None,
        }
    }
}

/// A typed hash serving as a wallet or contract address.
///
/// Rendered as hex: two digits of condition type followed by the 32-byte
/// hash of the unlock condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnlockHash {
    pub kind: UnlockType,
    pub hash: [u8; 32],
}

impl UnlockHash {
    pub fn new(kind: UnlockType, hash: [u8; 32]) -> Self {
        Self { kind, hash }
    }
}

impl fmt::Display for UnlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{}", self.kind as u8, hex::encode(self.hash))
    }
}

/// Error parsing an [`UnlockHash`] from its hex form.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UnlockHashError {
    #[error("unlock hash must be 66 hex characters, got {0}")]
    Length(usize),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("unknown unlock type {0}")]
    UnknownType(u8),
}

impl FromStr for UnlockHash {
    type Err = UnlockHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 66 {
            return Err(UnlockHashError::Length(s.len()));
        }
        let bytes = hex::decode(s)?;

        let kind =
            UnlockType::from_byte(bytes[0]).ok_or(UnlockHashError::UnknownType(bytes[0]))?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[1..]);

        Ok(Self { kind, hash })
    }
}

impl Serialize for UnlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UnlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
