//! Chain networks and their fixed parameters.

use bitcoin_hashes::{sha256, Hash};
use serde::Deserialize;

use crate::hash::BlockId;

/// The network a node participates in. Nodes on different networks carry
/// different genesis blocks and refuse to peer with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl Network {
    /// Identifier of the network's genesis block.
    pub fn genesis_block_id(&self) -> BlockId {
        let tag: &[u8] = match self {
            Self::Mainnet => b"crest:genesis:mainnet",
            Self::Testnet => b"crest:genesis:testnet",
            Self::Devnet => b"crest:genesis:devnet",
        };
        BlockId::from_inner(sha256::Hash::hash(tag).into_inner())
    }

    /// Default gateway listening port.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mainnet => 23112,
            Self::Testnet => 23212,
            Self::Devnet => 23312,
        }
    }

    /// Default electrum server port.
    pub fn default_electrum_port(&self) -> u16 {
        match self {
            Self::Mainnet => 23113,
            Self::Testnet => 23213,
            Self::Devnet => 23313,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}
