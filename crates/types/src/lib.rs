//! Shared primitives for the crest node: addresses, identifiers,
//! transaction shapes and the consensus/explorer collaborator surfaces.

pub use address::{AddressError, NetAddress};
pub use consensus::{Block, ConsensusChange, DiffDirection, OutputDiff};
pub use hash::{BlockId, OutputId, OutputKind, TransactionId, UnlockHash, UnlockType};
pub use network::Network;
pub use query::{ConfirmedTransaction, Explorer, QueryError, TransactionPool};
#[cfg(any(test, feature = "mocks"))]
pub use query::{MockExplorer, MockTransactionPool};
pub use transaction::{CoinInput, CoinOutput, Transaction};

pub mod address;
pub mod consensus;
pub mod hash;
pub mod network;
pub mod query;
mod transaction;
