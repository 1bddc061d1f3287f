//! Query surfaces the electrum subsystem consumes from the explorer and
//! transaction pool collaborators.

use async_trait::async_trait;
use thiserror::Error;

use crate::hash::{BlockId, OutputId, UnlockHash};
use crate::transaction::{CoinOutput, Transaction};

/// An error reported by a query backend.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query backend failure: {0}")]
    Backend(String),
}

/// A transaction together with its confirmation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTransaction {
    pub transaction: Transaction,
    pub block_id: BlockId,
    pub height: u64,
    /// Position of the transaction in the block's transaction list.
    pub block_index: usize,
}

/// Read access to confirmed chain state.
#[async_trait]
pub trait Explorer: Send + Sync {
    /// All confirmed transactions touching `address`, through outputs or
    /// inputs. Order is unspecified.
    async fn transactions_for_address(
        &self,
        address: &UnlockHash,
    ) -> Result<Vec<ConfirmedTransaction>, QueryError>;

    /// Look up a confirmed output by its identifier.
    async fn output(&self, id: &OutputId) -> Result<Option<CoinOutput>, QueryError>;
}

/// Read access to the unconfirmed transaction set.
#[async_trait]
pub trait TransactionPool: Send + Sync {
    /// The pool's transactions, in pool order.
    async fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, QueryError>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Explorer {}

    #[async_trait]
    impl Explorer for Explorer {
        async fn transactions_for_address(
            &self,
            address: &UnlockHash,
        ) -> Result<Vec<ConfirmedTransaction>, QueryError>;
        async fn output(&self, id: &OutputId) -> Result<Option<CoinOutput>, QueryError>;
    }
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub TransactionPool {}

    #[async_trait]
    impl TransactionPool for TransactionPool {
        async fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, QueryError>;
    }
}
