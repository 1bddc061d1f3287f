//! Chain state seam for the electrum server.
//!
//! The real consensus, explorer and transaction pool modules live
//! outside this repository; until they are wired in, the node serves an
//! empty chain view so the electrum surface is fully functional.

use async_trait::async_trait;
use std::sync::RwLock;

use crest_types::{
    CoinOutput, ConfirmedTransaction, Explorer, OutputId, QueryError, Transaction,
    TransactionPool, UnlockHash,
};

/// In-memory chain view.
#[derive(Default)]
pub struct ChainView {
    confirmed: RwLock<Vec<ConfirmedTransaction>>,
    pool: RwLock<Vec<Transaction>>,
}

#[async_trait]
impl Explorer for ChainView {
    async fn transactions_for_address(
        &self,
        address: &UnlockHash,
    ) -> Result<Vec<ConfirmedTransaction>, QueryError> {
        let confirmed = self.confirmed.read().expect("chain view poisoned");
        Ok(confirmed
            .iter()
            .filter(|tx| tx.transaction.pays_to(address))
            .cloned()
            .collect())
    }

    async fn output(&self, id: &OutputId) -> Result<Option<CoinOutput>, QueryError> {
        let confirmed = self.confirmed.read().expect("chain view poisoned");
        for entry in confirmed.iter() {
            for (output_id, output) in entry.transaction.created_output_ids().zip(
                entry
                    .transaction
                    .coin_outputs
                    .iter()
                    .chain(entry.transaction.blockstake_outputs.iter()),
            ) {
                if &output_id == id {
                    return Ok(Some(output.clone()));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TransactionPool for ChainView {
    async fn unconfirmed_transactions(&self) -> Result<Vec<Transaction>, QueryError> {
        Ok(self.pool.read().expect("chain view poisoned").clone())
    }
}
