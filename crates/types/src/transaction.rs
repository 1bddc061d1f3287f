use serde::{Deserialize, Serialize};

use crate::hash::{OutputId, OutputKind, TransactionId, UnlockHash};

/// An input spending a previously created output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinInput {
    /// Identifier of the output being spent.
    pub parent_id: OutputId,
}

/// A coin or blockstake output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinOutput {
    pub value: u64,
    pub unlock_hash: UnlockHash,
}

/// The slice of a transaction the gateway and electrum subsystems care
/// about: identifiers and the in/out sets. Signatures and arbitrary data
/// stay with the consensus collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(default)]
    pub coin_inputs: Vec<CoinInput>,
    #[serde(default)]
    pub coin_outputs: Vec<CoinOutput>,
    #[serde(default)]
    pub blockstake_inputs: Vec<CoinInput>,
    #[serde(default)]
    pub blockstake_outputs: Vec<CoinOutput>,
}

impl Transaction {
    /// Identifiers of the outputs this transaction creates, coin outputs
    /// first, in output order.
    pub fn created_output_ids(&self) -> impl Iterator<Item = OutputId> + '_ {
        let coins = self
            .coin_outputs
            .iter()
            .enumerate()
            .map(|(i, _)| OutputId::derive(OutputKind::Coin, &self.id, i as u64));
        let stakes = self
            .blockstake_outputs
            .iter()
            .enumerate()
            .map(|(i, _)| OutputId::derive(OutputKind::Blockstake, &self.id, i as u64));

        coins.chain(stakes)
    }

    /// Whether any output pays to `address`.
    pub fn pays_to(&self, address: &UnlockHash) -> bool {
        self.coin_outputs
            .iter()
            .chain(self.blockstake_outputs.iter())
            .any(|o| &o.unlock_hash == address)
    }

    /// All inputs, coin inputs first.
    pub fn inputs(&self) -> impl Iterator<Item = &CoinInput> {
        self.coin_inputs.iter().chain(self.blockstake_inputs.iter())
    }
}
