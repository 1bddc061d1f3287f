//! Address status: a deterministic hash over an address's transaction
//! history, as defined by the Electrum protocol.

use std::collections::HashMap;

use bitcoin_hashes::{sha256, Hash};

use crest_types::{Explorer, OutputId, QueryError, TransactionPool, UnlockHash};

/// Compute the status string for `address`.
///
/// Confirmed transactions are ordered by height, miner payouts first
/// within their block (their id equals the block id), then by position
/// in the block. Unconfirmed transactions follow: first those depending
/// on another unconfirmed output (height -1), then those whose inputs
/// are all confirmed (height 0). Each entry is serialised as
/// `"{txid}:{height}:"`; the status is the hex SHA-256 of the
/// concatenation. No history at all hashes the empty byte sequence.
pub async fn address_status(
    explorer: &dyn Explorer,
    pool: &dyn TransactionPool,
    address: &UnlockHash,
) -> Result<String, QueryError> {
    let mut confirmed = explorer.transactions_for_address(address).await?;
    confirmed.sort_by_key(|tx| {
        let miner_payout_rank = if tx.transaction.id.is_miner_payout_of(&tx.block_id) {
            0
        } else {
            1
        };
        (tx.height, miner_payout_rank, tx.block_index)
    });

    let mut entries: Vec<(String, i64)> = confirmed
        .iter()
        .map(|tx| (tx.transaction.id.to_string(), tx.height as i64))
        .collect();

    let unconfirmed = pool.unconfirmed_transactions().await?;

    // Outputs created inside the pool, so input scans can tell an
    // unconfirmed parent from a confirmed one.
    let pool_outputs: HashMap<OutputId, UnlockHash> = unconfirmed
        .iter()
        .flat_map(|tx| {
            tx.created_output_ids().zip(
                tx.coin_outputs
                    .iter()
                    .chain(tx.blockstake_outputs.iter())
                    .map(|output| output.unlock_hash),
            )
        })
        .collect();

    let mut depends_on_unconfirmed = Vec::new();
    let mut all_inputs_confirmed = Vec::new();

    for tx in &unconfirmed {
        let mut relevant = tx.pays_to(address);
        let mut unconfirmed_parent = false;

        for input in tx.inputs() {
            // The first unconfirmed dependency found wins; later inputs
            // cannot re-categorise the transaction.
            if !unconfirmed_parent && pool_outputs.contains_key(&input.parent_id) {
                unconfirmed_parent = true;
            }

            if !relevant {
                let unlock = match pool_outputs.get(&input.parent_id) {
                    Some(unlock) => Some(*unlock),
                    None => explorer
                        .output(&input.parent_id)
                        .await?
                        .map(|output| output.unlock_hash),
                };
                if unlock.as_ref() == Some(address) {
                    relevant = true;
                }
            }
        }

        if relevant {
            if unconfirmed_parent {
                depends_on_unconfirmed.push((tx.id.to_string(), -1i64));
            } else {
                all_inputs_confirmed.push((tx.id.to_string(), 0i64));
            }
        }
    }

    entries.extend(depends_on_unconfirmed);
    entries.extend(all_inputs_confirmed);

    let mut serialised = String::new();
    for (txid, height) in &entries {
        serialised.push_str(txid);
        serialised.push(':');
        serialised.push_str(&height.to_string());
        serialised.push(':');
    }

    Ok(sha256::Hash::hash(serialised.as_bytes()).to_string())
}

#[cfg(test)]
mod tests {
    use crest_types::{
        CoinInput, CoinOutput, ConfirmedTransaction, MockExplorer, MockTransactionPool,
        OutputKind, Transaction, TransactionId, UnlockType,
    };

    use super::*;

    /// SHA-256 of zero bytes, hex-encoded.
    const EMPTY_STATUS: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn address(b: u8) -> UnlockHash {
        UnlockHash::new(UnlockType::PublicKey, [b; 32])
    }

    fn txid(b: u8) -> TransactionId {
        TransactionId::from_inner([b; 32])
    }

    fn paying_tx(id: TransactionId, to: UnlockHash) -> Transaction {
        Transaction {
            id,
            coin_inputs: vec![],
            coin_outputs: vec![CoinOutput {
                value: 100,
                unlock_hash: to,
            }],
            blockstake_inputs: vec![],
            blockstake_outputs: vec![],
        }
    }

    fn expected_status(entries: &[(TransactionId, i64)]) -> String {
        let serialised: String = entries
            .iter()
            .map(|(id, height)| format!("{id}:{height}:"))
            .collect();
        sha256::Hash::hash(serialised.as_bytes()).to_string()
    }

    fn empty_pool() -> MockTransactionPool {
        let mut pool = MockTransactionPool::new();
        pool.expect_unconfirmed_transactions()
            .returning(|| Ok(vec![]));
        pool
    }

    #[tokio::test]
    async fn empty_history_hashes_the_empty_sequence() {
        let mut explorer = MockExplorer::new();
        explorer
            .expect_transactions_for_address()
            .returning(|_| Ok(vec![]));
        let pool = empty_pool();

        let status = address_status(&explorer, &pool, &address(1)).await.unwrap();
        assert_eq!(status, EMPTY_STATUS);
    }

    #[tokio::test]
    async fn miner_payout_sorts_before_block_peers() {
        let addr = address(1);
        // The block id doubles as the miner payout's transaction id.
        let block_bytes = [9u8; 32];
        let payout_id = TransactionId::from_inner(block_bytes);
        let other_id = txid(2);
        let block_id = crest_types::BlockId::from_inner(block_bytes);

        let mut explorer = MockExplorer::new();
        explorer.expect_transactions_for_address().returning(move |_| {
            // Listed payout-last on purpose.
            Ok(vec![
                ConfirmedTransaction {
                    transaction: paying_tx(other_id, addr),
                    block_id,
                    height: 40,
                    block_index: 1,
                },
                ConfirmedTransaction {
                    transaction: paying_tx(payout_id, addr),
                    block_id,
                    height: 40,
                    block_index: 2,
                },
            ])
        });
        let pool = empty_pool();

        let status = address_status(&explorer, &pool, &addr).await.unwrap();
        assert_eq!(
            status,
            expected_status(&[(payout_id, 40), (other_id, 40)])
        );
    }

    #[tokio::test]
    async fn confirmed_ordering_is_by_height_then_block_position() {
        let addr = address(1);
        let block_a = crest_types::BlockId::from_inner([7u8; 32]);
        let block_b = crest_types::BlockId::from_inner([8u8; 32]);

        let mut explorer = MockExplorer::new();
        explorer.expect_transactions_for_address().returning(move |_| {
            Ok(vec![
                ConfirmedTransaction {
                    transaction: paying_tx(txid(3), addr),
                    block_id: block_b,
                    height: 12,
                    block_index: 0,
                },
                ConfirmedTransaction {
                    transaction: paying_tx(txid(2), addr),
                    block_id: block_a,
                    height: 11,
                    block_index: 4,
                },
                ConfirmedTransaction {
                    transaction: paying_tx(txid(1), addr),
                    block_id: block_a,
                    height: 11,
                    block_index: 2,
                },
            ])
        });
        let pool = empty_pool();

        let status = address_status(&explorer, &pool, &addr).await.unwrap();
        assert_eq!(
            status,
            expected_status(&[(txid(1), 11), (txid(2), 11), (txid(3), 12)])
        );
    }

    #[tokio::test]
    async fn unconfirmed_dependents_come_first_at_height_minus_one() {
        let addr = address(1);

        // Parent spends nothing unconfirmed; child spends the parent's
        // first coin output.
        let parent = paying_tx(txid(10), addr);
        let parent_output = OutputId::derive(OutputKind::Coin, &parent.id, 0);
        let child = Transaction {
            id: txid(11),
            coin_inputs: vec![CoinInput {
                parent_id: parent_output,
            }],
            coin_outputs: vec![CoinOutput {
                value: 50,
                unlock_hash: addr,
            }],
            blockstake_inputs: vec![],
            blockstake_outputs: vec![],
        };

        let mut explorer = MockExplorer::new();
        explorer
            .expect_transactions_for_address()
            .returning(|_| Ok(vec![]));
        let mut pool = MockTransactionPool::new();
        let txs = vec![parent.clone(), child.clone()];
        pool.expect_unconfirmed_transactions()
            .returning(move || Ok(txs.clone()));

        let status = address_status(&explorer, &pool, &addr).await.unwrap();
        assert_eq!(
            status,
            expected_status(&[(txid(11), -1), (txid(10), 0)])
        );
    }

    #[tokio::test]
    async fn relevance_through_spent_output() {
        let addr = address(1);
        let other = address(2);

        // The pool transaction pays someone else but spends a confirmed
        // output locked to our address.
        let spent_output = OutputId::derive(OutputKind::Coin, &txid(20), 0);
        let spender = Transaction {
            id: txid(21),
            coin_inputs: vec![CoinInput {
                parent_id: spent_output,
            }],
            coin_outputs: vec![CoinOutput {
                value: 5,
                unlock_hash: other,
            }],
            blockstake_inputs: vec![],
            blockstake_outputs: vec![],
        };

        let mut explorer = MockExplorer::new();
        explorer
            .expect_transactions_for_address()
            .returning(|_| Ok(vec![]));
        explorer.expect_output().returning(move |id| {
            assert_eq!(id, &spent_output);
            Ok(Some(CoinOutput {
                value: 5,
                unlock_hash: addr,
            }))
        });
        let mut pool = MockTransactionPool::new();
        let txs = vec![spender.clone()];
        pool.expect_unconfirmed_transactions()
            .returning(move || Ok(txs.clone()));

        let status = address_status(&explorer, &pool, &addr).await.unwrap();
        assert_eq!(status, expected_status(&[(txid(21), 0)]));
    }
}
