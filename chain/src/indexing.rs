//! Secondary Index Maintenance
//!
//! Optional tx, address, unspent, spent, and timestamp indices, written as
//! part of the flush batch when a block connects and deleted again when it
//! disconnects. Which indices are live is controlled by store flags.

use serde::{Deserialize, Serialize};

use plumecoin_core::{Amount, Block, OutPoint, ScriptForm};
use plumecoin_storage::{keys, BlockLocation, StoreFlag, WriteBatch};

use crate::coins::Coin;
use crate::error::ChainError;

/// Value of a tx-index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxIndexEntry {
    pub location: BlockLocation,
    pub height: u64,
    /// Position of the transaction within its block
    pub index: u32,
}

/// Value of a spent-index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpentIndexEntry {
    pub spending_txid: String,
    pub input_index: u32,
    pub height: u64,
}

/// Which optional indices are enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexFlags {
    pub txindex: bool,
    pub addressindex: bool,
    pub spentindex: bool,
    pub timestampindex: bool,
}

impl IndexFlags {
    pub fn from_store(index: &plumecoin_storage::IndexDb) -> Result<Self, ChainError> {
        Ok(IndexFlags {
            txindex: index.flag(StoreFlag::TxIndex).map_err(sys)?,
            addressindex: index.flag(StoreFlag::AddressIndex).map_err(sys)?,
            spentindex: index.flag(StoreFlag::SpentIndex).map_err(sys)?,
            timestampindex: index.flag(StoreFlag::TimestampIndex).map_err(sys)?,
        })
    }
}

fn sys(err: plumecoin_storage::StorageError) -> ChainError {
    ChainError::System(err.to_string())
}

fn addr_parts(script: &plumecoin_core::Script) -> Option<(u8, [u8; 20], Option<String>)> {
    let token = plumecoin_core::TokenScript::from_script(script)
        .ok()
        .flatten()
        .map(|op| op.name().to_string());
    match script.form() {
        ScriptForm::P2PKH(hash) => Some((keys::ADDR_TYPE_P2PKH, hash, token)),
        ScriptForm::P2SH(hash) => Some((keys::ADDR_TYPE_P2SH, hash, token)),
        _ => None,
    }
}

/// Append (or delete) every secondary-index record of one block.
///
/// `spent_per_tx` aligns with the block's transactions; `connect` false
/// reverses a disconnect.
pub fn index_block(
    flags: &IndexFlags,
    block: &Block,
    height: u64,
    location: BlockLocation,
    spent_per_tx: &[Vec<(OutPoint, Coin)>],
    connect: bool,
    batch: &mut WriteBatch,
) -> Result<(), ChainError> {
    if flags.timestampindex {
        let key = keys::timestamp_index_key(block.header.timestamp, height);
        if connect {
            batch.put(key, block.hash().to_vec());
        } else {
            batch.delete(key);
        }
    }

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();

        if flags.txindex {
            let key = keys::tx_index_key(&txid);
            if connect {
                batch
                    .put_json(
                        key,
                        &TxIndexEntry {
                            location,
                            height,
                            index: tx_index as u32,
                        },
                    )
                    .map_err(sys)?;
            } else {
                batch.delete(key);
            }
        }

        if flags.addressindex {
            for (vout, output) in tx.outputs.iter().enumerate() {
                if let Some((addr_type, hash, token)) = addr_parts(&output.script_pubkey) {
                    let key = keys::address_index_key(
                        addr_type,
                        &hash,
                        token.as_deref(),
                        height,
                        &txid,
                        vout as u32,
                    );
                    let unspent_key = keys::unspent_index_key(
                        addr_type,
                        &hash,
                        token.as_deref(),
                        &OutPoint::new(txid, vout as u32),
                    );
                    if connect {
                        batch.put(key, output.value.to_le_bytes().to_vec());
                        batch.put(unspent_key, output.value.to_le_bytes().to_vec());
                    } else {
                        batch.delete(key);
                        batch.delete(unspent_key);
                    }
                }
            }
        }

        for (outpoint, coin) in spent_per_tx.get(tx_index).into_iter().flatten() {
            if flags.spentindex {
                let key = keys::spent_index_key(outpoint);
                if connect {
                    batch
                        .put_json(
                            key,
                            &SpentIndexEntry {
                                spending_txid: hex::encode(txid),
                                input_index: 0,
                                height,
                            },
                        )
                        .map_err(sys)?;
                } else {
                    batch.delete(key);
                }
            }
            if flags.addressindex {
                // A spend consumes the unspent-index entry of its prevout.
                if let Some((addr_type, hash, token)) = addr_parts(&coin.output.script_pubkey) {
                    let unspent_key =
                        keys::unspent_index_key(addr_type, &hash, token.as_deref(), outpoint);
                    if connect {
                        batch.delete(unspent_key);
                    } else {
                        batch.put(unspent_key, coin.output.value.to_le_bytes().to_vec());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Net address deltas of one block, for callers that want a summary rather
/// than raw index rows
pub fn address_deltas(
    block: &Block,
    spent_per_tx: &[Vec<(OutPoint, Coin)>],
) -> Vec<([u8; 20], Amount)> {
    let mut deltas: std::collections::HashMap<[u8; 20], Amount> = std::collections::HashMap::new();
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        for output in &tx.outputs {
            if let Some(hash) = output.script_pubkey.address_hash() {
                *deltas.entry(hash).or_insert(0) += output.value;
            }
        }
        for (_, coin) in spent_per_tx.get(tx_index).into_iter().flatten() {
            if let Some(hash) = coin.output.script_pubkey.address_hash() {
                *deltas.entry(hash).or_insert(0) -= coin.output.value;
            }
        }
    }
    deltas.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumecoin_core::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use plumecoin_core::{BlockHeader, Script, Transaction};

    fn sample_block() -> (Block, Vec<Vec<(OutPoint, Coin)>>) {
        let coinbase = Transaction::new(
            1,
            vec![TxIn::new(OutPoint::null(), Script(vec![0, 0]), SEQUENCE_FINAL)],
            vec![TxOut::new(10, Script::p2pkh(&[1u8; 20]))],
            0,
        );
        let prevout = OutPoint::new([5u8; 32], 0);
        let spend = Transaction::new(
            1,
            vec![TxIn::new(prevout, Script::default(), SEQUENCE_FINAL)],
            vec![TxOut::new(7, Script::p2pkh(&[2u8; 20]))],
            0,
        );
        let spent_coin = Coin::new(TxOut::new(9, Script::p2pkh(&[3u8; 20])), 1, 0, false, false);
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_block_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1_700_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            vec![coinbase, spend],
        );
        block.header.merkle_root = block.calculate_merkle_root();
        let spent = vec![vec![], vec![(prevout, spent_coin)]];
        (block, spent)
    }

    #[test]
    fn test_connect_then_disconnect_cancels_out() {
        let (block, spent) = sample_block();
        let flags = IndexFlags {
            txindex: true,
            addressindex: true,
            spentindex: true,
            timestampindex: true,
        };
        let location = BlockLocation { file: 0, offset: 8 };

        let mut connect_batch = WriteBatch::new();
        index_block(&flags, &block, 3, location, &spent, true, &mut connect_batch).unwrap();
        let mut disconnect_batch = WriteBatch::new();
        index_block(
            &flags,
            &block,
            3,
            location,
            &spent,
            false,
            &mut disconnect_batch,
        )
        .unwrap();
        // Same key count in both directions; disconnect undoes connect.
        assert_eq!(connect_batch.len(), disconnect_batch.len());
        assert!(connect_batch.len() >= 6);
    }

    #[test]
    fn test_address_deltas_net_out() {
        let (block, spent) = sample_block();
        let deltas = address_deltas(&block, &spent);
        let lookup: std::collections::HashMap<[u8; 20], Amount> = deltas.into_iter().collect();
        assert_eq!(lookup[&[1u8; 20]], 10); // coinbase out
        assert_eq!(lookup[&[2u8; 20]], 7); // spend out
        assert_eq!(lookup[&[3u8; 20]], -9); // spent coin
    }
}
