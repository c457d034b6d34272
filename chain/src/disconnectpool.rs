//! Disconnect Pool
//!
//! Transactions orphaned by a reorg wait here for re-admission to the
//! mempool. Insertion order is preserved (hash lookup plus an ordered
//! list), because re-admission must run in reverse of it: the most
//! recently disconnected block's transactions go back first, keeping
//! dependencies ahead of their spenders.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use plumecoin_core::{Hash, Transaction};

/// Byte budget; beyond it the oldest entries fall off
pub const MAX_DISCONNECT_POOL_BYTES: usize = 20_000_000;

pub struct DisconnectPool {
    /// (txid, tx) in insertion order; tombstones are compacted on drain
    entries: Vec<Option<(Hash, Arc<Transaction>)>>,
    positions: HashMap<Hash, usize>,
    bytes: usize,
    max_bytes: usize,
}

impl DisconnectPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_DISCONNECT_POOL_BYTES)
    }

    pub fn with_capacity(max_bytes: usize) -> Self {
        DisconnectPool {
            entries: Vec::new(),
            positions: HashMap::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.positions.contains_key(txid)
    }

    pub fn dynamic_usage(&self) -> usize {
        self.bytes
    }

    /// Queue the transactions of a disconnected block, reverse block order.
    ///
    /// Coinbase and coinstake never re-enter a mempool and are skipped.
    pub fn add_disconnected_block(&mut self, txs: &[Transaction]) {
        for tx in txs.iter().rev() {
            if tx.is_coinbase() || tx.is_coinstake() {
                continue;
            }
            self.push(Arc::new(tx.clone()));
        }
        self.trim();
    }

    fn push(&mut self, tx: Arc<Transaction>) {
        let txid = tx.txid();
        if self.positions.contains_key(&txid) {
            return;
        }
        self.bytes += tx.total_size();
        self.positions.insert(txid, self.entries.len());
        self.entries.push(Some((txid, tx)));
    }

    /// Remove one transaction, e.g. because a connected block confirmed it
    pub fn remove(&mut self, txid: &Hash) {
        if let Some(pos) = self.positions.remove(txid) {
            if let Some((_, tx)) = self.entries[pos].take() {
                self.bytes = self.bytes.saturating_sub(tx.total_size());
            }
        }
    }

    /// Evict oldest entries until the pool fits its byte budget
    fn trim(&mut self) {
        let mut idx = 0;
        while self.bytes > self.max_bytes && idx < self.entries.len() {
            if let Some((txid, tx)) = self.entries[idx].take() {
                self.positions.remove(&txid);
                self.bytes = self.bytes.saturating_sub(tx.total_size());
                debug!("disconnect pool overflow, dropping {}", hex::encode(&txid[..8]));
            }
            idx += 1;
        }
    }

    /// Drain everything in re-admission order (reverse of insertion)
    pub fn drain_for_readmission(&mut self) -> Vec<Arc<Transaction>> {
        let mut txs: Vec<Arc<Transaction>> = self
            .entries
            .drain(..)
            .flatten()
            .map(|(_, tx)| tx)
            .collect();
        self.positions.clear();
        self.bytes = 0;
        txs.reverse();
        txs
    }
}

impl Default for DisconnectPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumecoin_core::transaction::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};
    use plumecoin_core::Script;

    fn tx(tag: u8) -> Transaction {
        Transaction::new(
            1,
            vec![TxIn::new(
                OutPoint::new([tag; 32], 0),
                Script::default(),
                SEQUENCE_FINAL,
            )],
            vec![TxOut::new(tag as i64 + 1, Script::p2pkh(&[tag; 20]))],
            0,
        )
    }

    #[test]
    fn test_readmission_order_reverses_insertion() {
        let mut pool = DisconnectPool::new();
        // Two blocks disconnect, tip block first.
        pool.add_disconnected_block(&[tx(0), tx(1), tx(2)]); // height N
        pool.add_disconnected_block(&[tx(3), tx(4)]); // height N-1

        let drained = pool.drain_for_readmission();
        let tags: Vec<u8> = drained
            .iter()
            .map(|tx| tx.inputs[0].prevout.txid[0])
            .collect();
        // Reverse of insertion: the earlier block's txs (in block order)
        // first, then the tip block's.
        assert_eq!(tags, vec![3, 4, 0, 1, 2]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_coinbase_is_skipped() {
        let mut pool = DisconnectPool::new();
        let coinbase = Transaction::new(
            1,
            vec![TxIn::new(OutPoint::null(), Script(vec![0, 0]), SEQUENCE_FINAL)],
            vec![TxOut::new(10, Script::p2pkh(&[1u8; 20]))],
            0,
        );
        pool.add_disconnected_block(&[coinbase, tx(1)]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_byte_budget_drops_oldest() {
        let mut pool = DisconnectPool::with_capacity(150);
        pool.add_disconnected_block(&[tx(1)]);
        let first_size = pool.dynamic_usage();
        assert!(first_size > 60);
        pool.add_disconnected_block(&[tx(2)]);
        // The first entry fell off to fit the budget.
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&tx(2).txid()));
    }

    #[test]
    fn test_remove_confirmed() {
        let mut pool = DisconnectPool::new();
        pool.add_disconnected_block(&[tx(1), tx(2)]);
        pool.remove(&tx(1).txid());
        assert_eq!(pool.len(), 1);
        let drained = pool.drain_for_readmission();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].txid(), tx(2).txid());
    }
}
