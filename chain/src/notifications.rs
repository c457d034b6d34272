//! Chain Event Subscribers
//!
//! External collaborators (wire layer, indexers, message delivery) observe
//! the chain through this trait. Callbacks run under the chain lock after
//! the state transition committed; implementations must not call back into
//! the node.

use plumecoin_core::{Block, GovernanceOp, Hash, Transaction};

/// Receiver of chain lifecycle events
pub trait ChainSubscriber: Send {
    /// The active tip moved to `hash` at `height`
    fn tip_updated(&self, hash: &Hash, height: u64) {
        let _ = (hash, height);
    }

    /// A block connected to the active chain
    fn block_connected(&self, block: &Block, height: u64) {
        let _ = (block, height);
    }

    /// A block was disconnected during a reorganization
    fn block_disconnected(&self, block: &Block, height: u64) {
        let _ = (block, height);
    }

    /// A transaction entered the mempool
    fn tx_accepted(&self, tx: &Transaction) {
        let _ = tx;
    }

    /// A connected block carried a governance action
    fn governance_op(&self, op: &GovernanceOp, height: u64) {
        let _ = (op, height);
    }

    /// A token-channel output was confirmed (message delivery hook)
    fn token_message(&self, token_name: &str, ipfs_hash: &[u8; 32], height: u64) {
        let _ = (token_name, ipfs_hash, height);
    }
}
