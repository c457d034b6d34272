//! Block Undo Records
//!
//! Everything needed to reverse one connect step: the previous coin for
//! every non-coinbase input, in transaction order, plus the token-state
//! side table. Serialized into `rev` files behind the storage layer's
//! checksum framing.

use serde::{Deserialize, Serialize};

use crate::coins::Coin;
use crate::error::ChainError;
use crate::tokens::TokenUndo;

/// Undo data for one transaction's inputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxUndo {
    /// Previous coins in input order
    pub spent: Vec<Coin>,
}

/// Undo data for one block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// One entry per non-coinbase transaction, in block order
    pub tx_undos: Vec<TxUndo>,
    /// Token mutations in application order
    pub token_undos: Vec<TokenUndo>,
}

impl BlockUndo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        serde_json::to_vec(self).map_err(|e| ChainError::System(format!("encode undo: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ChainError::System(format!("corrupt undo record: {e}")))
    }
}
