//! Plumecoin Core Types and Data Structures
//!
//! This module defines the fundamental data structures used throughout the
//! Plumecoin cryptocurrency: blocks, transactions, scripts, the token script
//! layer, and the consensus serialization they share.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod block;
pub mod governance;
pub mod script;
pub mod ser;
pub mod token;
pub mod transaction;

/// Re-export core types
pub use block::{Block, BlockHeader};
pub use governance::GovernanceOp;
pub use script::{Script, ScriptForm};
pub use ser::{sha256d, Decodable, Encodable, SerError};
pub use token::{TokenError, TokenScript};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};

/// Hash type used throughout the system
pub type Hash = [u8; 32];

/// Amount in base units
pub type Amount = i64;

/// Base units per PLM
pub const COIN: Amount = 100_000_000;

/// Upper bound for any single amount; the premine fits under it
pub const MAX_MONEY: Amount = 2_000_000_000 * COIN;

/// Returns true if the value is inside the money range
pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Network types supported by Plumecoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Main production network
    Mainnet,
    /// Test network for development
    Testnet,
    /// Local regression testing
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerError),

    #[error("Token script error: {0}")]
    Token(#[from] TokenError),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Get current timestamp in seconds
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
