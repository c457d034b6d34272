//! Plumecoin Consensus Rules
//!
//! Context-free and contextual validation of headers, blocks, and
//! transactions; the difficulty schedule; proof-of-stake kernel checks; and
//! the script interpreter. Everything here is deterministic and free of
//! chain state: callers supply whatever context a check needs.

use plumecoin_core::{Amount, Hash, Network, COIN};
use serde::{Deserialize, Serialize};

pub mod checks;
pub mod difficulty;
pub mod interpreter;
pub mod pos;
pub mod sighash;

pub use checks::{check_block, check_transaction, contextual_check_block, CheckError};
pub use difficulty::{
    bits_to_target, block_proof, check_proof_of_work, next_work_required, target_to_bits,
};
pub use interpreter::{
    eval_script, verify_script, ScriptError, SignatureChecker, TransactionSigChecker,
    MANDATORY_FLAGS, STANDARD_FLAGS, VERIFY_CLEANSTACK, VERIFY_NONE, VERIFY_NULLDUMMY,
    VERIFY_P2SH, VERIFY_SIGPUSHONLY, VERIFY_STRICTENC,
};
pub use pos::{check_kernel, check_stake_split, next_stake_modifier, PosError};
pub use sighash::{SighashCache, SIGHASH_ALL};

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 2_000_000;

/// Maximum block weight (base bytes count four times)
pub const MAX_BLOCK_WEIGHT: usize = 8_000_000;

/// Maximum legacy sigops per block
pub const MAX_BLOCK_SIGOPS: u32 = 80_000;

/// Maximum legacy sigops in a standard transaction
pub const MAX_STANDARD_TX_SIGOPS: u32 = MAX_BLOCK_SIGOPS / 5;

/// Number of blocks a coinbase or coinstake output stays unspendable
pub const COINBASE_MATURITY: u64 = 100;

/// Window length for median-time-past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum seconds a header timestamp may run ahead of adjusted time
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Consensus parameters for one network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Network type
    pub network: Network,
    /// Target seconds between blocks
    pub target_spacing: u64,
    /// Proof-of-work limit as compact bits
    pub pow_limit_bits: u32,
    /// Proof-of-stake target limit as compact bits
    pub pos_limit_bits: u32,
    /// One-time premine paid by block 1
    pub premine: Amount,
    /// Fixed subsidy for every other block
    pub block_reward: Amount,
    /// Lowest accepted transaction version
    pub min_tx_version: i32,
    /// Lowest accepted block version
    pub min_block_version: i32,
    /// Deepest reorganization the node will perform
    pub max_reorg_depth: u64,
    /// Blocks a stake input must age before it can be a kernel
    pub stake_min_age: u64,
    /// Hard-coded checkpoint pairs, ascending by height
    pub checkpoints: Vec<(u64, Hash)>,
}

impl ConsensusParams {
    /// Get consensus parameters for mainnet
    pub fn mainnet() -> Self {
        ConsensusParams {
            network: Network::Mainnet,
            target_spacing: 60,
            pow_limit_bits: 0x1e00ffff,
            pos_limit_bits: 0x1e00ffff,
            premine: 1_000_000_000 * COIN,
            block_reward: 10 * COIN,
            min_tx_version: 1,
            min_block_version: 1,
            max_reorg_depth: 288,
            stake_min_age: 8,
            checkpoints: Vec::new(),
        }
    }

    /// Get consensus parameters for testnet
    pub fn testnet() -> Self {
        ConsensusParams {
            network: Network::Testnet,
            ..Self::mainnet()
        }
    }

    /// Get consensus parameters for regtest
    pub fn regtest() -> Self {
        ConsensusParams {
            network: Network::Regtest,
            target_spacing: 60,
            pow_limit_bits: 0x207fffff,
            pos_limit_bits: 0x207fffff,
            premine: 1_000_000_000 * COIN,
            block_reward: 10 * COIN,
            min_tx_version: 1,
            min_block_version: 1,
            max_reorg_depth: 288,
            stake_min_age: 2,
            checkpoints: Vec::new(),
        }
    }

    /// Select parameters by network
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Block subsidy at a height: the premine at height 1, the fixed reward
    /// everywhere else
    pub fn block_subsidy(&self, height: u64) -> Amount {
        if height == 1 {
            self.premine
        } else {
            self.block_reward
        }
    }

    /// The last checkpoint at or below `height`, if any
    pub fn checkpoint_at_or_below(&self, height: u64) -> Option<&(u64, Hash)> {
        self.checkpoints
            .iter()
            .rev()
            .find(|(cp_height, _)| *cp_height <= height)
    }

    /// Height of the highest checkpoint
    pub fn last_checkpoint_height(&self) -> u64 {
        self.checkpoints.last().map(|(h, _)| *h).unwrap_or(0)
    }
}

/// Median of a timestamp window; the caller passes up to MEDIAN_TIME_SPAN
/// most-recent block times, any order
pub fn median_time(mut times: Vec<u32>) -> u32 {
    if times.is_empty() {
        return 0;
    }
    times.sort_unstable();
    times[times.len() / 2]
}
