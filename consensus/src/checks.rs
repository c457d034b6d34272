//! Context-Free and Contextual Block Checks
//!
//! `check_transaction` and `check_block` need nothing beyond the object
//! itself; `contextual_check_block` additionally needs the height and
//! median-time-past the caller resolved from the block index. UTXO-aware
//! validation lives in the chain crate.

use std::collections::HashSet;

use plumecoin_core::{money_range, Block, TokenError, TokenScript, Transaction};

use crate::difficulty::check_proof_of_work;
use crate::{ConsensusParams, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_BLOCK_WEIGHT};
use thiserror::Error;

/// Validation failures with their p2p reject codes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("Transaction has no inputs")]
    NoInputs,

    #[error("Transaction has no outputs")]
    NoOutputs,

    #[error("Transaction too large")]
    TxTooLarge,

    #[error("Output value out of range")]
    OutputOutOfRange,

    #[error("Total output value out of range")]
    OutputTotalOutOfRange,

    #[error("Duplicate input")]
    DuplicateInput,

    #[error("Coinbase script size out of range")]
    BadCoinbaseLength,

    #[error("Input refers to the null outpoint")]
    NullPrevout,

    #[error("Malformed token region: {0}")]
    BadTokenRegion(#[from] TokenError),

    #[error("Transaction version below minimum")]
    TxVersionTooLow,

    #[error("Block has no transactions")]
    EmptyBlock,

    #[error("Block exceeds maximum size")]
    BlockTooLarge,

    #[error("Block exceeds maximum weight")]
    BlockTooHeavy,

    #[error("First transaction is not a coinbase")]
    FirstTxNotCoinbase,

    #[error("Unexpected extra coinbase")]
    MultipleCoinbase,

    #[error("Misplaced coinstake")]
    MisplacedCoinstake,

    #[error("Merkle root mismatch")]
    BadMerkleRoot,

    #[error("Duplicate transaction in block")]
    DuplicateTx,

    #[error("Witness commitment mismatch")]
    BadWitnessCommitment,

    #[error("Too many signature operations")]
    TooManySigops,

    #[error("Invalid compact target encoding")]
    BadTargetEncoding,

    #[error("Claimed target above the network limit")]
    TargetAboveLimit,

    #[error("Hash does not meet the claimed target")]
    HighHash,

    #[error("Block version below minimum")]
    BlockVersionTooLow,

    #[error("Non-final transaction in block")]
    NonFinalTx,

    #[error("Coinbase height mismatch")]
    BadCoinbaseHeight,

    #[error("Block timestamp before median time past")]
    TimeTooOld,

    #[error("Proof-of-stake block missing block signature")]
    MissingBlockSignature,
}

impl CheckError {
    /// The short reject code reported toward the peer layer
    pub fn reject_code(&self) -> &'static str {
        match self {
            CheckError::NoInputs => "bad-txns-vin-empty",
            CheckError::NoOutputs => "bad-txns-vout-empty",
            CheckError::TxTooLarge => "bad-txns-oversize",
            CheckError::OutputOutOfRange => "bad-txns-vout-toolarge",
            CheckError::OutputTotalOutOfRange => "bad-txns-txouttotal-toolarge",
            CheckError::DuplicateInput => "bad-txns-inputs-duplicate",
            CheckError::BadCoinbaseLength => "bad-cb-length",
            CheckError::NullPrevout => "bad-txns-prevout-null",
            CheckError::BadTokenRegion(_) => "bad-txns-token-region",
            CheckError::TxVersionTooLow => "version",
            CheckError::EmptyBlock => "bad-blk-length",
            CheckError::BlockTooLarge => "bad-blk-length",
            CheckError::BlockTooHeavy => "bad-blk-weight",
            CheckError::FirstTxNotCoinbase => "bad-cb-missing",
            CheckError::MultipleCoinbase => "bad-cb-multiple",
            CheckError::MisplacedCoinstake => "bad-cs-misplaced",
            CheckError::BadMerkleRoot => "bad-txnmrklroot",
            CheckError::DuplicateTx => "bad-txns-duplicate",
            CheckError::BadWitnessCommitment => "bad-witness-merkle-match",
            CheckError::TooManySigops => "bad-blk-sigops",
            CheckError::BadTargetEncoding => "bad-diffbits",
            CheckError::TargetAboveLimit => "bad-diffbits",
            CheckError::HighHash => "high-hash",
            CheckError::BlockVersionTooLow => "bad-version",
            CheckError::NonFinalTx => "bad-txns-nonfinal",
            CheckError::BadCoinbaseHeight => "bad-cb-height",
            CheckError::TimeTooOld => "time-too-old",
            CheckError::MissingBlockSignature => "bad-blk-signature",
        }
    }

    /// Whether this failure class can be caused by local disk or memory
    /// corruption rather than a malicious block. Merkle and duplicate-tx
    /// failures surface when stored bytes rot.
    pub fn corruption_possible(&self) -> bool {
        matches!(
            self,
            CheckError::BadMerkleRoot | CheckError::DuplicateTx | CheckError::BadWitnessCommitment
        )
    }
}

/// Context-free transaction checks
pub fn check_transaction(tx: &Transaction) -> Result<(), CheckError> {
    if tx.inputs.is_empty() {
        return Err(CheckError::NoInputs);
    }
    if tx.outputs.is_empty() {
        return Err(CheckError::NoOutputs);
    }
    if tx.base_size() > MAX_BLOCK_SIZE {
        return Err(CheckError::TxTooLarge);
    }

    let mut total: i64 = 0;
    for output in &tx.outputs {
        if !money_range(output.value) {
            return Err(CheckError::OutputOutOfRange);
        }
        total = total
            .checked_add(output.value)
            .ok_or(CheckError::OutputTotalOutOfRange)?;
        if !money_range(total) {
            return Err(CheckError::OutputTotalOutOfRange);
        }
        // A malformed token region poisons the whole transaction.
        TokenScript::from_script(&output.script_pubkey)?;
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(CheckError::DuplicateInput);
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(CheckError::BadCoinbaseLength);
        }
    } else {
        for input in &tx.inputs {
            if input.prevout.is_null() {
                return Err(CheckError::NullPrevout);
            }
        }
    }
    Ok(())
}

/// Context-free block checks: structure, proof of work, merkle commitments,
/// per-transaction checks, and the block sigop cap
pub fn check_block(block: &Block, params: &ConsensusParams) -> Result<(), CheckError> {
    if block.transactions.is_empty() {
        return Err(CheckError::EmptyBlock);
    }
    if block.total_size() > MAX_BLOCK_SIZE {
        return Err(CheckError::BlockTooLarge);
    }
    if block.weight() > MAX_BLOCK_WEIGHT {
        return Err(CheckError::BlockTooHeavy);
    }

    let pos = block.is_proof_of_stake();
    if pos {
        if block.signature.is_empty() {
            return Err(CheckError::MissingBlockSignature);
        }
    } else {
        check_proof_of_work(&block.hash(), block.header.bits, params.pow_limit_bits)?;
    }

    if !block.transactions[0].is_coinbase() {
        return Err(CheckError::FirstTxNotCoinbase);
    }
    for (i, tx) in block.transactions.iter().enumerate() {
        if i > 0 && tx.is_coinbase() {
            return Err(CheckError::MultipleCoinbase);
        }
        // A coinstake may only sit in slot one of a PoS block.
        if tx.is_coinstake() && !(pos && i == 1) {
            return Err(CheckError::MisplacedCoinstake);
        }
    }

    if block.calculate_merkle_root() != block.header.merkle_root {
        return Err(CheckError::BadMerkleRoot);
    }

    // Two identical txids fold into the same merkle root; catch the
    // malleated form explicitly.
    let mut txids = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !txids.insert(tx.txid()) {
            return Err(CheckError::DuplicateTx);
        }
    }

    if block.has_witness() {
        let commitment = block
            .witness_commitment()
            .ok_or(CheckError::BadWitnessCommitment)?;
        if commitment != block.calculate_witness_root() {
            return Err(CheckError::BadWitnessCommitment);
        }
    }

    let mut sigops: u32 = 0;
    for tx in &block.transactions {
        check_transaction(tx)?;
        sigops = sigops.saturating_add(tx.sigop_count());
    }
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(CheckError::TooManySigops);
    }
    Ok(())
}

/// Contextual block checks against the resolved predecessor context:
/// version floor, timestamp floor, transaction finality, and the coinbase
/// height commitment
pub fn contextual_check_block(
    block: &Block,
    params: &ConsensusParams,
    height: u64,
    median_time_past: u32,
) -> Result<(), CheckError> {
    if block.transactions.is_empty() {
        return Err(CheckError::EmptyBlock);
    }
    if block.header.version < params.min_block_version {
        return Err(CheckError::BlockVersionTooLow);
    }
    if block.header.timestamp <= median_time_past && height > 0 {
        return Err(CheckError::TimeTooOld);
    }

    let cutoff_time = median_time_past as i64;
    for tx in &block.transactions {
        if tx.version < params.min_tx_version {
            return Err(CheckError::TxVersionTooLow);
        }
        if !tx.is_final(height, cutoff_time) {
            return Err(CheckError::NonFinalTx);
        }
    }

    // The coinbase commits to its height in the first push of script_sig.
    if height > 0 {
        let coinbase = &block.transactions[0];
        if !coinbase.is_coinbase() {
            return Err(CheckError::FirstTxNotCoinbase);
        }
        let script_sig = &coinbase.inputs[0].script_sig;
        let mut expected = Vec::new();
        plumecoin_core::script::push_slice(&mut expected, &height.to_le_bytes());
        if !script_sig.as_bytes().starts_with(&expected) {
            return Err(CheckError::BadCoinbaseHeight);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumecoin_core::script::push_slice;
    use plumecoin_core::transaction::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};
    use plumecoin_core::{BlockHeader, Script, COIN};

    fn coinbase_at(height: u64) -> Transaction {
        let mut script_sig = Vec::new();
        push_slice(&mut script_sig, &height.to_le_bytes());
        Transaction::new(
            1,
            vec![TxIn::new(OutPoint::null(), Script(script_sig), SEQUENCE_FINAL)],
            vec![TxOut::new(10 * COIN, Script::p2pkh(&[0u8; 20]))],
            0,
        )
    }

    fn block_at(height: u64, extra: Vec<Transaction>) -> Block {
        let mut txs = vec![coinbase_at(height)];
        txs.extend(extra);
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_block_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1_700_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            txs,
        );
        block.header.merkle_root = block.calculate_merkle_root();
        block
    }

    #[test]
    fn test_check_transaction_basics() {
        let tx = coinbase_at(3);
        assert!(check_transaction(&tx).is_ok());

        let empty_in = Transaction::new(1, vec![], tx.outputs.clone(), 0);
        assert_eq!(check_transaction(&empty_in), Err(CheckError::NoInputs));

        let empty_out = Transaction::new(1, tx.inputs.clone(), vec![], 0);
        assert_eq!(check_transaction(&empty_out), Err(CheckError::NoOutputs));
    }

    #[test]
    fn test_duplicate_inputs_rejected() {
        let input = TxIn::new(
            OutPoint::new([1u8; 32], 0),
            Script(vec![0x00]),
            SEQUENCE_FINAL,
        );
        let tx = Transaction::new(
            1,
            vec![input.clone(), input],
            vec![TxOut::new(1, Script::p2pkh(&[0u8; 20]))],
            0,
        );
        assert_eq!(check_transaction(&tx), Err(CheckError::DuplicateInput));
    }

    #[test]
    fn test_check_block_accepts_valid() {
        let params = ConsensusParams::regtest();
        let block = block_at(1, vec![]);
        assert!(check_block(&block, &params).is_ok());
    }

    #[test]
    fn test_check_block_rejects_bad_merkle() {
        let params = ConsensusParams::regtest();
        let mut block = block_at(1, vec![]);
        block.header.merkle_root = [0xffu8; 32];
        assert_eq!(
            check_block(&block, &params),
            Err(CheckError::BadMerkleRoot)
        );
        assert!(CheckError::BadMerkleRoot.corruption_possible());
    }

    #[test]
    fn test_check_block_rejects_coinbase_elsewhere() {
        let params = ConsensusParams::regtest();
        let block = block_at(1, vec![coinbase_at(1)]);
        // Identical coinbase also trips the duplicate check; order matters:
        // the coinbase-position check runs first.
        assert_eq!(
            check_block(&block, &params),
            Err(CheckError::MultipleCoinbase)
        );
    }

    #[test]
    fn test_contextual_height_commitment() {
        let params = ConsensusParams::regtest();
        let block = block_at(7, vec![]);
        assert!(contextual_check_block(&block, &params, 7, 1_600_000_000).is_ok());
        assert_eq!(
            contextual_check_block(&block, &params, 8, 1_600_000_000),
            Err(CheckError::BadCoinbaseHeight)
        );
    }

    #[test]
    fn test_contextual_rejects_old_timestamp() {
        let params = ConsensusParams::regtest();
        let block = block_at(7, vec![]);
        assert_eq!(
            contextual_check_block(&block, &params, 7, block.header.timestamp),
            Err(CheckError::TimeTooOld)
        );
    }
}
