//! Chain Error Taxonomy
//!
//! Five outcomes leave the chain core: `Invalid` (consensus violation,
//! carrying a reject code and whether local corruption could explain it),
//! `MissingInputs`, `MissingPrev`, `Duplicate`, and `System`. Only the
//! first marks blocks failed; the last aborts the node.

use plumecoin_consensus::{CheckError, PosError, ScriptError};
use plumecoin_core::Hash;
use plumecoin_storage::StorageError;
use thiserror::Error;

/// Details of a consensus rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectInfo {
    /// Short machine-readable code, e.g. `bad-txns-in-belowout`
    pub code: String,
    /// Human-readable detail
    pub reason: String,
    /// True when a local disk or memory fault could produce this failure,
    /// in which case the block must not be marked permanently failed
    pub corruption_possible: bool,
}

/// Errors surfaced by the chain state machine
#[derive(Debug, Error)]
pub enum ChainError {
    /// Consensus violation; the source peer deserves a ban
    #[error("Invalid: {} ({})", .0.code, .0.reason)]
    Invalid(RejectInfo),

    /// Transaction inputs not found; not an invalidity
    #[error("Missing inputs")]
    MissingInputs,

    /// Header's predecessor is unknown; the caller should fetch it
    #[error("Missing previous block {}", hex::encode(.0))]
    MissingPrev(Hash),

    /// Already known; rarely an error at the protocol layer
    #[error("Duplicate block {}", hex::encode(.0))]
    Duplicate(Hash),

    /// Unrecoverable local failure; the node must shut down
    #[error("System error: {0}")]
    System(String),
}

impl ChainError {
    pub fn invalid(code: &str, reason: impl Into<String>) -> Self {
        ChainError::Invalid(RejectInfo {
            code: code.to_string(),
            reason: reason.into(),
            corruption_possible: false,
        })
    }

    pub fn invalid_maybe_corrupt(code: &str, reason: impl Into<String>) -> Self {
        ChainError::Invalid(RejectInfo {
            code: code.to_string(),
            reason: reason.into(),
            corruption_possible: true,
        })
    }

    /// True when the failure may stem from local corruption rather than a
    /// bad block
    pub fn corruption_possible(&self) -> bool {
        matches!(self, ChainError::Invalid(info) if info.corruption_possible)
    }
}

impl From<CheckError> for ChainError {
    fn from(err: CheckError) -> Self {
        ChainError::Invalid(RejectInfo {
            code: err.reject_code().to_string(),
            reason: err.to_string(),
            corruption_possible: err.corruption_possible(),
        })
    }
}

impl From<PosError> for ChainError {
    fn from(err: PosError) -> Self {
        ChainError::invalid(err.reject_code(), err.to_string())
    }
}

impl From<ScriptError> for ChainError {
    fn from(err: ScriptError) -> Self {
        ChainError::invalid("mandatory-script-verify-flag-failed", err.to_string())
    }
}

impl From<StorageError> for ChainError {
    fn from(err: StorageError) -> Self {
        ChainError::System(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_error_mapping_preserves_corruption_flag() {
        let err: ChainError = CheckError::BadMerkleRoot.into();
        assert!(err.corruption_possible());
        let err: ChainError = CheckError::NoInputs.into();
        assert!(!err.corruption_possible());
    }

    #[test]
    fn test_invalid_carries_code() {
        let err = ChainError::invalid("bad-cb-height", "height 5 expected 6");
        match err {
            ChainError::Invalid(info) => {
                assert_eq!(info.code, "bad-cb-height");
                assert!(!info.corruption_possible);
            }
            _ => panic!("expected Invalid"),
        }
    }
}
