//! Governance Opcode Decoding
//!
//! Governance actions are carried in OP_RETURN outputs whose data starts
//! with the `PLMGOV` prefix. Unknown prefixes and unknown action tags decode
//! to no-ops; a governance output can never invalidate a block.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::{Amount, Script, ScriptForm};

/// Prefix marking a governance OP_RETURN payload
pub const GOVERNANCE_PREFIX: &[u8; 6] = b"PLMGOV";

/// A decoded governance action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernanceOp {
    /// Update a numbered chain parameter
    ParamUpdate { key: u8, value: u64 },
    /// Direct an amount to the treasury script hash
    Treasury { amount: Amount, script_hash: [u8; 20] },
    /// Recognized prefix, unrecognized action
    Noop,
}

impl GovernanceOp {
    /// Decode the governance action of an output script, if it has one.
    ///
    /// Non-governance outputs (including OP_RETURN outputs with other
    /// prefixes) return `None`.
    pub fn from_script(script: &Script) -> Option<GovernanceOp> {
        let data = match script.form() {
            ScriptForm::OpReturn(data) => data,
            _ => return None,
        };
        if data.len() < GOVERNANCE_PREFIX.len() + 1 || !data.starts_with(GOVERNANCE_PREFIX) {
            return None;
        }
        let tag = data[GOVERNANCE_PREFIX.len()];
        let mut r = Cursor::new(&data[GOVERNANCE_PREFIX.len() + 1..]);
        let op = match tag {
            0x01 => {
                let key = r.read_u8().ok()?;
                let value = r.read_u64::<LittleEndian>().ok()?;
                GovernanceOp::ParamUpdate { key, value }
            }
            0x02 => {
                let amount = r.read_i64::<LittleEndian>().ok()?;
                let mut script_hash = [0u8; 20];
                std::io::Read::read_exact(&mut r, &mut script_hash).ok()?;
                GovernanceOp::Treasury {
                    amount,
                    script_hash,
                }
            }
            _ => GovernanceOp::Noop,
        };
        Some(op)
    }

    /// Encode into an OP_RETURN script
    pub fn to_script(&self) -> Script {
        let mut data = Vec::with_capacity(32);
        data.extend_from_slice(GOVERNANCE_PREFIX);
        match self {
            GovernanceOp::ParamUpdate { key, value } => {
                data.push(0x01);
                data.push(*key);
                data.extend_from_slice(&value.to_le_bytes());
            }
            GovernanceOp::Treasury {
                amount,
                script_hash,
            } => {
                data.push(0x02);
                data.extend_from_slice(&amount.to_le_bytes());
                data.extend_from_slice(script_hash);
            }
            GovernanceOp::Noop => data.push(0xff),
        }
        Script::op_return(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_update_roundtrip() {
        let op = GovernanceOp::ParamUpdate { key: 3, value: 1500 };
        assert_eq!(GovernanceOp::from_script(&op.to_script()), Some(op));
    }

    #[test]
    fn test_treasury_roundtrip() {
        let op = GovernanceOp::Treasury {
            amount: 42,
            script_hash: [8u8; 20],
        };
        assert_eq!(GovernanceOp::from_script(&op.to_script()), Some(op));
    }

    #[test]
    fn test_foreign_prefix_is_ignored() {
        let script = Script::op_return(b"OTHERDATA");
        assert_eq!(GovernanceOp::from_script(&script), None);
    }

    #[test]
    fn test_unknown_tag_is_noop() {
        let mut data = GOVERNANCE_PREFIX.to_vec();
        data.push(0x77);
        let script = Script::op_return(&data);
        assert_eq!(GovernanceOp::from_script(&script), Some(GovernanceOp::Noop));
    }

    #[test]
    fn test_payment_script_is_not_governance() {
        let script = Script::p2pkh(&[1u8; 20]);
        assert_eq!(GovernanceOp::from_script(&script), None);
    }
}
