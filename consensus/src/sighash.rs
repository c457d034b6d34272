//! Signature Hash Computation
//!
//! Legacy sighash over the modified transaction serialization. The
//! per-transaction parts that do not depend on the input index are
//! precomputed once in `SighashCache` and reused for every input the
//! script engine verifies.

use byteorder::{LittleEndian, WriteBytesExt};

use plumecoin_core::ser::{sha256d, write_bytes, write_compact_size, write_hash};
use plumecoin_core::{Hash, Script, Transaction};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// The defined result for SIGHASH_SINGLE past the last output
fn single_bug_hash() -> Hash {
    let mut hash = [0u8; 32];
    hash[0] = 1;
    hash
}

/// Precomputed transaction data shared by every input's sighash
#[derive(Debug, Clone)]
pub struct SighashCache {
    /// Encoded outputs section for SIGHASH_ALL
    all_outputs: Vec<u8>,
    version: i32,
    lock_time: u32,
    input_count: usize,
}

impl SighashCache {
    pub fn new(tx: &Transaction) -> Self {
        let mut all_outputs = Vec::new();
        write_compact_size(&mut all_outputs, tx.outputs.len() as u64)
            .expect("writing to a Vec cannot fail");
        for output in &tx.outputs {
            all_outputs
                .write_i64::<LittleEndian>(output.value)
                .expect("writing to a Vec cannot fail");
            write_bytes(&mut all_outputs, output.script_pubkey.as_bytes())
                .expect("writing to a Vec cannot fail");
        }
        SighashCache {
            all_outputs,
            version: tx.version,
            lock_time: tx.lock_time,
            input_count: tx.inputs.len(),
        }
    }

    /// Compute the signature hash for one input.
    ///
    /// `script_code` is the previous output's base script (token region
    /// stripped) or the redeem script for P2SH spends.
    pub fn signature_hash(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_code: &Script,
        sighash_type: u32,
    ) -> Hash {
        if input_index >= self.input_count {
            return single_bug_hash();
        }
        let base_type = sighash_type & 0x1f;
        if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
            return single_bug_hash();
        }
        let anyone_can_pay = sighash_type & SIGHASH_ANYONECANPAY != 0;

        let mut buf = Vec::with_capacity(256 + self.all_outputs.len());
        buf.write_i32::<LittleEndian>(self.version)
            .expect("writing to a Vec cannot fail");

        // Inputs.
        if anyone_can_pay {
            write_compact_size(&mut buf, 1).expect("writing to a Vec cannot fail");
            self.encode_input(&mut buf, tx, input_index, script_code, base_type, true);
        } else {
            write_compact_size(&mut buf, tx.inputs.len() as u64)
                .expect("writing to a Vec cannot fail");
            for i in 0..tx.inputs.len() {
                self.encode_input(&mut buf, tx, i, script_code, base_type, i == input_index);
            }
        }

        // Outputs.
        match base_type {
            SIGHASH_NONE => {
                write_compact_size(&mut buf, 0).expect("writing to a Vec cannot fail");
            }
            SIGHASH_SINGLE => {
                write_compact_size(&mut buf, (input_index + 1) as u64)
                    .expect("writing to a Vec cannot fail");
                for (i, output) in tx.outputs.iter().take(input_index + 1).enumerate() {
                    if i == input_index {
                        buf.write_i64::<LittleEndian>(output.value)
                            .expect("writing to a Vec cannot fail");
                        write_bytes(&mut buf, output.script_pubkey.as_bytes())
                            .expect("writing to a Vec cannot fail");
                    } else {
                        // Earlier outputs are blanked to value -1, empty script.
                        buf.write_i64::<LittleEndian>(-1)
                            .expect("writing to a Vec cannot fail");
                        write_compact_size(&mut buf, 0).expect("writing to a Vec cannot fail");
                    }
                }
            }
            _ => buf.extend_from_slice(&self.all_outputs),
        }

        buf.write_u32::<LittleEndian>(self.lock_time)
            .expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(sighash_type)
            .expect("writing to a Vec cannot fail");
        sha256d(&buf)
    }

    fn encode_input(
        &self,
        buf: &mut Vec<u8>,
        tx: &Transaction,
        index: usize,
        script_code: &Script,
        base_type: u32,
        is_signed_input: bool,
    ) {
        let input = &tx.inputs[index];
        write_hash(buf, &input.prevout.txid).expect("writing to a Vec cannot fail");
        buf.write_u32::<LittleEndian>(input.prevout.vout)
            .expect("writing to a Vec cannot fail");
        if is_signed_input {
            write_bytes(buf, script_code.as_bytes()).expect("writing to a Vec cannot fail");
        } else {
            write_compact_size(buf, 0).expect("writing to a Vec cannot fail");
        }
        let sequence = if !is_signed_input && matches!(base_type, SIGHASH_NONE | SIGHASH_SINGLE) {
            0
        } else {
            input.sequence
        };
        buf.write_u32::<LittleEndian>(sequence)
            .expect("writing to a Vec cannot fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumecoin_core::transaction::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};
    use plumecoin_core::Script;

    fn two_in_two_out() -> Transaction {
        Transaction::new(
            1,
            vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), Script::default(), SEQUENCE_FINAL),
                TxIn::new(OutPoint::new([2u8; 32], 1), Script::default(), SEQUENCE_FINAL),
            ],
            vec![
                TxOut::new(10, Script::p2pkh(&[1u8; 20])),
                TxOut::new(20, Script::p2pkh(&[2u8; 20])),
            ],
            0,
        )
    }

    #[test]
    fn test_sighash_depends_on_input_index() {
        let tx = two_in_two_out();
        let cache = SighashCache::new(&tx);
        let code = Script::p2pkh(&[9u8; 20]);
        let h0 = cache.signature_hash(&tx, 0, &code, SIGHASH_ALL);
        let h1 = cache.signature_hash(&tx, 1, &code, SIGHASH_ALL);
        assert_ne!(h0, h1);
    }

    #[test]
    fn test_sighash_depends_on_script_code() {
        let tx = two_in_two_out();
        let cache = SighashCache::new(&tx);
        let h_a = cache.signature_hash(&tx, 0, &Script::p2pkh(&[1u8; 20]), SIGHASH_ALL);
        let h_b = cache.signature_hash(&tx, 0, &Script::p2pkh(&[2u8; 20]), SIGHASH_ALL);
        assert_ne!(h_a, h_b);
    }

    #[test]
    fn test_sighash_all_commits_to_outputs() {
        let tx = two_in_two_out();
        let code = Script::p2pkh(&[9u8; 20]);
        let h_before = SighashCache::new(&tx).signature_hash(&tx, 0, &code, SIGHASH_ALL);

        let mut changed = tx.clone();
        changed.outputs[1].value = 21;
        let h_after = SighashCache::new(&changed).signature_hash(&changed, 0, &code, SIGHASH_ALL);
        assert_ne!(h_before, h_after);

        // SIGHASH_NONE ignores outputs entirely.
        let n_before = SighashCache::new(&tx).signature_hash(&tx, 0, &code, SIGHASH_NONE);
        let n_after = SighashCache::new(&changed).signature_hash(&changed, 0, &code, SIGHASH_NONE);
        assert_eq!(n_before, n_after);
    }

    #[test]
    fn test_single_bug_hash() {
        // Two inputs, one output: SIGHASH_SINGLE on input 1 has no matching
        // output and yields the defined degenerate hash.
        let mut short = two_in_two_out();
        short.outputs.truncate(1);
        let cache = SighashCache::new(&short);
        let h = cache.signature_hash(&short, 1, &Script::default(), SIGHASH_SINGLE);
        assert_eq!(h, super::single_bug_hash());
    }
}
