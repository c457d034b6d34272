//! Transaction Implementation for Plumecoin
//!
//! Transactions follow the Bitcoin wire layout, including the optional
//! witness section behind the 0x00 0x01 marker bytes. A coinstake
//! transaction is the proof-of-stake counterpart of a coinbase: it spends a
//! real input and leaves its first output empty.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

use crate::ser::{
    read_bytes, read_compact_size, read_hash, sha256d, write_bytes, write_compact_size,
    write_hash, Decodable, Encodable, SerError,
};
use crate::{Amount, Hash, Script};

/// Sequence value that disables lock-time enforcement for a transaction
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Sequence flag: relative lock disabled for this input
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// Sequence flag: relative lock is time-based rather than height-based
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// Mask extracting the relative lock value from a sequence number
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// Lock-time values below this are block heights; above, unix times
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Reference to a transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction id of the output's creator
    pub txid: Hash,
    /// Output index
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// The null outpoint used by coinbase inputs
    pub fn null() -> Self {
        OutPoint {
            txid: [0u8; 32],
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.vout == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.txid), self.vout)
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// Previous output being spent
    pub prevout: OutPoint,
    /// Script satisfying the previous output's conditions
    pub script_sig: Script,
    /// Sequence number
    pub sequence: u32,
    /// Witness stack; empty for non-witness spends
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Script, sequence: u32) -> Self {
        TxIn {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Output value in base units
    pub value: Amount,
    /// Conditions to spend this output
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Script) -> Self {
        TxOut {
            value,
            script_pubkey,
        }
    }

    /// The empty marker output that opens a coinstake transaction
    pub fn empty() -> Self {
        TxOut {
            value: 0,
            script_pubkey: Script::default(),
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction version
    pub version: i32,
    /// Transaction inputs
    pub inputs: Vec<TxIn>,
    /// Transaction outputs
    pub outputs: Vec<TxOut>,
    /// Lock time: a height or a unix time, per LOCKTIME_THRESHOLD
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: i32, inputs: Vec<TxIn>, outputs: Vec<TxOut>, lock_time: u32) -> Self {
        Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Check if this is a coinstake transaction
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty_marker()
    }

    /// Whether any input carries witness data
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Transaction id: hash of the serialization without witness data
    pub fn txid(&self) -> Hash {
        let mut buf = Vec::new();
        self.encode_inner(&mut buf, false)
            .expect("writing to a Vec cannot fail");
        sha256d(&buf)
    }

    /// Witness transaction id: hash of the full serialization.
    ///
    /// The coinbase wtxid is defined as all zeroes for the witness
    /// commitment computation.
    pub fn wtxid(&self) -> Hash {
        if self.is_coinbase() {
            return [0u8; 32];
        }
        sha256d(&self.to_bytes())
    }

    /// Total output value; saturates rather than wrapping so callers can
    /// run the proper overflow checks against MAX_MONEY
    pub fn output_value(&self) -> Amount {
        self.outputs
            .iter()
            .fold(0i64, |acc, out| acc.saturating_add(out.value))
    }

    /// Serialized size without witness data
    pub fn base_size(&self) -> usize {
        let mut buf = Vec::new();
        self.encode_inner(&mut buf, false)
            .expect("writing to a Vec cannot fail");
        buf.len()
    }

    /// Full serialized size
    pub fn total_size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Weight: base size counts four times, witness bytes once
    pub fn weight(&self) -> usize {
        self.base_size() * 3 + self.total_size()
    }

    /// Virtual size used for fee rates and mempool accounting
    pub fn vsize(&self) -> usize {
        (self.weight() + 3) / 4
    }

    /// Legacy sigop count over all input and output scripts
    pub fn sigop_count(&self) -> u32 {
        let input_ops: u32 = self
            .inputs
            .iter()
            .map(|input| input.script_sig.sigop_count())
            .sum();
        let output_ops: u32 = self
            .outputs
            .iter()
            .map(|output| output.script_pubkey.sigop_count())
            .sum();
        input_ops + output_ops
    }

    /// Whether the transaction is final at the given height and time.
    ///
    /// A non-zero lock time only binds while some input's sequence is not
    /// SEQUENCE_FINAL.
    pub fn is_final(&self, height: u64, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < threshold {
            return true;
        }
        self.inputs
            .iter()
            .all(|input| input.sequence == SEQUENCE_FINAL)
    }

    fn encode_inner<W: Write>(&self, w: &mut W, with_witness: bool) -> io::Result<usize> {
        let mut len = 0;
        w.write_i32::<LittleEndian>(self.version)?;
        len += 4;

        let use_witness = with_witness && self.has_witness();
        if use_witness {
            w.write_u8(0x00)?;
            w.write_u8(0x01)?;
            len += 2;
        }

        len += write_compact_size(w, self.inputs.len() as u64)?;
        for input in &self.inputs {
            len += write_hash(w, &input.prevout.txid)?;
            w.write_u32::<LittleEndian>(input.prevout.vout)?;
            len += 4;
            len += write_bytes(w, input.script_sig.as_bytes())?;
            w.write_u32::<LittleEndian>(input.sequence)?;
            len += 4;
        }

        len += write_compact_size(w, self.outputs.len() as u64)?;
        for output in &self.outputs {
            w.write_i64::<LittleEndian>(output.value)?;
            len += 8;
            len += write_bytes(w, output.script_pubkey.as_bytes())?;
        }

        if use_witness {
            for input in &self.inputs {
                len += write_compact_size(w, input.witness.len() as u64)?;
                for item in &input.witness {
                    len += write_bytes(w, item)?;
                }
            }
        }

        w.write_u32::<LittleEndian>(self.lock_time)?;
        len += 4;
        Ok(len)
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        self.encode_inner(w, true)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, SerError> {
        let version = r.read_i32::<LittleEndian>()?;

        let mut input_count = read_compact_size(r)?;
        let mut has_witness = false;
        if input_count == 0 {
            // Either the witness marker or a malformed empty-input tx; the
            // flag byte decides.
            let flag = r.read_u8()?;
            if flag != 0x01 {
                return Err(SerError::NonCanonicalSize);
            }
            has_witness = true;
            input_count = read_compact_size(r)?;
        }

        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            let txid = read_hash(r)?;
            let vout = r.read_u32::<LittleEndian>()?;
            let script_sig = Script(read_bytes(r)?);
            let sequence = r.read_u32::<LittleEndian>()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }

        let output_count = read_compact_size(r)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            let value = r.read_i64::<LittleEndian>()?;
            let script_pubkey = Script(read_bytes(r)?);
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        if has_witness {
            for input in &mut inputs {
                let item_count = read_compact_size(r)?;
                let mut witness = Vec::with_capacity(item_count.min(64) as usize);
                for _ in 0..item_count {
                    witness.push(read_bytes(r)?);
                }
                input.witness = witness;
            }
        }

        let lock_time = r.read_u32::<LittleEndian>()?;
        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tx {{ id: {}, ins: {}, outs: {} }}",
            hex::encode(&self.txid()[0..8]),
            self.inputs.len(),
            self.outputs.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Script;

    fn simple_tx() -> Transaction {
        let input = TxIn::new(
            OutPoint::new([1u8; 32], 0),
            Script(vec![0x01, 0x02]),
            SEQUENCE_FINAL,
        );
        let output = TxOut::new(50_000_000, Script::p2pkh(&[0u8; 20]));
        Transaction::new(1, vec![input], vec![output], 0)
    }

    #[test]
    fn test_roundtrip_without_witness() {
        let tx = simple_tx();
        let bytes = tx.to_bytes();
        let decoded = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn test_roundtrip_with_witness() {
        let mut tx = simple_tx();
        tx.inputs[0].witness = vec![vec![0xaa; 71], vec![0xbb; 33]];
        let bytes = tx.to_bytes();
        let decoded = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
        // txid ignores the witness
        let mut stripped = tx.clone();
        stripped.inputs[0].witness.clear();
        assert_eq!(decoded.txid(), stripped.txid());
        assert_ne!(decoded.wtxid(), decoded.txid());
    }

    #[test]
    fn test_coinbase_detection() {
        let coinbase = Transaction::new(
            1,
            vec![TxIn::new(OutPoint::null(), Script(vec![0x03]), SEQUENCE_FINAL)],
            vec![TxOut::new(10, Script::p2pkh(&[0u8; 20]))],
            0,
        );
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());
        assert_eq!(coinbase.wtxid(), [0u8; 32]);
    }

    #[test]
    fn test_coinstake_detection() {
        let coinstake = Transaction::new(
            1,
            vec![TxIn::new(
                OutPoint::new([1u8; 32], 0),
                Script::default(),
                SEQUENCE_FINAL,
            )],
            vec![
                TxOut::empty(),
                TxOut::new(90, Script::p2pkh(&[0u8; 20])),
            ],
            0,
        );
        assert!(coinstake.is_coinstake());
        assert!(!coinstake.is_coinbase());
    }

    #[test]
    fn test_finality() {
        let mut tx = simple_tx();
        assert!(tx.is_final(0, 0));

        tx.lock_time = 100;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));

        // SEQUENCE_FINAL opts out of lock-time enforcement.
        tx.inputs[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(100, 0));
    }
}
