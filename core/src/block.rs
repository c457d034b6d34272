//! Block and BlockHeader Implementations for Plumecoin
//!
//! Blocks are either proof-of-work or proof-of-stake. A PoS block carries a
//! coinstake transaction in slot one and a block signature trailing the
//! transaction list, made by the key that signs the kernel input.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

use crate::ser::{
    merkle_root, read_bytes, read_compact_size, read_hash, sha256d, write_bytes,
    write_compact_size, write_hash, Decodable, Encodable, SerError,
};
use crate::{Hash, Transaction};

/// Magic prefix identifying a witness commitment output in the coinbase
pub const WITNESS_COMMITMENT_HEADER: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];

/// Block header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: i32,
    /// Hash of the previous block
    pub prev_block_hash: Hash,
    /// Merkle root of transaction ids
    pub merkle_root: Hash,
    /// Block timestamp
    pub timestamp: u32,
    /// Compact difficulty target
    pub bits: u32,
    /// Nonce for proof of work
    pub nonce: u32,
}

impl BlockHeader {
    /// Get the block hash
    pub fn hash(&self) -> Hash {
        sha256d(&self.to_bytes())
    }

    /// Get the block timestamp as a DateTime
    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        w.write_i32::<LittleEndian>(self.version)?;
        write_hash(w, &self.prev_block_hash)?;
        write_hash(w, &self.merkle_root)?;
        w.write_u32::<LittleEndian>(self.timestamp)?;
        w.write_u32::<LittleEndian>(self.bits)?;
        w.write_u32::<LittleEndian>(self.nonce)?;
        Ok(80)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, SerError> {
        Ok(BlockHeader {
            version: r.read_i32::<LittleEndian>()?,
            prev_block_hash: read_hash(r)?,
            merkle_root: read_hash(r)?,
            timestamp: r.read_u32::<LittleEndian>()?,
            bits: r.read_u32::<LittleEndian>()?,
            nonce: r.read_u32::<LittleEndian>()?,
        })
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockHeader {{ hash: {}, prev: {}, time: {}, bits: {:08x} }}",
            hex::encode(&self.hash()[0..8]),
            hex::encode(&self.prev_block_hash[0..8]),
            self.datetime().format("%Y-%m-%d %H:%M:%S"),
            self.bits,
        )
    }
}

/// Block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Transactions
    pub transactions: Vec<Transaction>,
    /// Block signature; empty for proof-of-work blocks
    pub signature: Vec<u8>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
            signature: Vec::new(),
        }
    }

    /// Get the block hash
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// A proof-of-stake block has a coinstake transaction in slot one
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    /// Calculate the merkle root of the transaction ids
    pub fn calculate_merkle_root(&self) -> Hash {
        merkle_root(self.transactions.iter().map(|tx| tx.txid()).collect())
    }

    /// Calculate the witness merkle root (wtxids, coinbase zeroed)
    pub fn calculate_witness_root(&self) -> Hash {
        merkle_root(self.transactions.iter().map(|tx| tx.wtxid()).collect())
    }

    /// Whether any transaction carries witness data
    pub fn has_witness(&self) -> bool {
        self.transactions.iter().any(|tx| tx.has_witness())
    }

    /// Extract the witness commitment from the coinbase, if present.
    ///
    /// The commitment is the last coinbase output whose script starts with
    /// `OP_RETURN 0x24 aa21a9ed`, carrying 32 commitment bytes after the
    /// magic.
    pub fn witness_commitment(&self) -> Option<Hash> {
        let coinbase = self.transactions.first()?;
        if !coinbase.is_coinbase() {
            return None;
        }
        for output in coinbase.outputs.iter().rev() {
            let script = output.script_pubkey.as_bytes();
            if script.len() >= 38
                && script[0] == crate::script::opcodes::OP_RETURN
                && script[1] == 0x24
                && script[2..6] == WITNESS_COMMITMENT_HEADER
            {
                let mut commitment = [0u8; 32];
                commitment.copy_from_slice(&script[6..38]);
                return Some(commitment);
            }
        }
        None
    }

    /// Serialized size with witness data
    pub fn total_size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Block weight: header and tx base bytes count four times
    pub fn weight(&self) -> usize {
        let tx_weight: usize = self.transactions.iter().map(|tx| tx.weight()).sum();
        // 80-byte header plus the tx count and signature framing at base rate.
        let mut overhead = Vec::new();
        write_compact_size(&mut overhead, self.transactions.len() as u64)
            .expect("writing to a Vec cannot fail");
        write_bytes(&mut overhead, &self.signature).expect("writing to a Vec cannot fail");
        (80 + overhead.len()) * 4 + tx_weight
    }
}

impl Encodable for Block {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = self.header.consensus_encode(w)?;
        len += write_compact_size(w, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            len += tx.consensus_encode(w)?;
        }
        len += write_bytes(w, &self.signature)?;
        Ok(len)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, SerError> {
        let header = BlockHeader::consensus_decode(r)?;
        let tx_count = read_compact_size(r)?;
        let mut transactions = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::consensus_decode(r)?);
        }
        let signature = read_bytes(r)?;
        Ok(Block {
            header,
            transactions,
            signature,
        })
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block {{ hash: {}, txs: {}, pos: {} }}",
            hex::encode(&self.hash()[0..8]),
            self.transactions.len(),
            self.is_proof_of_stake(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};
    use crate::Script;

    fn coinbase_tx(height: u64) -> Transaction {
        let mut script_sig = Vec::new();
        crate::script::push_slice(&mut script_sig, &height.to_le_bytes());
        Transaction::new(
            1,
            vec![TxIn::new(OutPoint::null(), Script(script_sig), SEQUENCE_FINAL)],
            vec![TxOut::new(10, Script::p2pkh(&[0u8; 20]))],
            0,
        )
    }

    fn test_block() -> Block {
        let coinbase = coinbase_tx(5);
        let spend = Transaction::new(
            1,
            vec![TxIn::new(
                OutPoint::new([1u8; 32], 0),
                Script(vec![0x01, 0x00]),
                SEQUENCE_FINAL,
            )],
            vec![TxOut::new(40, Script::p2pkh(&[2u8; 20]))],
            0,
        );
        let mut block = Block::new(
            BlockHeader {
                version: 1,
                prev_block_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1_700_000_000,
                bits: 0x207fffff,
                nonce: 7,
            },
            vec![coinbase, spend],
        );
        block.header.merkle_root = block.calculate_merkle_root();
        block
    }

    #[test]
    fn test_block_roundtrip() {
        let block = test_block();
        let bytes = block.to_bytes();
        let decoded = Block::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_header_hash_changes_with_nonce() {
        let mut block = test_block();
        let first = block.hash();
        block.header.nonce += 1;
        assert_ne!(block.hash(), first);
    }

    #[test]
    fn test_pos_detection() {
        let mut block = test_block();
        assert!(!block.is_proof_of_stake());

        let coinstake = Transaction::new(
            1,
            vec![TxIn::new(
                OutPoint::new([9u8; 32], 1),
                Script::default(),
                SEQUENCE_FINAL,
            )],
            vec![TxOut::empty(), TxOut::new(90, Script::p2pkh(&[3u8; 20]))],
            0,
        );
        block.transactions.insert(1, coinstake);
        assert!(block.is_proof_of_stake());
    }

    #[test]
    fn test_witness_commitment_extraction() {
        let mut block = test_block();
        assert_eq!(block.witness_commitment(), None);

        let mut script = vec![crate::script::opcodes::OP_RETURN, 0x24];
        script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
        script.extend_from_slice(&[0x11u8; 32]);
        block.transactions[0]
            .outputs
            .push(TxOut::new(0, Script(script)));
        assert_eq!(block.witness_commitment(), Some([0x11u8; 32]));
    }
}
