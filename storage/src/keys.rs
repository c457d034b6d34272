//! Index Database Key Scheme
//!
//! Every record in the index database lives under a one-byte prefix:
//!
//! ```text
//! b | <hash>                               block metadata
//! f | <u32>                                block-file info
//! t | <txid>                               tx index
//! a | <type, hash, token?, height, txid, vout>   address index
//! u | <type, hash, token?, outpoint>       address-unspent index
//! s | <prev_outpoint>                      spent index
//! T | <time, height>                       timestamp index
//! F | <flag name>                          boolean flags
//! R                                        reindex sentinel
//! c | <outpoint>                           coin state
//! B / O                                    coin head markers (new / old tip)
//! i|w|q|z|g|v                              token state tables
//! ```
//!
//! Multi-field keys are big-endian so lexicographic scans walk in logical
//! order.

use plumecoin_core::{Hash, OutPoint};

/// Address type discriminant inside address-index keys
pub const ADDR_TYPE_P2PKH: u8 = 1;
pub const ADDR_TYPE_P2SH: u8 = 2;

fn push_outpoint(key: &mut Vec<u8>, outpoint: &OutPoint) {
    key.extend_from_slice(&outpoint.txid);
    key.extend_from_slice(&outpoint.vout.to_be_bytes());
}

fn push_token(key: &mut Vec<u8>, token: Option<&str>) {
    match token {
        Some(name) => {
            key.push(name.len() as u8);
            key.extend_from_slice(name.as_bytes());
        }
        None => key.push(0),
    }
}

pub fn block_index_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'b');
    key.extend_from_slice(hash);
    key
}

pub const BLOCK_INDEX_PREFIX: [u8; 1] = [b'b'];

pub fn file_info_key(file: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'f');
    key.extend_from_slice(&file.to_be_bytes());
    key
}

pub const FILE_INFO_PREFIX: [u8; 1] = [b'f'];

pub fn tx_index_key(txid: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b't');
    key.extend_from_slice(txid);
    key
}

pub fn address_index_key(
    addr_type: u8,
    hash: &[u8; 20],
    token: Option<&str>,
    height: u64,
    txid: &Hash,
    vout: u32,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(70);
    key.push(b'a');
    key.push(addr_type);
    key.extend_from_slice(hash);
    push_token(&mut key, token);
    key.extend_from_slice(&(height as u32).to_be_bytes());
    key.extend_from_slice(txid);
    key.extend_from_slice(&vout.to_be_bytes());
    key
}

/// Prefix covering every address-index entry of one address
pub fn address_index_prefix(addr_type: u8, hash: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(22);
    key.push(b'a');
    key.push(addr_type);
    key.extend_from_slice(hash);
    key
}

pub fn unspent_index_key(
    addr_type: u8,
    hash: &[u8; 20],
    token: Option<&str>,
    outpoint: &OutPoint,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.push(b'u');
    key.push(addr_type);
    key.extend_from_slice(hash);
    push_token(&mut key, token);
    push_outpoint(&mut key, outpoint);
    key
}

pub fn spent_index_key(prevout: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(b's');
    push_outpoint(&mut key, prevout);
    key
}

pub fn timestamp_index_key(time: u32, height: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'T');
    key.extend_from_slice(&time.to_be_bytes());
    key.extend_from_slice(&(height as u32).to_be_bytes());
    key
}

pub fn flag_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'F');
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn reindex_key() -> Vec<u8> {
    vec![b'R']
}

pub fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(b'c');
    push_outpoint(&mut key, outpoint);
    key
}

/// Marker: the block the coin state currently describes
pub fn coin_best_block_key() -> Vec<u8> {
    vec![b'B']
}

/// Marker: the block the coin state described before the in-flight flush
pub fn coin_old_tip_key() -> Vec<u8> {
    vec![b'O']
}

pub fn token_issuance_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'i');
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn token_ownership_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'w');
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn qualifier_tag_key(qualifier: &str, address: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(22 + qualifier.len());
    key.push(b'q');
    key.push(qualifier.len() as u8);
    key.extend_from_slice(qualifier.as_bytes());
    key.extend_from_slice(address);
    key
}

pub fn address_freeze_key(name: &str, address: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(22 + name.len());
    key.push(b'z');
    key.push(name.len() as u8);
    key.extend_from_slice(name.as_bytes());
    key.extend_from_slice(address);
    key
}

pub fn global_freeze_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'g');
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn verifier_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'v');
    key.extend_from_slice(name.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_prefix_disjoint() {
        let hash = [1u8; 32];
        let outpoint = OutPoint::new([2u8; 32], 3);
        let keys = vec![
            block_index_key(&hash),
            file_info_key(1),
            tx_index_key(&hash),
            spent_index_key(&outpoint),
            coin_key(&outpoint),
            coin_best_block_key(),
            coin_old_tip_key(),
            flag_key("txindex"),
            reindex_key(),
            token_issuance_key("EMBER"),
            token_ownership_key("EMBER"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_address_index_orders_by_height() {
        let low = address_index_key(ADDR_TYPE_P2PKH, &[1u8; 20], None, 5, &[0u8; 32], 0);
        let high = address_index_key(ADDR_TYPE_P2PKH, &[1u8; 20], None, 6, &[0u8; 32], 0);
        assert!(low < high);
        let prefix = address_index_prefix(ADDR_TYPE_P2PKH, &[1u8; 20]);
        assert!(low.starts_with(&prefix));
        assert!(high.starts_with(&prefix));
    }
}
