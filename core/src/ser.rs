//! Consensus Serialization for Plumecoin
//!
//! Everything that is hashed or written to block and undo files goes through
//! the encoding defined here: little-endian integers, compact-size lengths,
//! and length-prefixed byte vectors. Operator-facing artifacts use serde
//! instead; this format is only for consensus data.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::Hash;

/// Serialization errors
#[derive(Debug, Error)]
pub enum SerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Non-canonical compact size")]
    NonCanonicalSize,

    #[error("Oversized field: {0} bytes")]
    Oversized(u64),

    #[error("Unexpected trailing bytes")]
    TrailingBytes,
}

/// Largest single vector we will allocate while decoding
pub const MAX_VEC_SIZE: u64 = 4_000_000;

/// Types that can be encoded in the consensus format
pub trait Encodable {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> io::Result<usize>;

    /// Serialize into a fresh byte vector
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.consensus_encode(&mut out)
            .expect("writing to a Vec cannot fail");
        out
    }
}

/// Types that can be decoded from the consensus format
pub trait Decodable: Sized {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, SerError>;

    /// Deserialize from a byte slice, rejecting trailing garbage
    fn from_bytes(bytes: &[u8]) -> Result<Self, SerError> {
        let mut cursor = io::Cursor::new(bytes);
        let value = Self::consensus_decode(&mut cursor)?;
        if cursor.position() != bytes.len() as u64 {
            return Err(SerError::TrailingBytes);
        }
        Ok(value)
    }
}

/// Write a compact-size length prefix
pub fn write_compact_size<W: Write>(w: &mut W, n: u64) -> io::Result<usize> {
    if n < 0xfd {
        w.write_u8(n as u8)?;
        Ok(1)
    } else if n <= 0xffff {
        w.write_u8(0xfd)?;
        w.write_u16::<LittleEndian>(n as u16)?;
        Ok(3)
    } else if n <= 0xffff_ffff {
        w.write_u8(0xfe)?;
        w.write_u32::<LittleEndian>(n as u32)?;
        Ok(5)
    } else {
        w.write_u8(0xff)?;
        w.write_u64::<LittleEndian>(n)?;
        Ok(9)
    }
}

/// Read a compact-size length prefix, enforcing the canonical encoding
pub fn read_compact_size<R: Read>(r: &mut R) -> Result<u64, SerError> {
    let first = r.read_u8()?;
    let n = match first {
        0xfd => {
            let v = r.read_u16::<LittleEndian>()? as u64;
            if v < 0xfd {
                return Err(SerError::NonCanonicalSize);
            }
            v
        }
        0xfe => {
            let v = r.read_u32::<LittleEndian>()? as u64;
            if v <= 0xffff {
                return Err(SerError::NonCanonicalSize);
            }
            v
        }
        0xff => {
            let v = r.read_u64::<LittleEndian>()?;
            if v <= 0xffff_ffff {
                return Err(SerError::NonCanonicalSize);
            }
            v
        }
        v => v as u64,
    };
    Ok(n)
}

/// Write a length-prefixed byte vector
pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<usize> {
    let mut len = write_compact_size(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    len += bytes.len();
    Ok(len)
}

/// Read a length-prefixed byte vector
pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, SerError> {
    let len = read_compact_size(r)?;
    if len > MAX_VEC_SIZE {
        return Err(SerError::Oversized(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a fixed 32-byte hash
pub fn write_hash<W: Write>(w: &mut W, hash: &Hash) -> io::Result<usize> {
    w.write_all(hash)?;
    Ok(32)
}

/// Read a fixed 32-byte hash
pub fn read_hash<R: Read>(r: &mut R) -> Result<Hash, SerError> {
    let mut hash = [0u8; 32];
    r.read_exact(&mut hash)?;
    Ok(hash)
}

/// Double SHA-256 of a byte slice
pub fn sha256d(bytes: &[u8]) -> Hash {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}

/// Single SHA-256 of a byte slice
pub fn sha256(bytes: &[u8]) -> Hash {
    Sha256::digest(bytes).into()
}

/// Hash a pair of hashes together, as used by the merkle tree
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    sha256d(&combined)
}

/// Compute a merkle root over a list of leaf hashes.
///
/// An odd leaf is paired with itself. An empty list hashes to all zeroes.
pub fn merkle_root(mut hashes: Vec<Hash>) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            let last = *hashes.last().expect("non-empty");
            hashes.push(last);
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    hashes[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_roundtrip() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n).unwrap();
            let mut cursor = io::Cursor::new(&buf);
            assert_eq!(read_compact_size(&mut cursor).unwrap(), n);
        }
    }

    #[test]
    fn test_compact_size_rejects_non_canonical() {
        // 0xfd prefix carrying a value that fits in one byte
        let buf = [0xfdu8, 0x01, 0x00];
        let mut cursor = io::Cursor::new(&buf[..]);
        assert!(matches!(
            read_compact_size(&mut cursor),
            Err(SerError::NonCanonicalSize)
        ));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let data = vec![7u8; 300];
        let mut buf = Vec::new();
        write_bytes(&mut buf, &data).unwrap();
        let mut cursor = io::Cursor::new(&buf);
        assert_eq!(read_bytes(&mut cursor).unwrap(), data);
    }

    #[test]
    fn test_merkle_root_single_leaf_is_identity() {
        let leaf = [3u8; 32];
        assert_eq!(merkle_root(vec![leaf]), leaf);
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));
        assert_eq!(merkle_root(vec![a, b, c]), expected);
    }
}
