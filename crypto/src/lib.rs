//! Cryptographic primitives for Plumecoin
//!
//! Signature creation and verification over secp256k1, plus the address
//! encoding used by output scripts. Signature hashes are computed by the
//! consensus crate; everything here operates on the finished 32-byte digest.

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key format")]
    InvalidKey,
    #[error("Invalid signature format")]
    InvalidSignature,
    #[error("Signing failed")]
    SigningError,
}

/// A Plumecoin address: the 20-byte hash of a serialized public key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Create a new address from a public key
    pub fn from_pubkey(pubkey: &PublicKey) -> Self {
        Address(pubkey_hash(&pubkey.serialize()))
    }

    /// Convert address to base58 string
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Create address from base58 string
    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        match bs58::decode(s).into_vec() {
            Ok(bytes) if bytes.len() == 20 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&bytes);
                Ok(Address(hash))
            }
            _ => Err(CryptoError::InvalidKey),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

/// Hash a serialized public key to its 20-byte address form
pub fn pubkey_hash(pubkey_bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha256::new();
    hasher.update(pubkey_bytes);
    let digest = hasher.finalize();
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest[..20]);
    hash
}

/// Signs a precomputed 32-byte signature hash
pub fn sign_digest(digest: &[u8; 32], secret_key: &SecretKey) -> Result<Vec<u8>, CryptoError> {
    let secp = Secp256k1::new();
    let msg = Message::from_slice(digest).map_err(|_| CryptoError::SigningError)?;
    Ok(secp.sign_ecdsa(&msg, secret_key).serialize_compact().to_vec())
}

/// Verifies a compact signature against a precomputed 32-byte digest.
///
/// Returns `Ok(false)` for a well-formed signature that does not verify;
/// malformed keys or signatures are errors so callers can distinguish
/// encoding problems from plain verification failure.
pub fn verify_digest(
    digest: &[u8; 32],
    signature: &[u8],
    pubkey_bytes: &[u8],
) -> Result<bool, CryptoError> {
    let secp = Secp256k1::verification_only();
    let msg = Message::from_slice(digest).map_err(|_| CryptoError::InvalidSignature)?;
    let pubkey = PublicKey::from_slice(pubkey_bytes).map_err(|_| CryptoError::InvalidKey)?;
    let sig = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    Ok(secp.verify_ecdsa(&msg, &sig, &pubkey).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn test_address_generation() {
        let secp = Secp256k1::new();
        let (_secret_key, public_key) = secp.generate_keypair(&mut thread_rng());
        let address = Address::from_pubkey(&public_key);
        let base58 = address.to_base58();
        let decoded = Address::from_base58(&base58).unwrap();
        assert_eq!(address.0, decoded.0);
    }

    #[test]
    fn test_signing_and_verification() {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut thread_rng());
        let digest = [0x42u8; 32];

        let signature = sign_digest(&digest, &secret_key).unwrap();
        let ok = verify_digest(&digest, &signature, &public_key.serialize()).unwrap();
        assert!(ok);

        let mut other = digest;
        other[0] ^= 1;
        let ok = verify_digest(&other, &signature, &public_key.serialize()).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_malformed_signature_is_an_error() {
        let secp = Secp256k1::new();
        let (_sk, pk) = secp.generate_keypair(&mut thread_rng());
        let digest = [0u8; 32];
        assert!(verify_digest(&digest, &[1, 2, 3], &pk.serialize()).is_err());
    }
}
