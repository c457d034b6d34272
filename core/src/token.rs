//! Token Script Layer for Plumecoin
//!
//! Token operations ride inside ordinary output scripts: a base payment
//! script followed by `OP_TOKEN` and one pushdata region. The region starts
//! with the `plm` tag and an operation byte, then the operation payload.
//! Decoding is strict; a malformed region invalidates the output rather
//! than degrading to a plain payment.
//!
//! Name grammar: root tokens are 3-31 chars of `A-Z 0-9 . _`, `$NAME` is a
//! restricted token, `#NAME` a qualifier, and `NAME!` the ownership token
//! of its root.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::{Amount, Script};

/// Region tag that must open every token pushdata
pub const TOKEN_TAG: &[u8; 3] = b"plm";

/// Longest permitted token name, including prefix/suffix characters
pub const MAX_NAME_LEN: usize = 31;

/// Longest permitted verifier string
pub const MAX_VERIFIER_LEN: usize = 80;

/// Token script decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token region too short")]
    Truncated,

    #[error("Bad token tag")]
    BadTag,

    #[error("Unknown token operation: {0:#04x}")]
    UnknownOp(u8),

    #[error("Invalid token name: {0}")]
    BadName(String),

    #[error("Invalid token amount: {0}")]
    BadAmount(Amount),

    #[error("Invalid units: {0}")]
    BadUnits(u8),

    #[error("Verifier string too long")]
    VerifierTooLong,

    #[error("Trailing bytes in token region")]
    TrailingBytes,
}

/// A decoded token operation carried by one transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenScript {
    /// Create a new token
    Issue {
        name: String,
        amount: Amount,
        units: u8,
        reissuable: bool,
        ipfs_hash: Option<[u8; 32]>,
    },
    /// Add supply or change metadata of an existing reissuable token
    Reissue {
        name: String,
        amount: Amount,
        units: u8,
        reissuable: bool,
        ipfs_hash: Option<[u8; 32]>,
    },
    /// Move token units to this output's base script
    Transfer { name: String, amount: Amount },
    /// The ownership token minted alongside every issuance
    Ownership { name: String },
    /// Assign or remove a qualifier tag from an address
    QualifierTag {
        qualifier: String,
        address: [u8; 20],
        assign: bool,
    },
    /// Freeze or unfreeze one address for a restricted token
    AddressFreeze {
        name: String,
        address: [u8; 20],
        frozen: bool,
    },
    /// Freeze or unfreeze a restricted token globally
    GlobalFreeze { name: String, frozen: bool },
    /// Set the verifier string of a restricted token
    Verifier { name: String, verifier: String },
}

/// The flavor a token name declares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Root,
    Restricted,
    Qualifier,
    Ownership,
}

/// Classify and validate a token name
pub fn classify_name(name: &str) -> Result<NameKind, TokenError> {
    if name.len() > MAX_NAME_LEN {
        return Err(TokenError::BadName(name.to_string()));
    }
    let (kind, body) = if let Some(rest) = name.strip_prefix('$') {
        (NameKind::Restricted, rest)
    } else if let Some(rest) = name.strip_prefix('#') {
        (NameKind::Qualifier, rest)
    } else if let Some(rest) = name.strip_suffix('!') {
        (NameKind::Ownership, rest)
    } else {
        (NameKind::Root, name)
    };
    if body.len() < 3 {
        return Err(TokenError::BadName(name.to_string()));
    }
    let valid = body
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'.' || b == b'_');
    if !valid || body.starts_with('.') || body.ends_with('.') {
        return Err(TokenError::BadName(name.to_string()));
    }
    Ok(kind)
}

impl TokenScript {
    /// The token name this operation concerns
    pub fn name(&self) -> &str {
        match self {
            TokenScript::Issue { name, .. }
            | TokenScript::Reissue { name, .. }
            | TokenScript::Transfer { name, .. }
            | TokenScript::Ownership { name }
            | TokenScript::AddressFreeze { name, .. }
            | TokenScript::GlobalFreeze { name, .. }
            | TokenScript::Verifier { name, .. } => name,
            TokenScript::QualifierTag { qualifier, .. } => qualifier,
        }
    }

    /// Decode the token operation of an output script, if it has one
    pub fn from_script(script: &Script) -> Result<Option<TokenScript>, TokenError> {
        let (_, region) = script.token_split();
        match region {
            Some(bytes) => Self::decode_region(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Decode a raw token region
    pub fn decode_region(bytes: &[u8]) -> Result<TokenScript, TokenError> {
        if bytes.len() < 4 {
            return Err(TokenError::Truncated);
        }
        if &bytes[0..3] != TOKEN_TAG {
            return Err(TokenError::BadTag);
        }
        let op = bytes[3];
        let mut r = Cursor::new(&bytes[4..]);
        let script = match op {
            b'q' => {
                let name = read_name(&mut r)?;
                let amount = read_amount(&mut r)?;
                let units = read_units(&mut r)?;
                let reissuable = read_bool(&mut r)?;
                let ipfs_hash = read_opt_hash(&mut r)?;
                TokenScript::Issue {
                    name,
                    amount,
                    units,
                    reissuable,
                    ipfs_hash,
                }
            }
            b'r' => {
                let name = read_name(&mut r)?;
                let amount = read_amount(&mut r)?;
                let units = read_units(&mut r)?;
                let reissuable = read_bool(&mut r)?;
                let ipfs_hash = read_opt_hash(&mut r)?;
                TokenScript::Reissue {
                    name,
                    amount,
                    units,
                    reissuable,
                    ipfs_hash,
                }
            }
            b't' => {
                let name = read_name(&mut r)?;
                let amount = read_amount(&mut r)?;
                TokenScript::Transfer { name, amount }
            }
            b'o' => {
                let name = read_name(&mut r)?;
                TokenScript::Ownership { name }
            }
            b'g' => {
                let qualifier = read_name(&mut r)?;
                let address = read_address(&mut r)?;
                let assign = read_bool(&mut r)?;
                TokenScript::QualifierTag {
                    qualifier,
                    address,
                    assign,
                }
            }
            b'f' => {
                let name = read_name(&mut r)?;
                let address = read_address(&mut r)?;
                let frozen = read_bool(&mut r)?;
                TokenScript::AddressFreeze {
                    name,
                    address,
                    frozen,
                }
            }
            b'F' => {
                let name = read_name(&mut r)?;
                let frozen = read_bool(&mut r)?;
                TokenScript::GlobalFreeze { name, frozen }
            }
            b'v' => {
                let name = read_name(&mut r)?;
                let verifier = read_verifier(&mut r)?;
                TokenScript::Verifier { name, verifier }
            }
            other => return Err(TokenError::UnknownOp(other)),
        };
        if r.position() != (bytes.len() - 4) as u64 {
            return Err(TokenError::TrailingBytes);
        }
        script.validate()?;
        Ok(script)
    }

    /// Encode into a raw token region
    pub fn encode_region(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.extend_from_slice(TOKEN_TAG);
        match self {
            TokenScript::Issue {
                name,
                amount,
                units,
                reissuable,
                ipfs_hash,
            } => {
                out.push(b'q');
                write_name(&mut out, name);
                write_amount(&mut out, *amount);
                out.push(*units);
                out.push(*reissuable as u8);
                write_opt_hash(&mut out, ipfs_hash);
            }
            TokenScript::Reissue {
                name,
                amount,
                units,
                reissuable,
                ipfs_hash,
            } => {
                out.push(b'r');
                write_name(&mut out, name);
                write_amount(&mut out, *amount);
                out.push(*units);
                out.push(*reissuable as u8);
                write_opt_hash(&mut out, ipfs_hash);
            }
            TokenScript::Transfer { name, amount } => {
                out.push(b't');
                write_name(&mut out, name);
                write_amount(&mut out, *amount);
            }
            TokenScript::Ownership { name } => {
                out.push(b'o');
                write_name(&mut out, name);
            }
            TokenScript::QualifierTag {
                qualifier,
                address,
                assign,
            } => {
                out.push(b'g');
                write_name(&mut out, qualifier);
                out.extend_from_slice(address);
                out.push(*assign as u8);
            }
            TokenScript::AddressFreeze {
                name,
                address,
                frozen,
            } => {
                out.push(b'f');
                write_name(&mut out, name);
                out.extend_from_slice(address);
                out.push(*frozen as u8);
            }
            TokenScript::GlobalFreeze { name, frozen } => {
                out.push(b'F');
                write_name(&mut out, name);
                out.push(*frozen as u8);
            }
            TokenScript::Verifier { name, verifier } => {
                out.push(b'v');
                write_name(&mut out, name);
                out.push(verifier.len() as u8);
                out.extend_from_slice(verifier.as_bytes());
            }
        }
        out
    }

    /// Attach this operation to a base payment script
    pub fn attach_to(&self, base: &Script) -> Script {
        base.with_token_region(&self.encode_region())
    }

    fn validate(&self) -> Result<(), TokenError> {
        let kind = classify_name(self.name())?;
        match self {
            TokenScript::Issue { amount, units, .. }
            | TokenScript::Reissue { amount, units, .. } => {
                if *amount < 0 || *amount > crate::MAX_MONEY {
                    return Err(TokenError::BadAmount(*amount));
                }
                if *units > 8 {
                    return Err(TokenError::BadUnits(*units));
                }
            }
            TokenScript::Transfer { amount, .. } => {
                if *amount <= 0 || *amount > crate::MAX_MONEY {
                    return Err(TokenError::BadAmount(*amount));
                }
            }
            TokenScript::Ownership { name } => {
                if kind != NameKind::Ownership {
                    return Err(TokenError::BadName(name.clone()));
                }
            }
            TokenScript::QualifierTag { qualifier, .. } => {
                if kind != NameKind::Qualifier {
                    return Err(TokenError::BadName(qualifier.clone()));
                }
            }
            TokenScript::AddressFreeze { name, .. }
            | TokenScript::GlobalFreeze { name, .. }
            | TokenScript::Verifier { name, .. } => {
                if kind != NameKind::Restricted {
                    return Err(TokenError::BadName(name.clone()));
                }
            }
        }
        Ok(())
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn write_amount(out: &mut Vec<u8>, amount: Amount) {
    let mut buf = Vec::with_capacity(8);
    buf.write_i64::<LittleEndian>(amount)
        .expect("writing to a Vec cannot fail");
    out.extend_from_slice(&buf);
}

fn write_opt_hash(out: &mut Vec<u8>, hash: &Option<[u8; 32]>) {
    match hash {
        Some(h) => {
            out.push(1);
            out.extend_from_slice(h);
        }
        None => out.push(0),
    }
}

fn read_name<R: Read>(r: &mut R) -> Result<String, TokenError> {
    let len = r.read_u8().map_err(|_| TokenError::Truncated)? as usize;
    if len == 0 || len > MAX_NAME_LEN {
        return Err(TokenError::BadName(format!("length {len}")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| TokenError::Truncated)?;
    String::from_utf8(buf).map_err(|e| TokenError::BadName(e.to_string()))
}

fn read_amount<R: Read>(r: &mut R) -> Result<Amount, TokenError> {
    r.read_i64::<LittleEndian>().map_err(|_| TokenError::Truncated)
}

fn read_units<R: Read>(r: &mut R) -> Result<u8, TokenError> {
    r.read_u8().map_err(|_| TokenError::Truncated)
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool, TokenError> {
    Ok(r.read_u8().map_err(|_| TokenError::Truncated)? != 0)
}

fn read_address<R: Read>(r: &mut R) -> Result<[u8; 20], TokenError> {
    let mut buf = [0u8; 20];
    r.read_exact(&mut buf).map_err(|_| TokenError::Truncated)?;
    Ok(buf)
}

fn read_opt_hash<R: Read>(r: &mut R) -> Result<Option<[u8; 32]>, TokenError> {
    if read_bool(r)? {
        let mut buf = [0u8; 32];
        r.read_exact(&mut buf).map_err(|_| TokenError::Truncated)?;
        Ok(Some(buf))
    } else {
        Ok(None)
    }
}

fn read_verifier<R: Read>(r: &mut R) -> Result<String, TokenError> {
    let len = r.read_u8().map_err(|_| TokenError::Truncated)? as usize;
    if len > MAX_VERIFIER_LEN {
        return Err(TokenError::VerifierTooLong);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| TokenError::Truncated)?;
    String::from_utf8(buf).map_err(|e| TokenError::BadName(e.to_string()))
}
