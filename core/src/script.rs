//! Script Representation for Plumecoin
//!
//! Output scripts follow the Bitcoin opcode encoding. The interpreter lives
//! in the consensus crate; this module owns the byte-level representation,
//! the standard-form matchers, and the split between a base script and the
//! token region appended after `OP_TOKEN`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Script opcodes used by Plumecoin
pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    /// Marker that opens the token region of an output script
    pub const OP_TOKEN: u8 = 0xc0;
}

use opcodes::*;

/// A single decoded script element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// A non-push opcode
    Op(u8),
    /// Pushed data (small pushes and OP_PUSHDATA1/2/4)
    Push(&'a [u8]),
}

/// The standard forms an output script can take
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptForm {
    /// Pay to public key hash
    P2PKH([u8; 20]),
    /// Pay to script hash
    P2SH([u8; 20]),
    /// Provably unspendable data carrier
    OpReturn(Vec<u8>),
    /// Anything else
    Nonstandard,
}

/// A serialized script
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn new(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a standard P2PKH script
    pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        let mut script = Vec::with_capacity(25);
        script.push(OP_DUP);
        script.push(OP_HASH160);
        script.push(20);
        script.extend_from_slice(pubkey_hash);
        script.push(OP_EQUALVERIFY);
        script.push(OP_CHECKSIG);
        Script(script)
    }

    /// Build a standard P2SH script
    pub fn p2sh(script_hash: &[u8; 20]) -> Self {
        let mut script = Vec::with_capacity(23);
        script.push(OP_HASH160);
        script.push(20);
        script.extend_from_slice(script_hash);
        script.push(OP_EQUAL);
        Script(script)
    }

    /// Build an OP_RETURN data carrier
    pub fn op_return(data: &[u8]) -> Self {
        let mut script = Vec::with_capacity(data.len() + 3);
        script.push(OP_RETURN);
        push_slice(&mut script, data);
        Script(script)
    }

    /// Append a token region to a copy of this script
    pub fn with_token_region(&self, region: &[u8]) -> Self {
        let mut script = self.0.clone();
        script.push(OP_TOKEN);
        push_slice(&mut script, region);
        Script(script)
    }

    /// Iterate over decoded instructions of the full script
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            bytes: &self.0,
            pos: 0,
            last_pos: 0,
            malformed: false,
        }
    }

    /// Split the script at the token marker.
    ///
    /// Returns the base portion and, when present, the pushdata carried
    /// after `OP_TOKEN`. Scripts without a marker return themselves whole.
    pub fn token_split(&self) -> (&[u8], Option<&[u8]>) {
        let mut iter = Instructions {
            bytes: &self.0,
            pos: 0,
            last_pos: 0,
            malformed: false,
        };
        while let Some(ins) = iter.next() {
            if let Instruction::Op(OP_TOKEN) = ins {
                let base_end = iter.last_pos;
                // The region is a single pushdata right after the marker.
                if let Some(Instruction::Push(region)) = iter.next() {
                    return (&self.0[..base_end], Some(region));
                }
                return (&self.0[..base_end], None);
            }
        }
        (&self.0, None)
    }

    /// The base script with any token region removed
    pub fn base_script(&self) -> Script {
        let (base, _) = self.token_split();
        Script(base.to_vec())
    }

    /// Classify the base script into its standard form
    pub fn form(&self) -> ScriptForm {
        let (base, _) = self.token_split();
        if base.len() == 25
            && base[0] == OP_DUP
            && base[1] == OP_HASH160
            && base[2] == 20
            && base[23] == OP_EQUALVERIFY
            && base[24] == OP_CHECKSIG
        {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&base[3..23]);
            return ScriptForm::P2PKH(hash);
        }
        if base.len() == 23 && base[0] == OP_HASH160 && base[1] == 20 && base[22] == OP_EQUAL {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&base[2..22]);
            return ScriptForm::P2SH(hash);
        }
        if !base.is_empty() && base[0] == OP_RETURN {
            let script = Script(base.to_vec());
            let mut data = Vec::new();
            for ins in script.instructions().skip(1) {
                if let Instruction::Push(bytes) = ins {
                    data.extend_from_slice(bytes);
                }
            }
            return ScriptForm::OpReturn(data);
        }
        ScriptForm::Nonstandard
    }

    /// Whether the base script is provably unspendable
    pub fn is_unspendable(&self) -> bool {
        let (base, _) = self.token_split();
        !base.is_empty() && base[0] == OP_RETURN
    }

    /// The 20-byte address hash this script pays to, if standard
    pub fn address_hash(&self) -> Option<[u8; 20]> {
        match self.form() {
            ScriptForm::P2PKH(hash) | ScriptForm::P2SH(hash) => Some(hash),
            _ => None,
        }
    }

    /// Count legacy signature operations in this script.
    ///
    /// CHECKSIG counts one; CHECKMULTISIG counts twenty, matching the
    /// conservative legacy accounting.
    pub fn sigop_count(&self) -> u32 {
        let mut count = 0;
        for ins in self.instructions() {
            match ins {
                Instruction::Op(OP_CHECKSIG) | Instruction::Op(OP_CHECKSIGVERIFY) => count += 1,
                Instruction::Op(OP_CHECKMULTISIG) | Instruction::Op(OP_CHECKMULTISIGVERIFY) => {
                    count += 20
                }
                _ => {}
            }
        }
        count
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }
}

/// Append a minimally-encoded push of `data` to `script`
pub fn push_slice(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0..=0x4b => script.push(data.len() as u8),
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
        }
        0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        _ => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Iterator over script instructions
pub struct Instructions<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Offset of the most recently decoded instruction
    last_pos: usize,
    malformed: bool,
}

impl<'a> Instructions<'a> {
    fn read_push(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            self.malformed = true;
            return None;
        }
        let data = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Some(data)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.malformed || self.pos >= self.bytes.len() {
            return None;
        }
        self.last_pos = self.pos;
        let opcode = self.bytes[self.pos];
        self.pos += 1;
        match opcode {
            0x01..=0x4b => self.read_push(opcode as usize).map(Instruction::Push),
            OP_PUSHDATA1 => {
                let len = *self.bytes.get(self.pos)? as usize;
                self.pos += 1;
                self.read_push(len).map(Instruction::Push)
            }
            OP_PUSHDATA2 => {
                if self.pos + 2 > self.bytes.len() {
                    self.malformed = true;
                    return None;
                }
                let len =
                    u16::from_le_bytes([self.bytes[self.pos], self.bytes[self.pos + 1]]) as usize;
                self.pos += 2;
                self.read_push(len).map(Instruction::Push)
            }
            OP_PUSHDATA4 => {
                if self.pos + 4 > self.bytes.len() {
                    self.malformed = true;
                    return None;
                }
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(&self.bytes[self.pos..self.pos + 4]);
                self.pos += 4;
                self.read_push(u32::from_le_bytes(len_bytes) as usize)
                    .map(Instruction::Push)
            }
            op => Some(Instruction::Op(op)),
        }
    }
}
