//! Script Interpreter
//!
//! Evaluates the spending path of an input against its previous output's
//! script. The executed portion is always the base script; a trailing token
//! region is data, not code. Verification flags split into the mandatory
//! set (consensus) and the standardness set used by mempool policy.

use thiserror::Error;

use plumecoin_core::script::{opcodes::*, Instruction, ScriptForm};
use plumecoin_core::{Script, Transaction};
use plumecoin_crypto::pubkey_hash;

use crate::sighash::SighashCache;

/// No flags
pub const VERIFY_NONE: u32 = 0;
/// Evaluate P2SH redeem scripts
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce exact signature and pubkey encodings
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// The CHECKMULTISIG dummy element must be empty
pub const VERIFY_NULLDUMMY: u32 = 1 << 2;
/// Exactly one element may remain after verification
pub const VERIFY_CLEANSTACK: u32 = 1 << 3;
/// scriptSig must be push-only
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 4;

/// Flags every block must satisfy
pub const MANDATORY_FLAGS: u32 = VERIFY_P2SH;

/// Flags mempool policy adds on top of the mandatory set
pub const STANDARD_FLAGS: u32 =
    MANDATORY_FLAGS | VERIFY_STRICTENC | VERIFY_NULLDUMMY | VERIFY_CLEANSTACK | VERIFY_SIGPUSHONLY;

const MAX_STACK_SIZE: usize = 1000;
const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_ELEMENT_SIZE: usize = 520;
const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

/// Compact signature plus one hash-type byte
const STRICT_SIG_LEN: usize = 65;
/// Compressed secp256k1 public key
const STRICT_PUBKEY_LEN: usize = 33;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Script too large")]
    ScriptSize,

    #[error("Pushed element too large")]
    ElementSize,

    #[error("Stack overflow")]
    StackSize,

    #[error("Operation count exceeded")]
    OpCount,

    #[error("Stack underflow")]
    InvalidStackOperation,

    #[error("OP_RETURN encountered")]
    OpReturn,

    #[error("Disabled or unknown opcode: {0:#04x}")]
    BadOpcode(u8),

    #[error("OP_VERIFY failed")]
    Verify,

    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,

    #[error("Script evaluated to false")]
    EvalFalse,

    #[error("Signature encoding not strict")]
    SigEncoding,

    #[error("Public key encoding not strict")]
    PubkeyEncoding,

    #[error("CHECKMULTISIG dummy element not null")]
    NullDummy,

    #[error("Invalid numeric encoding")]
    BadNumber,

    #[error("scriptSig is not push-only")]
    SigPushOnly,

    #[error("Stack not clean after evaluation")]
    CleanStack,
}

/// Verifies one input's signature against a script code
pub trait SignatureChecker {
    /// `signature` carries the hash-type byte at its end
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &Script) -> bool;
}

/// Checker bound to one transaction input
pub struct TransactionSigChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub cache: &'a SighashCache,
}

impl SignatureChecker for TransactionSigChecker<'_> {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &Script) -> bool {
        if signature.is_empty() {
            return false;
        }
        let (sig, type_byte) = signature.split_at(signature.len() - 1);
        let sighash_type = type_byte[0] as u32;
        let digest =
            self.cache
                .signature_hash(self.tx, self.input_index, script_code, sighash_type);
        plumecoin_crypto::verify_digest(&digest, sig, pubkey).unwrap_or(false)
    }
}

/// A checker that accepts nothing; used when scripts must not contain
/// signature operations (e.g. coinbase inputs)
pub struct RejectingChecker;

impl SignatureChecker for RejectingChecker {
    fn check_sig(&self, _signature: &[u8], _pubkey: &[u8], _script_code: &Script) -> bool {
        false
    }
}

fn cast_to_bool(element: &[u8]) -> bool {
    for (i, byte) in element.iter().enumerate() {
        if *byte != 0 {
            // Negative zero is false.
            return !(i == element.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Decode a minimally-encoded script number of up to 4 bytes
fn decode_num(element: &[u8]) -> Result<i64, ScriptError> {
    if element.len() > 4 {
        return Err(ScriptError::BadNumber);
    }
    if element.is_empty() {
        return Ok(0);
    }
    // Reject padded encodings.
    let last = element[element.len() - 1];
    if last & 0x7f == 0 && (element.len() == 1 || element[element.len() - 2] & 0x80 == 0) {
        return Err(ScriptError::BadNumber);
    }
    let mut value: i64 = 0;
    for (i, byte) in element.iter().enumerate() {
        value |= ((byte & if i == element.len() - 1 { 0x7f } else { 0xff }) as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        value = -value;
    }
    Ok(value)
}

fn is_push_only(script: &Script) -> bool {
    script.instructions().all(|ins| {
        matches!(ins, Instruction::Push(_))
            || matches!(ins, Instruction::Op(op) if op == OP_0 || (OP_1NEGATE..=OP_16).contains(&op))
    })
}

fn check_sig_encoding(signature: &[u8], flags: u32) -> Result<(), ScriptError> {
    if signature.is_empty() {
        return Ok(());
    }
    if flags & VERIFY_STRICTENC != 0 && signature.len() != STRICT_SIG_LEN {
        return Err(ScriptError::SigEncoding);
    }
    Ok(())
}

fn check_pubkey_encoding(pubkey: &[u8], flags: u32) -> Result<(), ScriptError> {
    if flags & VERIFY_STRICTENC != 0 && pubkey.len() != STRICT_PUBKEY_LEN {
        return Err(ScriptError::PubkeyEncoding);
    }
    Ok(())
}

/// Execute a script over a stack
pub fn eval_script(
    stack: &mut Vec<Vec<u8>>,
    script: &Script,
    flags: u32,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let (base, _) = script.token_split();
    if base.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let base_script = Script(base.to_vec());
    let mut op_count = 0usize;

    for ins in base_script.instructions() {
        if stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        match ins {
            Instruction::Push(data) => {
                if data.len() > MAX_ELEMENT_SIZE {
                    return Err(ScriptError::ElementSize);
                }
                stack.push(data.to_vec());
            }
            Instruction::Op(op) => {
                if op > OP_16 {
                    op_count += 1;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount);
                    }
                }
                match op {
                    OP_0 => stack.push(Vec::new()),
                    OP_1NEGATE => stack.push(vec![0x81]),
                    o if (OP_1..=OP_16).contains(&o) => {
                        stack.push(vec![o - OP_1 + 1]);
                    }
                    OP_NOP => {}
                    OP_DROP => {
                        stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    }
                    OP_DUP => {
                        let top = stack
                            .last()
                            .cloned()
                            .ok_or(ScriptError::InvalidStackOperation)?;
                        stack.push(top);
                    }
                    OP_VERIFY => {
                        let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        if !cast_to_bool(&top) {
                            return Err(ScriptError::Verify);
                        }
                    }
                    OP_RETURN => return Err(ScriptError::OpReturn),
                    OP_EQUAL | OP_EQUALVERIFY => {
                        let b = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        let a = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        let equal = a == b;
                        if op == OP_EQUALVERIFY {
                            if !equal {
                                return Err(ScriptError::EqualVerify);
                            }
                        } else {
                            stack.push(if equal { vec![1] } else { Vec::new() });
                        }
                    }
                    OP_HASH160 => {
                        let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        stack.push(pubkey_hash(&top).to_vec());
                    }
                    OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                        let pubkey = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        let signature = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        check_sig_encoding(&signature, flags)?;
                        check_pubkey_encoding(&pubkey, flags)?;
                        let ok = !signature.is_empty()
                            && checker.check_sig(&signature, &pubkey, &base_script);
                        if op == OP_CHECKSIGVERIFY {
                            if !ok {
                                return Err(ScriptError::Verify);
                            }
                        } else {
                            stack.push(if ok { vec![1] } else { Vec::new() });
                        }
                    }
                    OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                        let n = decode_num(
                            &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                        )?;
                        if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&n) {
                            return Err(ScriptError::BadNumber);
                        }
                        op_count += n as usize;
                        if op_count > MAX_OPS_PER_SCRIPT {
                            return Err(ScriptError::OpCount);
                        }
                        let mut pubkeys = Vec::with_capacity(n as usize);
                        for _ in 0..n {
                            pubkeys
                                .push(stack.pop().ok_or(ScriptError::InvalidStackOperation)?);
                        }
                        let m = decode_num(
                            &stack.pop().ok_or(ScriptError::InvalidStackOperation)?,
                        )?;
                        if !(0..=n).contains(&m) {
                            return Err(ScriptError::BadNumber);
                        }
                        let mut signatures = Vec::with_capacity(m as usize);
                        for _ in 0..m {
                            signatures
                                .push(stack.pop().ok_or(ScriptError::InvalidStackOperation)?);
                        }
                        // Consensus quirk: one extra element is consumed.
                        let dummy = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                        if flags & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
                            return Err(ScriptError::NullDummy);
                        }

                        // Signatures must match pubkeys in order.
                        let mut ok = true;
                        let mut key_iter = pubkeys.iter();
                        'sigs: for signature in &signatures {
                            check_sig_encoding(signature, flags)?;
                            loop {
                                match key_iter.next() {
                                    Some(pubkey) => {
                                        check_pubkey_encoding(pubkey, flags)?;
                                        if checker.check_sig(signature, pubkey, &base_script) {
                                            continue 'sigs;
                                        }
                                    }
                                    None => {
                                        ok = false;
                                        break 'sigs;
                                    }
                                }
                            }
                        }
                        if op == OP_CHECKMULTISIGVERIFY {
                            if !ok {
                                return Err(ScriptError::Verify);
                            }
                        } else {
                            stack.push(if ok { vec![1] } else { Vec::new() });
                        }
                    }
                    other => return Err(ScriptError::BadOpcode(other)),
                }
            }
        }
    }
    if stack.len() > MAX_STACK_SIZE {
        return Err(ScriptError::StackSize);
    }
    Ok(())
}

/// Verify a full spend: scriptSig, then scriptPubKey, then the P2SH redeem
/// path when enabled
pub fn verify_script(
    script_sig: &Script,
    script_pubkey: &Script,
    flags: u32,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    let p2sh = flags & VERIFY_P2SH != 0 && matches!(script_pubkey.form(), ScriptForm::P2SH(_));
    if (flags & VERIFY_SIGPUSHONLY != 0 || p2sh) && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;
    let sig_stack = stack.clone();

    eval_script(&mut stack, script_pubkey, flags, checker)?;
    let top_true = stack.last().map(|top| cast_to_bool(top)).unwrap_or(false);
    if !top_true {
        return Err(ScriptError::EvalFalse);
    }

    if p2sh {
        // Rewind to the scriptSig stack and execute the redeem script.
        stack = sig_stack;
        let redeem_bytes = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        let redeem = Script(redeem_bytes);
        eval_script(&mut stack, &redeem, flags, checker)?;
        let top_true = stack.last().map(|top| cast_to_bool(top)).unwrap_or(false);
        if !top_true {
            return Err(ScriptError::EvalFalse);
        }
    }

    if flags & VERIFY_CLEANSTACK != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumecoin_core::script::push_slice;
    use plumecoin_core::transaction::{OutPoint, TxIn, TxOut, SEQUENCE_FINAL};
    use plumecoin_crypto::sign_digest;
    use secp256k1::Secp256k1;

    struct AcceptingChecker;
    impl SignatureChecker for AcceptingChecker {
        fn check_sig(&self, _s: &[u8], _p: &[u8], _c: &Script) -> bool {
            true
        }
    }

    fn spend_tx() -> Transaction {
        Transaction::new(
            1,
            vec![TxIn::new(
                OutPoint::new([1u8; 32], 0),
                Script::default(),
                SEQUENCE_FINAL,
            )],
            vec![TxOut::new(1, Script::p2pkh(&[2u8; 20]))],
            0,
        )
    }

    #[test]
    fn test_p2pkh_spend_with_real_signature() {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        let pubkey_bytes = public_key.serialize().to_vec();
        let address = pubkey_hash(&pubkey_bytes);
        let script_pubkey = Script::p2pkh(&address);

        let mut tx = spend_tx();
        let cache = SighashCache::new(&tx);
        let digest =
            cache.signature_hash(&tx, 0, &script_pubkey, crate::sighash::SIGHASH_ALL);
        let mut signature = sign_digest(&digest, &secret_key).unwrap();
        signature.push(crate::sighash::SIGHASH_ALL as u8);

        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, &signature);
        push_slice(&mut sig_bytes, &pubkey_bytes);
        tx.inputs[0].script_sig = Script(sig_bytes);

        let cache = SighashCache::new(&tx);
        let checker = TransactionSigChecker {
            tx: &tx,
            input_index: 0,
            cache: &cache,
        };
        verify_script(
            &tx.inputs[0].script_sig,
            &script_pubkey,
            STANDARD_FLAGS,
            &checker,
        )
        .unwrap();

        // A different output script must not verify with the same signature.
        let other = Script::p2pkh(&[0u8; 20]);
        assert!(verify_script(&tx.inputs[0].script_sig, &other, STANDARD_FLAGS, &checker).is_err());
    }

    #[test]
    fn test_wrong_pubkey_fails_hash_check() {
        let address = [5u8; 20];
        let script_pubkey = Script::p2pkh(&address);
        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, &[0u8; 65]);
        push_slice(&mut sig_bytes, &[7u8; 33]); // hashes to something else
        let result = verify_script(
            &Script(sig_bytes),
            &script_pubkey,
            MANDATORY_FLAGS,
            &AcceptingChecker,
        );
        assert_eq!(result, Err(ScriptError::EqualVerify));
    }

    #[test]
    fn test_p2sh_redeem_execution() {
        // Redeem script: OP_1 (always true).
        let redeem = Script(vec![OP_1]);
        let redeem_hash = pubkey_hash(redeem.as_bytes());
        let script_pubkey = Script::p2sh(&redeem_hash);

        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, redeem.as_bytes());
        let script_sig = Script(sig_bytes);

        verify_script(&script_sig, &script_pubkey, VERIFY_P2SH, &AcceptingChecker).unwrap();

        // Without the P2SH flag the hash match alone satisfies the script.
        verify_script(&script_sig, &script_pubkey, VERIFY_NONE, &AcceptingChecker).unwrap();
    }

    #[test]
    fn test_p2sh_rejects_non_push_scriptsig() {
        let redeem = Script(vec![OP_1]);
        let redeem_hash = pubkey_hash(redeem.as_bytes());
        let script_pubkey = Script::p2sh(&redeem_hash);
        let script_sig = Script(vec![OP_DUP]); // not push-only
        assert_eq!(
            verify_script(&script_sig, &script_pubkey, VERIFY_P2SH, &AcceptingChecker),
            Err(ScriptError::SigPushOnly)
        );
    }

    #[test]
    fn test_cleanstack_enforced() {
        // scriptSig leaves an extra element behind.
        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, &[1]);
        push_slice(&mut sig_bytes, &[1]);
        let script_sig = Script(sig_bytes);
        let script_pubkey = Script(vec![OP_NOP]);

        verify_script(&script_sig, &script_pubkey, VERIFY_NONE, &AcceptingChecker).unwrap();
        assert_eq!(
            verify_script(
                &script_sig,
                &script_pubkey,
                VERIFY_CLEANSTACK,
                &AcceptingChecker
            ),
            Err(ScriptError::CleanStack)
        );
    }

    #[test]
    fn test_strictenc_rejects_odd_sig_length() {
        let address = [5u8; 20];
        let script_pubkey = Script::p2pkh(&address);
        let pubkey = [7u8; 33];
        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, &[0u8; 10]); // wrong length
        push_slice(&mut sig_bytes, &pubkey);
        let result = verify_script(
            &Script(sig_bytes),
            &script_pubkey,
            MANDATORY_FLAGS | VERIFY_STRICTENC,
            &AcceptingChecker,
        );
        assert_eq!(result, Err(ScriptError::SigEncoding));
    }

    #[test]
    fn test_token_region_is_not_executed() {
        // P2PKH with a token region; execution must ignore the region.
        let address = [5u8; 20];
        let script_pubkey = Script::p2pkh(&address).with_token_region(b"plmt\x05EMBER\x01\x00");
        let mut sig_bytes = Vec::new();
        push_slice(&mut sig_bytes, &[0u8; 65]);
        // Pubkey whose hash happens to be wrong fails at EQUALVERIFY, which
        // proves the base script executed normally.
        push_slice(&mut sig_bytes, &[9u8; 33]);
        let result = verify_script(
            &Script(sig_bytes),
            &script_pubkey,
            VERIFY_NONE,
            &AcceptingChecker,
        );
        assert_eq!(result, Err(ScriptError::EqualVerify));
    }

    #[test]
    fn test_multisig_two_of_three() {
        let secp = Secp256k1::new();
        let tx = spend_tx();
        let cache = SighashCache::new(&tx);

        let keys: Vec<_> = (0..3)
            .map(|_| secp.generate_keypair(&mut rand::thread_rng()))
            .collect();

        // Redeem script: 2 <pk1> <pk2> <pk3> 3 CHECKMULTISIG
        let mut redeem = vec![OP_1 + 1];
        for (_, pk) in &keys {
            push_slice(&mut redeem, &pk.serialize());
        }
        redeem.push(OP_1 + 2);
        redeem.push(OP_CHECKMULTISIG);
        let redeem = Script(redeem);

        let digest = cache.signature_hash(&tx, 0, &redeem, crate::sighash::SIGHASH_ALL);
        let mut sig1 = sign_digest(&digest, &keys[0].0).unwrap();
        sig1.push(crate::sighash::SIGHASH_ALL as u8);
        let mut sig3 = sign_digest(&digest, &keys[2].0).unwrap();
        sig3.push(crate::sighash::SIGHASH_ALL as u8);

        let checker = TransactionSigChecker {
            tx: &tx,
            input_index: 0,
            cache: &cache,
        };

        // Stack: dummy, sig1, sig3 then the redeem script itself.
        let mut stack = vec![Vec::new(), sig1.clone(), sig3.clone()];
        eval_script(&mut stack, &redeem, STANDARD_FLAGS, &checker).unwrap();
        assert!(cast_to_bool(stack.last().unwrap()));

        // Out-of-order signatures fail.
        let mut stack = vec![Vec::new(), sig3, sig1];
        eval_script(&mut stack, &redeem, STANDARD_FLAGS, &checker).unwrap();
        assert!(!cast_to_bool(stack.last().unwrap()));
    }
}
