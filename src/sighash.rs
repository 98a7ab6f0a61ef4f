//! Legacy signature digest and ECDSA checks
//!
//! The digest covers a modified copy of the spending transaction. The
//! sighash type (last byte of every signature) selects which parts are
//! committed to: all outputs, none, or only the one at the same index as
//! the input, and optionally only the signing input itself.

use std::sync::OnceLock;

use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};

use crate::crypto::double_sha256;
use crate::script::{instructions, opcodes::OP_CODESEPARATOR, TxContext};
use crate::serialization::write_transaction;
use crate::types::*;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Digest returned for out-of-range SINGLE / input indices
const ONE: Hash = {
    let mut h = [0u8; 32];
    h[0] = 1;
    h
};

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

fn strip_code_separators(script_code: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script_code.len());
    let mut start = 0;
    for ins in instructions(script_code) {
        match ins {
            Ok(ins) => {
                if ins.opcode != OP_CODESEPARATOR {
                    out.extend_from_slice(&script_code[start..ins.end]);
                }
                start = ins.end;
            }
            Err(_) => break,
        }
    }
    out.extend_from_slice(&script_code[start..]);
    out
}

/// SignatureHash: 𝒯𝒳 × ℕ × 𝕊 × ℕ → ℍ
///
/// 1. Out-of-range input, or SINGLE without a matching output: return 1
/// 2. Blank every input script except the signing one, which gets the
///    script code (with OP_CODESEPARATORs removed)
/// 3. NONE / SINGLE: zero the other inputs' sequence numbers
/// 4. NONE: drop all outputs; SINGLE: keep outputs up to the input index,
///    blanking all but the last
/// 5. ANYONECANPAY: keep only the signing input
/// 6. Hash serialization || hash_type (4 bytes LE) with double SHA256
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash {
    if input_index >= tx.inputs.len() {
        return ONE;
    }
    let base = hash_type & 0x1f;
    if base == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return ONE;
    }
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let code = strip_code_separators(script_code);

    let inputs = tx
        .inputs
        .iter()
        .enumerate()
        .filter(|(i, _)| !anyone_can_pay || *i == input_index)
        .map(|(i, input)| TransactionInput {
            prevout: input.prevout,
            script_sig: if i == input_index { code.clone() } else { Vec::new() },
            sequence: if i != input_index && (base == SIGHASH_NONE || base == SIGHASH_SINGLE) {
                0
            } else {
                input.sequence
            },
        })
        .collect();

    let outputs = match base {
        SIGHASH_NONE => Vec::new(),
        SIGHASH_SINGLE => tx.outputs[..=input_index]
            .iter()
            .enumerate()
            .map(|(i, out)| {
                if i == input_index {
                    out.clone()
                } else {
                    TransactionOutput {
                        value: -1,
                        script_pubkey: Vec::new(),
                    }
                }
            })
            .collect(),
        _ => tx.outputs.clone(),
    };

    let copy = Transaction {
        version: tx.version,
        inputs,
        outputs,
        lock_time: tx.lock_time,
    };
    let mut data = Vec::with_capacity(copy.size() + 4);
    write_transaction(&mut data, &copy);
    data.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&data)
}

/// Verify `sig` (DER || hash type) over the input described by `ctx`.
/// Any parse or verification failure is simply `false`.
pub fn check_signature(ctx: &TxContext<'_>, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
    let Some((&hash_type, der)) = sig.split_last() else {
        return false;
    };
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut signature) = Signature::from_der_lax(der) else {
        return false;
    };
    signature.normalize_s();
    let digest = signature_hash(ctx.tx, ctx.input_index, script_code, hash_type as u32);
    let Ok(message) = Message::from_digest_slice(&digest) else {
        return false;
    };
    secp().verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

/// Produce a DER signature with the hash type appended.
pub fn sign_input(
    secret_key: &SecretKey,
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Vec<u8> {
    let digest = signature_hash(tx, input_index, script_code, hash_type);
    let message = Message::from_digest(digest);
    let signature = secp().sign_ecdsa(&message, secret_key);
    let mut out = signature.serialize_der().to_vec();
    out.push(hash_type as u8);
    out
}

pub fn public_key(secret_key: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp(), secret_key)
}

/// Strict DER encoding check, including the trailing hash type byte.
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    // 0x30 len 0x02 rlen r 0x02 slen s hashtype
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != sig.len() - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

pub fn is_low_s(sig: &[u8]) -> bool {
    let Some((_, der)) = sig.split_last() else {
        return false;
    };
    let Ok(signature) = Signature::from_der_lax(der) else {
        return false;
    };
    let mut normalized = signature;
    normalized.normalize_s();
    normalized == signature
}

pub fn is_defined_hashtype(sig: &[u8]) -> bool {
    match sig.last() {
        Some(&t) => {
            let base = (t as u32) & !SIGHASH_ANYONECANPAY;
            (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
        }
        None => false,
    }
}

pub fn is_valid_pubkey_encoding(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        _ => false,
    }
}
