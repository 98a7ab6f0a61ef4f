//! Script execution engine
//!
//! A stack machine over byte-string elements. Evaluation is pure: the only
//! inputs are the two scripts, the spending transaction context and the
//! verification flags, so any number of inputs can be checked in parallel.
//! Every resource is bounded (script size, op count, element size, stack
//! depth) so hostile scripts terminate quickly.

use bitflags::bitflags;
use thiserror::Error;

use crate::constants::*;
use crate::crypto::{double_sha256, hash160, ripemd160, sha256};
use crate::sighash;
use crate::types::*;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_TRUE: u8 = OP_1;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;
    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SUBSTR: u8 = 0x7f;
    pub const OP_LEFT: u8 = 0x80;
    pub const OP_RIGHT: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;
    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_NOP10: u8 = 0xb9;
}

use opcodes::*;

bitflags! {
    /// Script verification flags
    pub struct ScriptFlags: u32 {
        /// Evaluate pay-to-script-hash redeem scripts
        const P2SH = 1 << 0;
        /// Strict DER signatures, defined sighash types, well-formed pubkeys
        const STRICTENC = 1 << 1;
        /// Strict DER signatures only
        const DERSIG = 1 << 2;
        /// Signatures must use the lower of the two S values
        const LOW_S = 1 << 3;
        /// Exactly one element may remain after evaluation
        const CLEANSTACK = 1 << 4;
        /// The unlocking script may only push data
        const SIGPUSHONLY = 1 << 5;
    }
}

impl ScriptFlags {
    /// Flags every block and mempool transaction is verified with
    pub fn consensus() -> Self {
        ScriptFlags::P2SH
            | ScriptFlags::STRICTENC
            | ScriptFlags::DERSIG
            | ScriptFlags::LOW_S
            | ScriptFlags::CLEANSTACK
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script too large")]
    ScriptTooLarge,
    #[error("operation count exceeded")]
    OpCountExceeded,
    #[error("invalid signature encoding")]
    InvalidSignatureEncoding,
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("disabled opcode")]
    DisabledOpcode,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack size limit exceeded")]
    StackOverflow,
    #[error("push exceeds element size limit")]
    PushSize,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("verify operation failed")]
    Verify,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("script number out of range")]
    InvalidNumber,
    #[error("public key count out of range")]
    PubkeyCount,
    #[error("signature count out of range")]
    SigCount,
    #[error("invalid public key encoding")]
    PubkeyType,
    #[error("non-canonical high S signature")]
    HighS,
    #[error("unclean stack after evaluation")]
    CleanStack,
    #[error("unlocking script is not push-only")]
    SigPushOnly,
}

/// The spending side of a signature check: which input of which
/// transaction is being verified, and the value of the coin it spends.
#[derive(Debug, Clone, Copy)]
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub amount: Integer,
}

impl<'a> TxContext<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: Integer) -> Self {
        Self {
            tx,
            input_index,
            amount,
        }
    }
}

/// One parsed script element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    /// Pushed bytes; empty for non-push opcodes
    pub data: &'a [u8],
    /// Offset just past this instruction
    pub end: usize,
}

pub struct Instructions<'a> {
    script: &'a [u8],
    pc: usize,
    failed: bool,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions {
        script,
        pc: 0,
        failed: false,
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc >= self.script.len() {
            return None;
        }
        let script = self.script;
        let opcode = script[self.pc];
        let mut pc = self.pc + 1;
        let len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => read_le(script, &mut pc, 1),
            OP_PUSHDATA2 => read_le(script, &mut pc, 2),
            OP_PUSHDATA4 => read_le(script, &mut pc, 4),
            _ => Some(0),
        };
        let len = match len {
            Some(len) if script.len() - pc >= len => len,
            _ => {
                self.failed = true;
                return Some(Err(ScriptError::InvalidOpcode));
            }
        };
        let data = &script[pc..pc + len];
        self.pc = pc + len;
        Some(Ok(Instruction {
            opcode,
            data,
            end: self.pc,
        }))
    }
}

fn read_le(script: &[u8], pc: &mut usize, width: usize) -> Option<usize> {
    if script.len() - *pc < width {
        return None;
    }
    let mut value = 0usize;
    for (i, b) in script[*pc..*pc + width].iter().enumerate() {
        value |= (*b as usize) << (8 * i);
    }
    *pc += width;
    Some(value)
}

/// Script number decoding, little-endian sign-magnitude
pub fn decode_num(bytes: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if bytes.len() > max_len {
        return Err(ScriptError::InvalidNumber);
    }
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    let mut result: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        result |= (*b as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        return Ok(-(result & mask));
    }
    Ok(result)
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

/// Any non-zero byte is true, except negative zero
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, b) in bytes.iter().enumerate() {
        if *b != 0 {
            return !(i == bytes.len() - 1 && *b == 0x80);
        }
    }
    false
}

/// Append a data push using the smallest push opcode
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        n if n < OP_PUSHDATA1 as usize => script.push(n as u8),
        n if n <= 0xff => {
            script.push(OP_PUSHDATA1);
            script.push(n as u8);
        }
        n if n <= 0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(n as u16).to_le_bytes());
        }
        n => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(n as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Append an integer using OP_0 / OP_1NEGATE / OP_1..OP_16 where possible
pub fn push_int(script: &mut Vec<u8>, value: i64) {
    match value {
        0 => script.push(OP_0),
        -1 => script.push(OP_1NEGATE),
        1..=16 => script.push(OP_1 + (value as u8) - 1),
        _ => push_data(script, &encode_num(value)),
    }
}

/// The prefix a coinbase script must start with at `height`
pub fn height_push(height: Natural) -> Vec<u8> {
    let mut script = Vec::new();
    push_int(&mut script, height as i64);
    script
}

/// OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160];
    push_data(&mut script, pubkey_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// OP_HASH160 <hash> OP_EQUAL
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_HASH160];
    push_data(&mut script, script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|ins| matches!(ins, Ok(ins) if ins.opcode <= OP_16))
}

/// Legacy signature-operation count: every CHECKMULTISIG counts as the
/// maximum number of keys.
pub fn count_legacy_sigops(script: &[u8]) -> usize {
    let mut count = 0;
    for ins in instructions(script) {
        match ins {
            Ok(ins) => match ins.opcode {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += MAX_PUBKEYS_PER_MULTISIG,
                _ => {}
            },
            Err(_) => break,
        }
    }
    count
}

/// Remove every push of `data` that starts on an instruction boundary.
pub fn find_and_delete(script: &[u8], data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return script.to_vec();
    }
    let mut pattern = Vec::with_capacity(data.len() + 5);
    push_data(&mut pattern, data);

    let mut result = Vec::with_capacity(script.len());
    let mut pc = 0;
    let mut copied_to = 0;
    loop {
        result.extend_from_slice(&script[copied_to..pc]);
        while script.len() - pc >= pattern.len() && script[pc..].starts_with(&pattern) {
            pc += pattern.len();
        }
        copied_to = pc;
        let mut iter = Instructions {
            script,
            pc,
            failed: false,
        };
        match iter.next() {
            Some(Ok(ins)) => pc = ins.end,
            _ => break,
        }
    }
    result.extend_from_slice(&script[copied_to..]);
    result
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

type Stack = Vec<Vec<u8>>;

fn pop(stack: &mut Stack) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

/// Element `depth` positions from the top (1 = top)
fn top(stack: &Stack, depth: usize) -> Result<&Vec<u8>, ScriptError> {
    if depth == 0 || stack.len() < depth {
        return Err(ScriptError::StackUnderflow);
    }
    Ok(&stack[stack.len() - depth])
}

fn require(stack: &Stack, n: usize) -> Result<(), ScriptError> {
    if stack.len() < n {
        return Err(ScriptError::StackUnderflow);
    }
    Ok(())
}

fn pop_num(stack: &mut Stack) -> Result<i64, ScriptError> {
    let bytes = pop(stack)?;
    decode_num(&bytes, MAX_SCRIPT_NUM_SIZE)
}

fn push_bool(stack: &mut Stack, value: bool) {
    stack.push(if value { vec![1] } else { Vec::new() });
}

fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is a valid way to make CHECKSIG fail.
    if sig.is_empty() {
        return Ok(());
    }
    if flags.intersects(ScriptFlags::DERSIG | ScriptFlags::LOW_S | ScriptFlags::STRICTENC)
        && !sighash::is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::InvalidSignatureEncoding);
    }
    if flags.contains(ScriptFlags::LOW_S) && !sighash::is_low_s(sig) {
        return Err(ScriptError::HighS);
    }
    if flags.contains(ScriptFlags::STRICTENC) && !sighash::is_defined_hashtype(sig) {
        return Err(ScriptError::InvalidSignatureEncoding);
    }
    Ok(())
}

fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if flags.contains(ScriptFlags::STRICTENC) && !sighash::is_valid_pubkey_encoding(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

/// EvalScript: 𝒮𝒞 × 𝒮𝒯 × 𝒳 × ℱ → 𝒮𝒯 | error
///
/// 1. Reject scripts over 10,000 bytes
/// 2. For each instruction:
///    - pushes over 520 bytes fail, even in unexecuted branches
///    - every opcode above OP_16 counts toward the 201 op limit
///    - disabled opcodes fail, even in unexecuted branches
///    - execute when every enclosing conditional is true
///    - main plus alt stack may never exceed 1000 elements
/// 3. Every IF must be closed by the end of the script
pub fn eval_script(
    stack: &mut Stack,
    script: &[u8],
    flags: ScriptFlags,
    ctx: &TxContext<'_>,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptTooLarge);
    }

    let mut alt: Stack = Vec::new();
    let mut exec: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;

    for ins in instructions(script) {
        let ins = ins?;
        let opcode = ins.opcode;
        let executing = exec.iter().all(|b| *b);

        if ins.data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCountExceeded);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && opcode <= OP_PUSHDATA4 {
            stack.push(ins.data.to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = if opcode == OP_1NEGATE {
                        -1
                    } else {
                        (opcode - OP_1 + 1) as i64
                    };
                    stack.push(encode_num(n));
                }

                OP_NOP | OP_NOP1..=OP_NOP10 => {}

                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let cond = pop(stack)?;
                        value = cast_to_bool(&cond);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec.push(value);
                }
                OP_ELSE => {
                    let last = exec.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(&pop(stack)?) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => alt.push(pop(stack)?),
                OP_FROMALTSTACK => stack.push(pop(&mut alt)?),
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let at = stack.len() - 6;
                    let pair: Vec<_> = stack.drain(at..at + 2).collect();
                    stack.extend(pair);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let n = stack.len();
                    stack.swap(n - 4, n - 2);
                    stack.swap(n - 3, n - 1);
                }
                OP_IFDUP => {
                    let v = top(stack, 1)?.clone();
                    if cast_to_bool(&v) {
                        stack.push(v);
                    }
                }
                OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let v = top(stack, 1)?.clone();
                    stack.push(v);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    let at = stack.len() - 2;
                    stack.remove(at);
                }
                OP_OVER => {
                    let v = top(stack, 2)?.clone();
                    stack.push(v);
                }
                OP_PICK | OP_ROLL => {
                    let n = pop_num(stack)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::StackUnderflow);
                    }
                    let at = stack.len() - 1 - n as usize;
                    let v = if opcode == OP_ROLL {
                        stack.remove(at)
                    } else {
                        stack[at].clone()
                    };
                    stack.push(v);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let at = stack.len() - 3;
                    let v = stack.remove(at);
                    stack.push(v);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let n = stack.len();
                    stack.swap(n - 2, n - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let v = top(stack, 1)?.clone();
                    let at = stack.len() - 2;
                    stack.insert(at, v);
                }
                OP_SIZE => {
                    let len = top(stack, 1)?.len();
                    stack.push(encode_num(len as i64));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        push_bool(stack, equal);
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = pop_num(stack)?;
                    let r = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(encode_num(r));
                }

                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    let b = pop_num(stack)?;
                    let a = pop_num(stack)?;
                    let r = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if r == 0 {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(encode_num(r));
                    }
                }
                OP_WITHIN => {
                    let max = pop_num(stack)?;
                    let min = pop_num(stack)?;
                    let x = pop_num(stack)?;
                    push_bool(stack, min <= x && x < max);
                }

                OP_RIPEMD160 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let v = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => ripemd160(&v).to_vec(),
                        OP_SHA256 => sha256(&v).to_vec(),
                        OP_HASH160 => hash160(&v).to_vec(),
                        _ => double_sha256(&v).to_vec(),
                    };
                    stack.push(digest);
                }

                OP_CODESEPARATOR => code_start = ins.end,

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    let script_code = find_and_delete(&script[code_start..], &sig);

                    check_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let ok = sighash::check_signature(ctx, &sig, &pubkey, &script_code);

                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        push_bool(stack, ok);
                    }
                }

                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = check_multisig(
                        stack,
                        &script[code_start..],
                        flags,
                        ctx,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        push_bool(stack, ok);
                    }
                }

                // OP_SHA1 is not supported by this protocol
                _ => return Err(ScriptError::InvalidOpcode),
            }
        }

        if stack.len() + alt.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackOverflow);
        }
    }

    if !exec.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Stack layout (top first): n, pubkey*n, m, sig*m, dummy
fn check_multisig(
    stack: &mut Stack,
    script_code: &[u8],
    flags: ScriptFlags,
    ctx: &TxContext<'_>,
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let mut i = 1;
    let mut keys = decode_num(top(stack, i)?, MAX_SCRIPT_NUM_SIZE)?;
    if keys < 0 || keys as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    *op_count += keys as usize;
    if *op_count > MAX_SCRIPT_OPS {
        return Err(ScriptError::OpCountExceeded);
    }
    i += 1;
    let mut ikey = i;
    i += keys as usize;

    let mut sigs = decode_num(top(stack, i)?, MAX_SCRIPT_NUM_SIZE)?;
    if sigs < 0 || sigs > keys {
        return Err(ScriptError::SigCount);
    }
    i += 1;
    let mut isig = i;
    i += sigs as usize;
    require(stack, i)?;

    let mut code = script_code.to_vec();
    for k in 0..sigs as usize {
        let sig = top(stack, isig + k)?.clone();
        code = find_and_delete(&code, &sig);
    }

    let mut success = true;
    while success && sigs > 0 {
        let sig = top(stack, isig)?;
        let pubkey = top(stack, ikey)?;
        check_signature_encoding(sig, flags)?;
        check_pubkey_encoding(pubkey, flags)?;

        if sighash::check_signature(ctx, sig, pubkey, &code) {
            isig += 1;
            sigs -= 1;
        }
        ikey += 1;
        keys -= 1;
        if sigs > keys {
            success = false;
        }
    }

    // The extra element consumed here is an off-by-one carried by the protocol.
    stack.truncate(stack.len() - i);
    Ok(success)
}

/// VerifyScript: 𝒮𝒞 × 𝒮𝒞 × 𝒳 × ℱ → pass | error
///
/// 1. Evaluate the unlocking script on an empty stack
/// 2. Evaluate the locking script on the resulting stack
/// 3. The top element must be true
/// 4. For P2SH locking scripts, pop the redeem script pushed by the
///    unlocking script and evaluate it on the remaining stack
/// 5. Under CLEANSTACK exactly one element may remain
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    ctx: &TxContext<'_>,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if flags.contains(ScriptFlags::SIGPUSHONLY) && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, ctx)?;
    let stack_after_sig = if flags.contains(ScriptFlags::P2SH) {
        stack.clone()
    } else {
        Vec::new()
    };

    eval_script(&mut stack, script_pubkey, flags, ctx)?;
    match stack.last() {
        Some(v) if cast_to_bool(v) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags.contains(ScriptFlags::P2SH) && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_after_sig;
        let redeem_script = pop(&mut stack)?;
        eval_script(&mut stack, &redeem_script, flags, ctx)?;
        match stack.last() {
            Some(v) if cast_to_bool(v) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if flags.contains(ScriptFlags::CLEANSTACK) && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}
