//! Core value types for chain-state validation

use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash, stored in internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type (heights, counts)
pub type Natural = u64;

/// Integer type (amounts in the smallest unit)
pub type Integer = i64;

/// The all-zero hash
pub const NULL_HASH: Hash = [0u8; 32];

/// Output index used by the coinbase input's null prevout
pub const NULL_INDEX: u32 = 0xffff_ffff;

/// OutPoint: 𝒪 = ℍ × ℕ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The prevout carried by a coinbase input
    pub fn null() -> Self {
        Self {
            hash: NULL_HASH,
            index: NULL_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH && self.index == NULL_INDEX
    }
}

/// Transaction Input: ℐ = 𝒪 × 𝕊 × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

/// Transaction Output: 𝒯 = ℤ × 𝕊
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Integer,
    pub script_pubkey: ByteString,
}

/// Transaction: 𝒯𝒳 = ℕ × ℐ* × 𝒯* × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Transaction id: double-SHA256 of the canonical encoding
    pub fn txid(&self) -> Hash {
        crate::serialization::calculate_tx_id(self)
    }

    /// Canonical serialized size in bytes
    pub fn size(&self) -> usize {
        crate::serialization::transaction_size(self)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<Integer> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, o| acc.checked_add(o.value))
    }
}

/// Block Header: ℋ = ℤ × ℍ × ℍ × ℕ × ℕ × ℕ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block hash: double-SHA256 of the 80-byte header encoding
    pub fn hash(&self) -> Hash {
        crate::serialization::calculate_block_hash(self)
    }
}

/// Block: ℬ = ℋ × 𝒯𝒳*
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn size(&self) -> usize {
        crate::serialization::block_size(self)
    }
}

/// UTXO record: 𝒰 = 𝒯 × ℕ × 𝔹
///
/// The output itself plus the height it was created at and whether it
/// came from a coinbase (coinbase outputs are subject to maturity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TransactionOutput,
    pub height: Natural,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TransactionOutput, height: Natural, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    pub fn value(&self) -> Integer {
        self.output.value
    }

    /// Whether this coin may be spent in a block at `spend_height`
    pub fn is_mature(&self, spend_height: Natural, maturity: Natural) -> bool {
        !self.is_coinbase || spend_height.saturating_sub(self.height) >= maturity
    }
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Render a hash the way block explorers do (reversed byte order)
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a hash from its display (reversed) hex form
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash.reverse();
    Some(hash)
}
