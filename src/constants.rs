//! Protocol constants shared by every network
//!
//! Per-network values (genesis, retarget schedule, maturity, block limits,
//! subsidy) live in [`crate::params::ConsensusParams`].

/// Maximum money supply: 21,000,000 coins in base units
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Base units per coin
pub const COIN: i64 = 100_000_000;

/// Maximum transaction size: 1MB
pub const MAX_TX_SIZE: usize = 1_000_000;

/// Minimum coinbase script length
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;

/// Maximum coinbase script length
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum combined size of main and alt stacks during script execution
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of non-push operations in a script
pub const MAX_SCRIPT_OPS: usize = 201;

/// Maximum number of public keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Byte length of a script number operand
pub const MAX_SCRIPT_NUM_SIZE: usize = 4;

/// Weight units per serialized byte (no witness data in this protocol)
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Lock time threshold: lock times below this are block heights
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for a final input
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Highest sequence number that still signals replaceability
pub const SEQUENCE_RBF: u32 = 0xffff_fffd;

/// Serialized header length
pub const HEADER_SIZE: usize = 80;
