//! # Consensus-Engine
//!
//! Chain-state and validation engine for a Bitcoin-protocol proof-of-work
//! ledger: structural and contextual validation of blocks and
//! transactions, the block-index tree with cumulative-work fork choice,
//! UTXO maintenance with exact rollback, and the mempool admission policy.
//!
//! ## Architecture
//!
//! - Stateless rules (`transaction`, `script`, `block::check_block`, `pow`)
//!   are pure functions of their inputs and the network's `ConsensusParams`
//! - `utxo`, `mempool` and `block_index` are single-threaded data structures
//! - `chainstate::ChainState` owns them behind one state lock and is the
//!   only place state transitions happen
//! - Block storage, relay and transport are collaborators reached through
//!   `storage::BlockStore`, `events::EventBus` and `network`
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use consensus_engine::chainstate::{AcceptResult, ChainState};
//! use consensus_engine::mining::{build_block, create_coinbase, regtest_genesis};
//! use consensus_engine::params::{ConsensusParams, EngineConfig};
//! use consensus_engine::serialization::serialize_block;
//! use consensus_engine::storage::MemoryBlockStore;
//!
//! let params = ConsensusParams::regtest();
//! let genesis = regtest_genesis(&params);
//! let params = params.with_genesis_hash(&genesis.hash());
//! let chain = ChainState::new(
//!     params.clone(),
//!     EngineConfig::default(),
//!     Arc::new(MemoryBlockStore::new()),
//!     genesis.clone(),
//! )
//! .unwrap();
//!
//! let coinbase = create_coinbase(1, params.initial_subsidy, vec![0x51], 0);
//! let block = build_block(&genesis.header, vec![coinbase], &params).unwrap();
//! let result = chain.submit_block(&serialize_block(&block)).unwrap();
//! assert!(matches!(result, AcceptResult::Connected { height: 1, .. }));
//! ```

pub mod types;
pub mod constants;
pub mod params;
pub mod error;
pub mod serialization;
pub mod crypto;
pub mod script;
pub mod sighash;
pub mod transaction;
pub mod pow;
pub mod economic;
pub mod utxo;
pub mod mempool;
pub mod block_index;
pub mod block;
pub mod reorganization;
pub mod storage;
pub mod events;
pub mod chainstate;
pub mod network;
pub mod mining;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ConsensusError, Result};
pub use params::{ConsensusParams, EngineConfig, MempoolConfig, Network};
pub use chainstate::{AcceptResult, ChainState, ChainTip};

use script::{ScriptFlags, TxContext};

/// Stateless consensus checks bound to one network's parameters
///
/// # Examples
///
/// ```
/// use consensus_engine::{Consensus, ConsensusParams};
///
/// let consensus = Consensus::new(ConsensusParams::regtest());
/// // OP_1 OP_1 OP_EQUAL
/// assert!(consensus.verify_script(&[0x51], &[0x51, 0x87]).is_ok());
/// assert_eq!(consensus.get_block_subsidy(0), 50 * consensus_engine::COIN);
/// ```
#[derive(Debug, Clone)]
pub struct Consensus {
    params: ConsensusParams,
}

impl Consensus {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Context-free transaction checks
    pub fn validate_transaction(&self, tx: &Transaction) -> ValidationResult {
        transaction::check_transaction(tx)
    }

    /// Context-free block checks, including proof of work
    pub fn validate_block(&self, block: &Block) -> Result<()> {
        block::check_block(block, &self.params)
    }

    /// Run a script pair outside any transaction, under consensus flags
    /// minus the clean-stack rule
    pub fn verify_script(&self, script_sig: &[u8], script_pubkey: &[u8]) -> Result<()> {
        let tx = Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: script_sig.to_vec(),
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![],
            lock_time: 0,
        };
        let ctx = TxContext::new(&tx, 0, 0);
        let flags = ScriptFlags::consensus() - ScriptFlags::CLEANSTACK;
        script::verify_script(script_sig, script_pubkey, &ctx, flags)?;
        Ok(())
    }

    pub fn check_proof_of_work(&self, header: &BlockHeader) -> Result<bool> {
        pow::check_proof_of_work(header, &self.params)
    }

    pub fn get_block_subsidy(&self, height: Natural) -> Integer {
        economic::get_block_subsidy(height, &self.params)
    }
}
