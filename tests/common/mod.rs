//! Shared helpers for integration tests: regtest chains, keys and spends

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use consensus_engine::chainstate::{AcceptResult, ChainState, Clock, FixedClock};
use consensus_engine::crypto::hash160;
use consensus_engine::error::Result;
use consensus_engine::mining::{build_block, create_coinbase, regtest_genesis};
use consensus_engine::params::{ConsensusParams, EngineConfig};
use consensus_engine::script::opcodes::OP_TRUE;
use consensus_engine::script::{p2pkh_script, push_data};
use consensus_engine::serialization::serialize_block;
use consensus_engine::sighash::{public_key, sign_input, SIGHASH_ALL};
use consensus_engine::storage::{BlockStore, MemoryBlockStore};
use consensus_engine::utxo::BlockUndo;
use consensus_engine::*;
use secp256k1::SecretKey;

/// Wall clock used by test chains; comfortably after every test block
pub const NOW: u64 = 1_700_000_000;

pub fn regtest() -> (ConsensusParams, Block) {
    let params = ConsensusParams::regtest();
    let genesis = regtest_genesis(&params);
    (params.with_genesis_hash(&genesis.hash()), genesis)
}

pub fn new_chain() -> TestChain<MemoryBlockStore> {
    TestChain::with_store(EngineConfig::default(), MemoryBlockStore::new())
}

pub struct TestChain<S: BlockStore> {
    pub chain: ChainState<S>,
    pub params: ConsensusParams,
    pub genesis: Block,
    pub clock: Arc<FixedClock>,
}

impl<S: BlockStore> TestChain<S> {
    pub fn with_store(config: EngineConfig, store: S) -> Self {
        let (params, genesis) = regtest();
        let clock = Arc::new(FixedClock::new(NOW));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let chain = ChainState::with_clock(
            params.clone(),
            config,
            Arc::new(store),
            genesis.clone(),
            dyn_clock,
        )
        .unwrap();
        Self {
            chain,
            params,
            genesis,
            clock,
        }
    }

    /// Mined block on `parent` paying the full subsidy to OP_TRUE; `tag`
    /// keeps sibling blocks distinct
    pub fn block_on(&self, parent: &Block, height: Natural, tag: u64, txs: Vec<Transaction>) -> Block {
        let value = consensus_engine::economic::get_block_subsidy(height, &self.params);
        self.block_paying(parent, height, tag, value, txs)
    }

    pub fn block_paying(
        &self,
        parent: &Block,
        height: Natural,
        tag: u64,
        value: Integer,
        txs: Vec<Transaction>,
    ) -> Block {
        let mut transactions = vec![create_coinbase(height, value, vec![OP_TRUE], tag)];
        transactions.extend(txs);
        build_block(&parent.header, transactions, &self.params).unwrap()
    }

    pub fn submit(&self, block: &Block) -> Result<AcceptResult> {
        self.chain.submit_block(&serialize_block(block))
    }

    /// Build and submit `count` empty blocks on `parent`, which must be at
    /// `parent_height`; returns them lowest first
    pub fn extend(&self, parent: &Block, parent_height: Natural, count: usize, tag: u64) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(count);
        let mut tip = parent.clone();
        for i in 0..count as u64 {
            let block = self.block_on(&tip, parent_height + 1 + i, tag, vec![]);
            self.submit(&block).unwrap();
            tip = block.clone();
            blocks.push(block);
        }
        blocks
    }
}

/// Coinbase outpoint of `block`
pub fn coinbase_out(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Spend of OP_TRUE outputs into a single OP_TRUE output
pub fn spend(prevouts: &[OutPoint], value: Integer, sequence: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: prevouts
            .iter()
            .map(|prevout| TransactionInput {
                prevout: *prevout,
                script_sig: vec![],
                sequence,
            })
            .collect(),
        outputs: vec![TransactionOutput {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

pub fn secret_key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).unwrap()
}

pub fn pubkey_bytes(key: &SecretKey) -> Vec<u8> {
    public_key(key).serialize().to_vec()
}

pub fn p2pkh_for(key: &SecretKey) -> Vec<u8> {
    p2pkh_script(&hash160(&pubkey_bytes(key)))
}

/// Fill in P2PKH script sigs for every input, all owned by `key`
pub fn sign_p2pkh(tx: &mut Transaction, key: &SecretKey) {
    let script_code = p2pkh_for(key);
    for i in 0..tx.inputs.len() {
        let sig = sign_input(key, tx, i, &script_code, SIGHASH_ALL);
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &pubkey_bytes(key));
        tx.inputs[i].script_sig = script_sig;
    }
}

/// Store that can be told to lose undo records, to exercise halting
#[derive(Debug, Default)]
pub struct LossyStore {
    inner: MemoryBlockStore,
    pub lose_undo: AtomicBool,
}

impl LossyStore {
    pub fn lose_undo(&self) {
        self.lose_undo.store(true, Ordering::SeqCst);
    }
}

impl BlockStore for LossyStore {
    fn read_block(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.inner.read_block(hash)
    }

    fn write_block(&self, hash: &Hash, bytes: &[u8]) -> Result<()> {
        self.inner.write_block(hash, bytes)
    }

    fn read_undo(&self, hash: &Hash) -> Result<Option<BlockUndo>> {
        if self.lose_undo.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.read_undo(hash)
    }

    fn write_undo(&self, hash: &Hash, undo: &BlockUndo) -> Result<()> {
        self.inner.write_undo(hash, undo)
    }
}
