//! The validation engine
//!
//! `ChainState` owns the block index, the UTXO set and the mempool behind
//! one state lock. Writers commit one block (or one mempool change) per
//! write section, so no reader ever sees a half-applied block. Switching
//! the active chain is additionally serialized by an activation token,
//! which lets block verification run under a read lock while the UTXO set
//! is guaranteed not to move underneath it.
//!
//! Lock order is activation, then state, then the tip pointer. Block
//! store calls and event delivery never happen while the state lock is
//! held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use crate::block::{check_block, check_block_inputs, contextual_check_block, BlockContext};
use crate::block_index::{BlockIndex, BlockStatus, HeaderError};
use crate::error::{ConsensusError, Result};
use crate::events::{ChainEvent, EventBus, RemovalReason};
use crate::mempool::{Mempool, MempoolContext, MempoolEntry};
use crate::params::{ConsensusParams, EngineConfig};
use crate::pow::U256;
use crate::reorganization::{plan_activation, should_reorganize, ReorgAbort};
use crate::serialization::{deserialize_block, deserialize_headers, deserialize_transaction};
use crate::storage::BlockStore;
use crate::types::*;
use crate::utxo::UtxoSet;

/// Source of the current time, in seconds since the Unix epoch
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// Settable clock for tests and replays
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot of the active tip, swapped atomically on every tip change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash,
    pub height: Natural,
    pub chain_work: U256,
    pub median_time_past: u32,
    pub timestamp: u32,
    pub bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptResult {
    /// The block is on the active chain
    Connected { hash: Hash, height: Natural },
    /// The block is valid so far but on a branch with less work
    SideBranch { hash: Hash, height: Natural },
    AlreadyKnown { hash: Hash },
    /// Parent unknown; buffered until it arrives
    Orphan { hash: Hash, missing_parent: Hash },
    /// The transaction entered the mempool
    InMempool {
        txid: Hash,
        fee: Integer,
        replaced: Vec<Hash>,
    },
}

#[derive(Debug, Clone)]
struct OrphanBlock {
    block: Block,
    received: u64,
}

/// Blocks whose parent is not known yet, oldest evicted first
#[derive(Debug, Default)]
struct OrphanPool {
    blocks: HashMap<Hash, OrphanBlock>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    order: VecDeque<Hash>,
}

impl OrphanPool {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    fn insert(&mut self, block: Block, now: u64, max: usize) {
        let hash = block.hash();
        if max == 0 || self.blocks.contains_key(&hash) {
            return;
        }
        while self.blocks.len() >= max {
            match self.order.front().copied() {
                Some(oldest) => {
                    debug!(hash = %hash_to_hex(&oldest), "evicting orphan block");
                    self.remove(&oldest);
                }
                None => break,
            }
        }
        self.by_parent
            .entry(block.header.prev_block_hash)
            .or_default()
            .push(hash);
        self.order.push_back(hash);
        self.blocks.insert(hash, OrphanBlock { block, received: now });
    }

    fn remove(&mut self, hash: &Hash) -> Option<Block> {
        let orphan = self.blocks.remove(hash)?;
        let parent = orphan.block.header.prev_block_hash;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        self.order.retain(|h| h != hash);
        Some(orphan.block)
    }

    fn expire(&mut self, now: u64, ttl: u64) {
        while let Some(oldest) = self.order.front().copied() {
            let expired = self
                .blocks
                .get(&oldest)
                .map_or(true, |o| o.received.saturating_add(ttl) < now);
            if !expired {
                break;
            }
            debug!(hash = %hash_to_hex(&oldest), "orphan block expired");
            self.remove(&oldest);
        }
    }

    fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let hashes = self.by_parent.get(parent).cloned().unwrap_or_default();
        hashes.iter().filter_map(|h| self.remove(h)).collect()
    }
}

#[derive(Debug)]
struct Inner {
    index: BlockIndex,
    utxo: UtxoSet,
    mempool: Mempool,
    orphans: OrphanPool,
}

pub struct ChainState<S: BlockStore> {
    params: Arc<ConsensusParams>,
    config: EngineConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    state: RwLock<Inner>,
    activation: Mutex<()>,
    tip: RwLock<Arc<ChainTip>>,
    halted: Mutex<Option<String>>,
    last_abort: Mutex<Option<ReorgAbort>>,
    events: EventBus,
    script_pool: Option<ThreadPool>,
}

impl<S: BlockStore> fmt::Debug for ChainState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainState")
            .field("tip", &self.tip())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl<S: BlockStore> ChainState<S> {
    pub fn new(
        params: ConsensusParams,
        config: EngineConfig,
        store: Arc<S>,
        genesis: Block,
    ) -> Result<Self> {
        Self::with_clock(params, config, store, genesis, Arc::new(SystemClock))
    }

    /// Start from `genesis`, whose hash must match the configured one.
    /// Genesis outputs are not added to the UTXO set.
    pub fn with_clock(
        params: ConsensusParams,
        config: EngineConfig,
        store: Arc<S>,
        genesis: Block,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        params.validate()?;
        let hash = genesis.hash();
        if params.genesis() != Some(hash) {
            return Err(ConsensusError::Config(format!(
                "genesis block {} does not match configured genesis {}",
                hash_to_hex(&hash),
                params.genesis_hash
            )));
        }
        store.put_block(&genesis)?;

        let script_pool = if config.script_threads > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.script_threads)
                    .build()
                    .map_err(|e| ConsensusError::Config(e.to_string()))?,
            )
        } else {
            None
        };

        let index = BlockIndex::new(genesis.header);
        let tip = Arc::new(Self::snapshot_tip(&index, &params));
        info!(genesis = %hash_to_hex(&hash), network = ?params.network, "chain state initialized");

        Ok(Self {
            state: RwLock::new(Inner {
                index,
                utxo: UtxoSet::new(),
                mempool: Mempool::new(config.mempool.clone()),
                orphans: OrphanPool::default(),
            }),
            params: Arc::new(params),
            config,
            store,
            clock,
            activation: Mutex::new(()),
            tip: RwLock::new(tip),
            halted: Mutex::new(None),
            last_abort: Mutex::new(None),
            events: EventBus::new(),
            script_pool,
        })
    }

    // ============================================================================
    // Query surface
    // ============================================================================

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Current tip; never waits on block validation
    pub fn tip(&self) -> Arc<ChainTip> {
        Arc::clone(&self.tip.read())
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.state.read().utxo.get(outpoint).cloned()
    }

    pub fn utxo_commitment(&self) -> Hash {
        self.state.read().utxo.commitment()
    }

    /// Copy of the whole UTXO set at the current tip
    pub fn utxo_snapshot(&self) -> UtxoSet {
        self.state.read().utxo.clone()
    }

    pub fn mempool_snapshot(&self) -> Vec<MempoolEntry> {
        self.state.read().mempool.snapshot()
    }

    pub fn mempool_contains(&self, txid: &Hash) -> bool {
        self.state.read().mempool.contains(txid)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        self.store.get_block(hash)
    }

    pub fn block_by_height(&self, height: Natural) -> Result<Option<Block>> {
        let hash = {
            let state = self.state.read();
            state
                .index
                .active_at(height)
                .map(|idx| state.index.entry(idx).hash)
        };
        match hash {
            Some(hash) => self.store.get_block(&hash),
            None => Ok(None),
        }
    }

    pub fn header_status(&self, hash: &Hash) -> Option<BlockStatus> {
        self.state.read().index.entry_by_hash(hash).map(|e| e.status)
    }

    pub fn is_on_active_chain(&self, hash: &Hash) -> bool {
        let state = self.state.read();
        state
            .index
            .find(hash)
            .map_or(false, |idx| state.index.is_active(idx))
    }

    pub fn locator(&self) -> Vec<Hash> {
        self.state.read().index.locator()
    }

    pub fn orphan_count(&self) -> usize {
        self.state.read().orphans.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    pub fn last_reorg_abort(&self) -> Option<ReorgAbort> {
        self.last_abort.lock().clone()
    }

    /// Context a block building on the current tip must satisfy
    pub fn next_block_context(&self) -> BlockContext {
        let state = self.state.read();
        let tip = state.index.tip();
        BlockContext {
            height: state.index.entry(tip).height + 1,
            median_time_past: state.index.median_time_past(tip, &self.params),
            expected_bits: state.index.required_bits(tip, &self.params),
        }
    }

    fn snapshot_tip(index: &BlockIndex, params: &ConsensusParams) -> ChainTip {
        let entry = index.tip_entry();
        ChainTip {
            hash: entry.hash,
            height: entry.height,
            chain_work: entry.chain_work,
            median_time_past: index.median_time_past(index.tip(), params),
            timestamp: entry.header.timestamp,
            bits: entry.header.bits,
        }
    }

    fn publish_tip(&self, index: &BlockIndex) {
        *self.tip.write() = Arc::new(Self::snapshot_tip(index, &self.params));
    }

    fn mempool_context(&self, index: &BlockIndex) -> MempoolContext<'_> {
        MempoolContext {
            params: &self.params,
            tip_height: index.active_height(),
            median_time_past: index.median_time_past(index.tip(), &self.params) as u64,
        }
    }

    // ============================================================================
    // Halting
    // ============================================================================

    fn ensure_running(&self) -> Result<()> {
        match self.halted.lock().as_ref() {
            Some(reason) => Err(ConsensusError::InternalInvariantViolation(format!(
                "chain state halted: {}",
                reason
            ))),
            None => Ok(()),
        }
    }

    fn halt(&self, reason: impl Into<String>) -> ConsensusError {
        let reason = reason.into();
        error!(%reason, "internal invariant violated, halting chain state");
        let mut halted = self.halted.lock();
        if halted.is_none() {
            *halted = Some(reason.clone());
        }
        ConsensusError::InternalInvariantViolation(reason)
    }

    // ============================================================================
    // Ingestion
    // ============================================================================

    /// SubmitBlock: bytes → AcceptResult | error
    pub fn submit_block(&self, bytes: &[u8]) -> Result<AcceptResult> {
        self.ensure_running()?;
        let block = deserialize_block(bytes).map_err(|e| {
            warn!(reason = %e, "rejected undecodable block");
            e
        })?;
        self.process_new_block(block)
    }

    /// SubmitTransaction: bytes → AcceptResult | error
    pub fn submit_transaction(&self, bytes: &[u8]) -> Result<AcceptResult> {
        self.ensure_running()?;
        let tx = deserialize_transaction(bytes)?;
        self.accept_transaction(tx)
    }

    /// Encoded `headers` message body: a count followed by 80-byte headers
    pub fn submit_headers(&self, bytes: &[u8]) -> Result<usize> {
        self.ensure_running()?;
        let headers = deserialize_headers(bytes)?;
        self.accept_headers(&headers)
    }

    /// Insert headers without block data; returns how many were new.
    /// Stops at the first header that fails.
    pub fn accept_headers(&self, headers: &[BlockHeader]) -> Result<usize> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut state = self.state.write();
        let mut added = 0;
        for header in headers {
            match state.index.add_header(header, now, &self.params) {
                Ok(_) => added += 1,
                Err(HeaderError::Duplicate) => {}
                Err(e) => {
                    warn!(hash = %hash_to_hex(&header.hash()), reason = %e, "rejected header");
                    return Err(e.into());
                }
            }
        }
        Ok(added)
    }

    /// Validate and store a block, move the tip if it now leads, then
    /// retry any orphans waiting on it
    pub fn process_new_block(&self, block: Block) -> Result<AcceptResult> {
        let hash = block.hash();
        let result = self.process_block(block)?;
        if matches!(
            result,
            AcceptResult::Connected { .. } | AcceptResult::SideBranch { .. }
        ) {
            self.process_orphans(hash);
        }
        Ok(result)
    }

    fn process_orphans(&self, parent: Hash) {
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            let children = self.state.write().orphans.take_children(&parent);
            for child in children {
                let hash = child.hash();
                match self.process_block(child) {
                    Ok(AcceptResult::Connected { .. }) | Ok(AcceptResult::SideBranch { .. }) => {
                        debug!(hash = %hash_to_hex(&hash), "accepted former orphan");
                        queue.push_back(hash);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(hash = %hash_to_hex(&hash), reason = %e, "former orphan rejected")
                    }
                }
            }
        }
    }

    fn process_block(&self, block: Block) -> Result<AcceptResult> {
        self.ensure_running()?;
        let hash = block.hash();
        if let Err(e) = check_block(&block, &self.params) {
            warn!(hash = %hash_to_hex(&hash), reason = %e, "rejected block");
            return Err(e);
        }

        let now = self.clock.now();
        let idx = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.orphans.expire(now, self.config.orphan_expiry_secs);

            if let Some(entry) = state.index.entry_by_hash(&hash) {
                if entry.status.is_invalid() {
                    return Err(ConsensusError::ContextuallyInvalid(format!(
                        "block {} previously marked invalid",
                        hash_to_hex(&hash)
                    )));
                }
                if entry.has_data {
                    return Ok(AcceptResult::AlreadyKnown { hash });
                }
            }

            let missing_parent = block.header.prev_block_hash;
            if state.index.find(&missing_parent).is_none() {
                if !state.orphans.contains(&hash) {
                    debug!(
                        hash = %hash_to_hex(&hash),
                        parent = %hash_to_hex(&missing_parent),
                        "buffering orphan block"
                    );
                    state.orphans.insert(block, now, self.config.max_orphan_blocks);
                }
                return Ok(AcceptResult::Orphan {
                    hash,
                    missing_parent,
                });
            }

            let idx = match state.index.add_header(&block.header, now, &self.params) {
                Ok(idx) => idx,
                Err(HeaderError::Duplicate) => state.index.find(&hash).ok_or_else(|| {
                    ConsensusError::InternalInvariantViolation("duplicate header not indexed".into())
                })?,
                Err(e) => {
                    warn!(hash = %hash_to_hex(&hash), reason = %e, "rejected block header");
                    return Err(e.into());
                }
            };

            let entry = state.index.entry(idx);
            let parent = entry.parent.unwrap_or(0);
            let ctx = BlockContext {
                height: entry.height,
                median_time_past: state.index.median_time_past(parent, &self.params),
                expected_bits: state.index.required_bits(parent, &self.params),
            };
            if let Err(e) = contextual_check_block(&block, &ctx, &self.params) {
                warn!(hash = %hash_to_hex(&hash), height = ctx.height, reason = %e, "rejected block");
                state.index.mark_invalid(idx);
                return Err(e);
            }
            state.index.raise_status(idx, BlockStatus::ValidContext);
            idx
        };

        self.store.put_block(&block)?;
        self.state.write().index.record_block_data(idx);

        let abort = self.activate_best_chain()?;

        let state = self.state.read();
        let entry = state.index.entry(idx);
        if entry.status.is_invalid() {
            let reason = match abort {
                Some(abort) if abort.failed_block == hash => abort.to_string(),
                Some(abort) => format!("descends from invalid block: {}", abort),
                None => "block descends from an invalid block".to_string(),
            };
            return Err(ConsensusError::ContextuallyInvalid(reason));
        }
        Ok(if state.index.is_active(idx) {
            AcceptResult::Connected {
                hash,
                height: entry.height,
            }
        } else {
            AcceptResult::SideBranch {
                hash,
                height: entry.height,
            }
        })
    }

    /// Admit a transaction to the mempool against the current tip
    pub fn accept_transaction(&self, tx: Transaction) -> Result<AcceptResult> {
        self.ensure_running()?;
        let txid = tx.txid();
        let outcome = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let ctx = self.mempool_context(&state.index);
            state.mempool.accept(tx, &state.utxo, &ctx)
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(rejection) => {
                debug!(txid = %hash_to_hex(&txid), reason = %rejection, "rejected transaction");
                return Err(rejection.into());
            }
        };

        let mut events = vec![ChainEvent::TransactionAccepted { txid }];
        events.extend(outcome.replaced.iter().map(|txid| ChainEvent::TransactionRemoved {
            txid: *txid,
            reason: RemovalReason::Replaced,
        }));
        events.extend(outcome.evicted.iter().map(|txid| ChainEvent::TransactionRemoved {
            txid: *txid,
            reason: RemovalReason::Evicted,
        }));
        self.events.publish_all(events);

        Ok(AcceptResult::InMempool {
            txid,
            fee: outcome.fee,
            replaced: outcome.replaced,
        })
    }

    // ============================================================================
    // Activation
    // ============================================================================

    /// ActivateBestChain
    ///
    /// Repeatedly move toward the best candidate: disconnect down to the
    /// fork, then connect forward one block at a time. A block that fails
    /// to connect is marked invalid (poisoning its descendants) and the
    /// best candidate is re-evaluated, which either stops on the valid
    /// prefix of the new branch or returns to the old chain. Returns the
    /// report of the last abort, if any.
    pub fn activate_best_chain(&self) -> Result<Option<ReorgAbort>> {
        let _activation = self.activation.lock();
        self.ensure_running()?;

        let start_tip = self.tip();
        let mut abort: Option<ReorgAbort> = None;
        let mut events = Vec::new();
        let mut disconnected: Vec<Vec<Transaction>> = Vec::new();

        'planning: loop {
            let plan = {
                let state = self.state.read();
                match state.index.best_candidate() {
                    Some(best) if should_reorganize(&state.index, best) => {
                        plan_activation(&state.index, best)
                    }
                    _ => break,
                }
            };
            if plan.is_reorg() {
                info!(
                    depth = plan.depth(),
                    connect = plan.connect.len(),
                    "reorganizing active chain"
                );
            }

            for &idx in &plan.disconnect {
                disconnected.push(self.disconnect_tip(idx, &mut events)?);
            }
            for &idx in &plan.connect {
                if let Some(failure) = self.connect_tip(idx, &mut events)? {
                    abort = Some(failure);
                    continue 'planning;
                }
            }
        }

        if !disconnected.is_empty() {
            self.resurrect_transactions(disconnected, &mut events);
        }

        let end_tip = self.tip();
        if end_tip.hash != start_tip.hash {
            info!(
                hash = %hash_to_hex(&end_tip.hash),
                height = end_tip.height,
                work = %end_tip.chain_work,
                "new chain tip"
            );
            events.push(ChainEvent::NewTip {
                hash: end_tip.hash,
                height: end_tip.height,
            });
        }
        if let Some(abort) = abort.as_mut() {
            abort.stable_tip = end_tip.hash;
            abort.stable_height = end_tip.height;
            warn!("{}", abort);
            *self.last_abort.lock() = Some(abort.clone());
        }
        self.events.publish_all(events);
        Ok(abort)
    }

    fn load_block(&self, hash: &Hash) -> Result<Block> {
        match self.store.get_block(hash) {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(self.halt(format!("block data missing for {}", hash_to_hex(hash)))),
            Err(e) => Err(self.halt(format!(
                "reading block {} failed: {}",
                hash_to_hex(hash),
                e
            ))),
        }
    }

    /// Disconnect the active tip `idx`; returns its non-coinbase
    /// transactions for the mempool
    fn disconnect_tip(&self, idx: usize, events: &mut Vec<ChainEvent>) -> Result<Vec<Transaction>> {
        let (hash, height) = {
            let state = self.state.read();
            let entry = state.index.entry(idx);
            (entry.hash, entry.height)
        };
        let block = self.load_block(&hash)?;
        let undo = match self.store.read_undo(&hash) {
            Ok(Some(undo)) if undo.block_hash == hash => undo,
            Ok(_) => {
                return Err(self.halt(format!("undo record missing for {}", hash_to_hex(&hash))))
            }
            Err(e) => return Err(self.halt(format!("reading undo record failed: {}", e))),
        };

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            if state.index.tip() != idx {
                return Err(self.halt("disconnecting a block that is not the tip"));
            }
            if let Err(e) = state
                .utxo
                .disconnect_block(&undo, self.config.verify_undo_commitments)
            {
                return Err(self.halt(e.reason().to_string()));
            }
            let parent = state.index.entry(idx).parent.unwrap_or(0);
            state.index.set_tip(parent);
            self.publish_tip(&state.index);
        }

        debug!(hash = %hash_to_hex(&hash), height, "disconnected block");
        events.push(ChainEvent::BlockDisconnected { hash, height });
        Ok(block
            .transactions
            .into_iter()
            .filter(|tx| !tx.is_coinbase())
            .collect())
    }

    /// Connect `idx` on top of the active tip. `Ok(Some(_))` means the
    /// block was invalid and has been marked so; state is unchanged.
    fn connect_tip(&self, idx: usize, events: &mut Vec<ChainEvent>) -> Result<Option<ReorgAbort>> {
        let (hash, height) = {
            let state = self.state.read();
            let entry = state.index.entry(idx);
            (entry.hash, entry.height)
        };
        let block = self.load_block(&hash)?;

        let verdict = {
            let state = self.state.read();
            check_block_inputs(
                &block,
                &state.utxo,
                height,
                &self.params,
                self.script_pool.as_ref(),
            )
        };

        let committed = verdict.and_then(|_fees| {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let undo = state.utxo.apply_block(&block, height)?;
            state.index.set_tip(idx);
            state.index.raise_status(idx, BlockStatus::ValidChain);
            let conflicts = state.mempool.remove_for_block(&block);
            self.publish_tip(&state.index);
            Ok((undo, conflicts))
        });

        match committed {
            Ok((undo, conflicts)) => {
                if let Err(e) = self.store.write_undo(&hash, &undo) {
                    return Err(self.halt(format!("writing undo record failed: {}", e)));
                }
                debug!(hash = %hash_to_hex(&hash), height, "connected block");
                events.push(ChainEvent::BlockConnected { hash, height });
                events.extend(conflicts.into_iter().map(|txid| ChainEvent::TransactionRemoved {
                    txid,
                    reason: RemovalReason::Conflict,
                }));
                Ok(None)
            }
            Err(e) if e.is_fatal() => Err(self.halt(e.reason().to_string())),
            Err(e) => {
                warn!(hash = %hash_to_hex(&hash), height, reason = %e, "block failed to connect");
                let mut state = self.state.write();
                state.index.mark_invalid(idx);
                let tip = state.index.tip_entry();
                Ok(Some(ReorgAbort {
                    failed_block: hash,
                    failed_height: height,
                    reason: e.reason().to_string(),
                    stable_tip: tip.hash,
                    stable_height: tip.height,
                }))
            }
        }
    }

    /// Re-offer transactions from disconnected blocks (given tip first)
    /// and drop pool entries the new chain no longer supports
    fn resurrect_transactions(&self, disconnected: Vec<Vec<Transaction>>, events: &mut Vec<ChainEvent>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let ctx = self.mempool_context(&state.index);
        for tx in disconnected.into_iter().rev().flatten() {
            let txid = tx.txid();
            match state.mempool.accept(tx, &state.utxo, &ctx) {
                Ok(_) => events.push(ChainEvent::TransactionAccepted { txid }),
                Err(e) => debug!(txid = %hash_to_hex(&txid), reason = %e, "not resurrected"),
            }
        }
        for txid in state.mempool.remove_invalid(&state.utxo, &ctx) {
            events.push(ChainEvent::TransactionRemoved {
                txid,
                reason: RemovalReason::Reorg,
            });
        }
    }
}
