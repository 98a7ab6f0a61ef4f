//! Unconfirmed transaction pool
//!
//! Admission is policy, not consensus: a transaction must pass the stateless
//! checks, be final for the next block, resolve every input against the
//! active UTXO set or another pool entry, pay the minimum relay fee and pass
//! script verification. A spend of an outpoint already claimed by a pool
//! entry is only admitted as a replace-by-fee. The pool is bounded in bytes;
//! overflow evicts the lowest fee-rate entries together with their
//! descendants.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::economic::{higher_fee_rate, min_fee_for_size};
use crate::params::{ConsensusParams, MempoolConfig};
use crate::script::{verify_script, ScriptFlags, TxContext};
use crate::transaction::{check_transaction, check_tx_inputs, is_final, signals_rbf, TxInputError};
use crate::types::*;
use crate::utxo::CoinView;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolRejection {
    #[error("missing input {}:{}", hash_to_hex(&.0.hash), .0.index)]
    MissingInput(OutPoint),
    #[error("transaction already in pool")]
    AlreadyInPool,
    #[error("conflicts without sufficient fee bump: {0}")]
    ConflictsWithoutSufficientFeeBump(String),
    #[error("fee {fee} below minimum relay fee {required}")]
    BelowMinFee { fee: Integer, required: Integer },
    #[error("transaction is not final")]
    NonFinal,
    #[error("mempool full")]
    ExceedsPoolSize,
    #[error("malformed transaction: {0}")]
    Malformed(String),
    #[error("invalid transaction: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash,
    pub fee: Integer,
    pub size: usize,
    /// Admission order
    pub sequence: u64,
    /// In-pool transactions this one spends from
    pub parents: HashSet<Hash>,
    /// In-pool transactions spending from this one
    pub children: HashSet<Hash>,
}

impl MempoolEntry {
    pub fn fee_rate_per_kb(&self) -> Integer {
        crate::economic::fee_rate_per_kb(self.fee, self.size)
    }
}

/// Chain state the pool validates against: the next block is at
/// `tip_height + 1` and must have a time above `median_time_past`.
#[derive(Debug, Clone, Copy)]
pub struct MempoolContext<'a> {
    pub params: &'a ConsensusParams,
    pub tip_height: Natural,
    pub median_time_past: u64,
}

impl MempoolContext<'_> {
    fn next_height(&self) -> Natural {
        self.tip_height + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptOutcome {
    pub txid: Hash,
    pub fee: Integer,
    /// Entries removed because this transaction replaced them
    pub replaced: Vec<Hash>,
    /// Entries evicted to bring the pool under its byte limit
    pub evicted: Vec<Hash>,
}

/// A candidate not yet in the pool, as the eviction planner sees it
struct Incoming<'a> {
    txid: Hash,
    fee: Integer,
    size: usize,
    parents: &'a HashSet<Hash>,
    children: HashSet<Hash>,
}

/// Coins visible to a pool candidate: pool outputs first, then the chain
struct PoolView<'a, V: CoinView + ?Sized> {
    pool: &'a Mempool,
    base: &'a V,
    height: Natural,
    excluded: &'a HashSet<Hash>,
}

impl<V: CoinView + ?Sized> CoinView for PoolView<'_, V> {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(entry) = self.pool.entries.get(&outpoint.hash) {
            if self.excluded.contains(&outpoint.hash) {
                return None;
            }
            return entry
                .tx
                .outputs
                .get(outpoint.index as usize)
                .map(|output| Coin::new(output.clone(), self.height, false));
        }
        self.base.coin(outpoint)
    }
}

#[derive(Debug, Default)]
pub struct Mempool {
    config: MempoolConfig,
    entries: HashMap<Hash, MempoolEntry>,
    /// outpoint -> txid of the pool entry spending it
    spent: HashMap<OutPoint, Hash>,
    total_bytes: usize,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Pool entry currently claiming `outpoint`
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.spent.get(outpoint).copied()
    }

    /// All entries in admission order (parents always precede children)
    pub fn snapshot(&self) -> Vec<MempoolEntry> {
        let mut entries: Vec<MempoolEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Accept: 𝒯𝒳 × 𝒰𝒮 × 𝒞 → accepted | rejected(reason)
    ///
    /// 1. Coinbase transactions are never pooled
    /// 2. Already pooled: AlreadyInPool
    /// 3. Stateless checks: Malformed
    /// 4. Lock time not satisfied at the next height: NonFinal
    /// 5. Conflicts with pooled spends must all signal replaceability
    /// 6. Inputs resolve against chain or pool (excluding what would be
    ///    replaced), coinbase inputs are mature: MissingInput / Invalid
    /// 7. A replacement pays a strictly higher fee-rate than each direct
    ///    conflict and at least their combined fees plus the incremental
    ///    relay fee for its own size
    /// 8. Fee ≥ minimum relay fee: BelowMinFee
    /// 9. Scripts verify under consensus flags
    /// 10. Plan eviction by ascending fee-rate as if the replaced entries
    ///     were gone and the new one pooled; if the new entry would be
    ///     evicted: ExceedsPoolSize, with the pool untouched
    /// 11. Remove replaced entries, insert, carry out the planned eviction
    pub fn accept<V: CoinView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &V,
        ctx: &MempoolContext<'_>,
    ) -> Result<AcceptOutcome, MempoolRejection> {
        if tx.is_coinbase() {
            return Err(MempoolRejection::Invalid("coinbase transaction".into()));
        }
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolRejection::AlreadyInPool);
        }
        if let ValidationResult::Invalid(reason) = check_transaction(&tx) {
            return Err(MempoolRejection::Malformed(reason));
        }
        if !is_final(&tx, ctx.next_height(), ctx.median_time_past) {
            return Err(MempoolRejection::NonFinal);
        }

        let conflicts: HashSet<Hash> = tx
            .inputs
            .iter()
            .filter_map(|input| self.spent.get(&input.prevout).copied())
            .collect();
        if !conflicts.is_empty() {
            if !self.config.enable_rbf {
                return Err(MempoolRejection::ConflictsWithoutSufficientFeeBump(
                    "replacement disabled".into(),
                ));
            }
            for conflict in &conflicts {
                if let Some(entry) = self.entries.get(conflict) {
                    if !signals_rbf(&entry.tx) {
                        return Err(MempoolRejection::ConflictsWithoutSufficientFeeBump(format!(
                            "conflicting transaction {} is not replaceable",
                            hash_to_hex(conflict)
                        )));
                    }
                }
            }
        }
        let replaced = self.with_descendants(&conflicts);

        let view = PoolView {
            pool: self,
            base: chain,
            height: ctx.next_height(),
            excluded: &replaced,
        };
        let (fee, coins) =
            check_tx_inputs(&tx, &view, ctx.next_height(), ctx.params.coinbase_maturity)
                .map_err(|e| match e {
                    TxInputError::Missing(outpoint) => MempoolRejection::MissingInput(outpoint),
                    other => MempoolRejection::Invalid(other.to_string()),
                })?;
        let size = tx.size();

        let parents: HashSet<Hash> = tx
            .inputs
            .iter()
            .map(|input| input.prevout.hash)
            .filter(|hash| self.entries.contains_key(hash))
            .collect();

        if !conflicts.is_empty() {
            self.check_replacement(fee, size, &conflicts, &replaced, &parents)?;
        }

        let required = min_fee_for_size(self.config.min_relay_fee_per_kb, size);
        if fee < required {
            return Err(MempoolRejection::BelowMinFee { fee, required });
        }

        for (index, (input, coin)) in tx.inputs.iter().zip(&coins).enumerate() {
            let script_ctx = TxContext::new(&tx, index, coin.value());
            verify_script(
                &input.script_sig,
                &coin.output.script_pubkey,
                &script_ctx,
                ScriptFlags::consensus(),
            )
            .map_err(|e| {
                MempoolRejection::Invalid(format!("input {} script failed: {}", index, e))
            })?;
        }

        // plan eviction first; a rejection leaves the pool untouched
        let incoming = Incoming {
            txid,
            fee,
            size,
            parents: &parents,
            children: self.pooled_children(&tx, txid, &replaced),
        };
        let eviction = self.eviction_plan(&replaced, Some(&incoming));
        if eviction.contains(&txid) {
            return Err(MempoolRejection::ExceedsPoolSize);
        }

        let mut replaced_txids = Vec::new();
        for conflict in &conflicts {
            replaced_txids.extend(self.remove_with_descendants(conflict).into_iter().map(|e| e.txid));
        }
        if !replaced_txids.is_empty() {
            debug!(
                txid = %hash_to_hex(&txid),
                replaced = replaced_txids.len(),
                "replacing pool transactions"
            );
        }

        self.insert(tx, txid, fee, size, parents);
        let evicted = self.evict(eviction);

        debug!(txid = %hash_to_hex(&txid), fee, size, "accepted transaction to mempool");
        Ok(AcceptOutcome {
            txid,
            fee,
            replaced: replaced_txids,
            evicted,
        })
    }

    fn check_replacement(
        &self,
        fee: Integer,
        size: usize,
        conflicts: &HashSet<Hash>,
        replaced: &HashSet<Hash>,
        parents: &HashSet<Hash>,
    ) -> Result<(), MempoolRejection> {
        if let Some(parent) = parents.iter().find(|p| replaced.contains(*p)) {
            return Err(MempoolRejection::Invalid(format!(
                "spends output of replaced transaction {}",
                hash_to_hex(parent)
            )));
        }
        for conflict in conflicts {
            if let Some(entry) = self.entries.get(conflict) {
                if !higher_fee_rate(fee, size, entry.fee, entry.size) {
                    return Err(MempoolRejection::ConflictsWithoutSufficientFeeBump(format!(
                        "fee-rate not above that of {}",
                        hash_to_hex(conflict)
                    )));
                }
            }
        }
        let replaced_fees: Integer = replaced
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .map(|e| e.fee)
            .sum();
        let bump = min_fee_for_size(self.config.incremental_relay_fee_per_kb, size);
        if fee < replaced_fees.saturating_add(bump) {
            return Err(MempoolRejection::ConflictsWithoutSufficientFeeBump(format!(
                "fee {} below replaced fees {} plus increment {}",
                fee, replaced_fees, bump
            )));
        }
        Ok(())
    }

    fn insert(&mut self, tx: Transaction, txid: Hash, fee: Integer, size: usize, parents: HashSet<Hash>) {
        for parent in &parents {
            if let Some(entry) = self.entries.get_mut(parent) {
                entry.children.insert(txid);
            }
        }
        // re-linking matters when a transaction returns after a reorg
        // while its former children are still pooled
        let mut children = HashSet::new();
        for index in 0..tx.outputs.len() {
            if let Some(child) = self.spent.get(&OutPoint::new(txid, index as u32)) {
                children.insert(*child);
            }
        }
        for child in &children {
            if let Some(entry) = self.entries.get_mut(child) {
                entry.parents.insert(txid);
            }
        }
        for input in &tx.inputs {
            self.spent.insert(input.prevout, txid);
        }
        self.total_bytes += size;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee,
                size,
                sequence,
                parents,
                children,
            },
        );
    }

    /// Remove a single entry, unlinking it from its relatives
    pub fn remove(&mut self, txid: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for input in &entry.tx.inputs {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        for parent in &entry.parents {
            if let Some(p) = self.entries.get_mut(parent) {
                p.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(c) = self.entries.get_mut(child) {
                c.parents.remove(txid);
            }
        }
        Some(entry)
    }

    /// The given txids plus everything that descends from them in the pool
    fn with_descendants(&self, roots: &HashSet<Hash>) -> HashSet<Hash> {
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut queue: VecDeque<Hash> = roots.iter().copied().collect();
        while let Some(txid) = queue.pop_front() {
            if !seen.insert(txid) {
                continue;
            }
            if let Some(entry) = self.entries.get(&txid) {
                queue.extend(entry.children.iter().copied());
            }
        }
        seen
    }

    /// Remove an entry and all of its descendants, children first
    pub fn remove_with_descendants(&mut self, txid: &Hash) -> Vec<MempoolEntry> {
        let mut roots = HashSet::new();
        roots.insert(*txid);
        let mut doomed: Vec<Hash> = self.with_descendants(&roots).into_iter().collect();
        doomed.sort_by_key(|h| std::cmp::Reverse(self.entries.get(h).map(|e| e.sequence)));
        doomed.iter().filter_map(|h| self.remove(h)).collect()
    }

    /// Pool entries already spending outputs of `tx`, which happens when a
    /// transaction returns after a reorg
    fn pooled_children(&self, tx: &Transaction, txid: Hash, excluded: &HashSet<Hash>) -> HashSet<Hash> {
        (0..tx.outputs.len())
            .filter_map(|index| self.spent.get(&OutPoint::new(txid, index as u32)).copied())
            .filter(|child| !excluded.contains(child))
            .collect()
    }

    /// Entries that must leave for the pool to fit its byte limit once
    /// `excluded` is gone and `incoming` is added. Roots are taken by
    /// ascending fee-rate (newest first on ties), each with its
    /// descendants. The pool is not modified.
    fn eviction_plan(&self, excluded: &HashSet<Hash>, incoming: Option<&Incoming<'_>>) -> Vec<Hash> {
        let excluded_bytes: usize = excluded
            .iter()
            .filter_map(|txid| self.entries.get(txid))
            .map(|e| e.size)
            .sum();
        let mut total = self.total_bytes.saturating_sub(excluded_bytes) + incoming.map_or(0, |i| i.size);
        let mut plan = Vec::new();
        if total <= self.config.max_bytes {
            return plan;
        }

        let mut candidates: Vec<(Hash, Integer, usize, u64)> = self
            .entries
            .values()
            .filter(|e| !excluded.contains(&e.txid))
            .map(|e| (e.txid, e.fee, e.size.max(1), e.sequence))
            .chain(incoming.map(|i| (i.txid, i.fee, i.size.max(1), self.next_sequence)))
            .collect();
        candidates.sort_by(|a, b| {
            let left = (a.1 as i128) * (b.2 as i128);
            let right = (b.1 as i128) * (a.2 as i128);
            left.cmp(&right)
                .then_with(|| b.3.cmp(&a.3))
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut gone: HashSet<Hash> = HashSet::new();
        for (root, ..) in candidates {
            if total <= self.config.max_bytes {
                break;
            }
            let mut queue = VecDeque::from([root]);
            while let Some(txid) = queue.pop_front() {
                if excluded.contains(&txid) || gone.contains(&txid) {
                    continue;
                }
                let size = match (incoming, self.entries.get(&txid)) {
                    (Some(i), _) if i.txid == txid => {
                        queue.extend(i.children.iter().copied());
                        i.size
                    }
                    (_, Some(entry)) => {
                        queue.extend(entry.children.iter().copied());
                        if let Some(i) = incoming.filter(|i| i.parents.contains(&txid)) {
                            queue.push_back(i.txid);
                        }
                        entry.size
                    }
                    _ => continue,
                };
                gone.insert(txid);
                total = total.saturating_sub(size);
                plan.push(txid);
            }
        }
        plan
    }

    fn evict(&mut self, plan: Vec<Hash>) -> Vec<Hash> {
        let mut evicted = Vec::new();
        for txid in plan {
            if let Some(entry) = self.remove(&txid) {
                debug!(txid = %hash_to_hex(&entry.txid), fee = entry.fee, "evicted from mempool");
                evicted.push(entry.txid);
            }
        }
        evicted
    }

    /// Reconcile with a newly connected block: included transactions leave
    /// the pool, and anything else spending an input the block consumed is
    /// purged with its descendants. Returns the purged conflicts.
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<Hash> {
        for tx in &block.transactions {
            self.remove(&tx.txid());
        }
        let mut conflicts = Vec::new();
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.inputs {
                if let Some(spender) = self.spent.get(&input.prevout).copied() {
                    for entry in self.remove_with_descendants(&spender) {
                        debug!(
                            txid = %hash_to_hex(&entry.txid),
                            "removed conflicting transaction after block connect"
                        );
                        conflicts.push(entry.txid);
                    }
                }
            }
        }
        conflicts
    }

    /// Drop entries that no longer fit the chain after a reorganization:
    /// inputs that no longer resolve, immature coinbase spends and lock
    /// times no longer satisfied. Returns the removed txids.
    pub fn remove_invalid<V: CoinView + ?Sized>(
        &mut self,
        chain: &V,
        ctx: &MempoolContext<'_>,
    ) -> Vec<Hash> {
        let mut removed = Vec::new();
        let excluded = HashSet::new();
        for entry in self.snapshot() {
            if !self.entries.contains_key(&entry.txid) {
                continue;
            }
            let still_valid = {
                let view = PoolView {
                    pool: self,
                    base: chain,
                    height: ctx.next_height(),
                    excluded: &excluded,
                };
                is_final(&entry.tx, ctx.next_height(), ctx.median_time_past)
                    && check_tx_inputs(
                        &entry.tx,
                        &view,
                        ctx.next_height(),
                        ctx.params.coinbase_maturity,
                    )
                    .is_ok()
            };
            if !still_valid {
                for gone in self.remove_with_descendants(&entry.txid) {
                    debug!(txid = %hash_to_hex(&gone.txid), "removed invalid transaction after reorg");
                    removed.push(gone.txid);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::opcodes::OP_TRUE;
    use std::collections::HashMap;

    fn params() -> ConsensusParams {
        ConsensusParams::regtest()
    }

    fn ctx(params: &ConsensusParams) -> MempoolContext<'_> {
        MempoolContext {
            params,
            tip_height: 200,
            median_time_past: 1_600_000_000,
        }
    }

    fn chain_with(outpoints: &[(OutPoint, i64)]) -> HashMap<OutPoint, Coin> {
        outpoints
            .iter()
            .map(|(op, value)| {
                (
                    *op,
                    Coin::new(
                        TransactionOutput {
                            value: *value,
                            script_pubkey: vec![OP_TRUE],
                        },
                        1,
                        false,
                    ),
                )
            })
            .collect()
    }

    fn spend(prevouts: &[OutPoint], value: i64, sequence: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: prevouts
                .iter()
                .map(|p| TransactionInput {
                    prevout: *p,
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

    fn pool() -> Mempool {
        Mempool::new(MempoolConfig::default())
    }

    #[test]
    fn test_accept_and_duplicate() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = pool();
        let tx = spend(&[funding], 90_000, 0xffff_ffff);
        let outcome = mp.accept(tx.clone(), &chain, &ctx(&p)).unwrap();
        assert_eq!(outcome.fee, 10_000);
        assert_eq!(mp.spender(&funding), Some(tx.txid()));
        assert_eq!(mp.accept(tx, &chain, &ctx(&p)), Err(MempoolRejection::AlreadyInPool));
    }

    #[test]
    fn test_missing_input() {
        let p = params();
        let chain = chain_with(&[]);
        let missing = OutPoint::new([2; 32], 0);
        assert_eq!(
            pool().accept(spend(&[missing], 1, 0xffff_ffff), &chain, &ctx(&p)),
            Err(MempoolRejection::MissingInput(missing))
        );
    }

    #[test]
    fn test_below_min_fee() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        assert!(matches!(
            pool().accept(spend(&[funding], 100_000, 0xffff_ffff), &chain, &ctx(&p)),
            Err(MempoolRejection::BelowMinFee { fee: 0, .. })
        ));
    }

    #[test]
    fn test_non_final() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut tx = spend(&[funding], 90_000, 0);
        tx.lock_time = 500;
        assert_eq!(pool().accept(tx, &chain, &ctx(&p)), Err(MempoolRejection::NonFinal));
    }

    #[test]
    fn test_chained_spend_links_parent() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = pool();
        let parent = spend(&[funding], 90_000, 0xffff_ffff);
        mp.accept(parent.clone(), &chain, &ctx(&p)).unwrap();
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 80_000, 0xffff_ffff);
        mp.accept(child.clone(), &chain, &ctx(&p)).unwrap();

        assert!(mp.get(&child.txid()).unwrap().parents.contains(&parent.txid()));
        assert!(mp.get(&parent.txid()).unwrap().children.contains(&child.txid()));

        let removed = mp.remove_with_descendants(&parent.txid());
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].txid, child.txid());
        assert!(mp.is_empty());
        assert_eq!(mp.total_bytes(), 0);
    }

    #[test]
    fn test_conflict_without_signal_rejected() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = pool();
        mp.accept(spend(&[funding], 90_000, 0xffff_ffff), &chain, &ctx(&p)).unwrap();
        assert!(matches!(
            mp.accept(spend(&[funding], 50_000, 0xffff_ffff), &chain, &ctx(&p)),
            Err(MempoolRejection::ConflictsWithoutSufficientFeeBump(_))
        ));
    }

    #[test]
    fn test_replace_by_fee() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = pool();
        let original = spend(&[funding], 90_000, 0);
        mp.accept(original.clone(), &chain, &ctx(&p)).unwrap();
        let child = spend(&[OutPoint::new(original.txid(), 0)], 85_000, 0);
        mp.accept(child.clone(), &chain, &ctx(&p)).unwrap();

        // not enough to cover both replaced fees plus the increment
        let weak = spend(&[funding], 85_000, 0);
        assert!(matches!(
            mp.accept(weak, &chain, &ctx(&p)),
            Err(MempoolRejection::ConflictsWithoutSufficientFeeBump(_))
        ));

        let strong = spend(&[funding], 70_000, 0);
        let outcome = mp.accept(strong.clone(), &chain, &ctx(&p)).unwrap();
        assert_eq!(outcome.replaced.len(), 2);
        assert!(!mp.contains(&original.txid()));
        assert!(!mp.contains(&child.txid()));
        assert_eq!(mp.spender(&funding), Some(strong.txid()));
    }

    #[test]
    fn test_rbf_disabled() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = Mempool::new(MempoolConfig {
            enable_rbf: false,
            ..MempoolConfig::default()
        });
        mp.accept(spend(&[funding], 90_000, 0), &chain, &ctx(&p)).unwrap();
        assert!(mp.accept(spend(&[funding], 10_000, 0), &chain, &ctx(&p)).is_err());
    }

    #[test]
    fn test_eviction_by_fee_rate() {
        let p = params();
        let a = OutPoint::new([1; 32], 0);
        let b = OutPoint::new([2; 32], 0);
        let c = OutPoint::new([3; 32], 0);
        let chain = chain_with(&[(a, 100_000), (b, 100_000), (c, 100_000)]);
        let size = spend(&[a], 0, 0xffff_ffff).size();
        let mut mp = Mempool::new(MempoolConfig {
            max_bytes: size * 2,
            ..MempoolConfig::default()
        });
        let low = spend(&[a], 99_000, 0xffff_ffff);
        let mid = spend(&[b], 95_000, 0xffff_ffff);
        mp.accept(low.clone(), &chain, &ctx(&p)).unwrap();
        mp.accept(mid.clone(), &chain, &ctx(&p)).unwrap();

        let high = spend(&[c], 90_000, 0xffff_ffff);
        let outcome = mp.accept(high.clone(), &chain, &ctx(&p)).unwrap();
        assert_eq!(outcome.evicted, vec![low.txid()]);
        assert_eq!(mp.len(), 2);

        // a newcomer paying less than everything pooled is turned away
        let d = OutPoint::new([4; 32], 0);
        let chain = chain_with(&[(a, 100_000), (d, 100_000)]);
        let cheap = spend(&[d], 99_500, 0xffff_ffff);
        assert_eq!(
            mp.accept(cheap, &chain, &ctx(&p)),
            Err(MempoolRejection::ExceedsPoolSize)
        );
        assert!(mp.contains(&mid.txid()) && mp.contains(&high.txid()));
    }

    #[test]
    fn test_oversized_replacement_leaves_pool_untouched() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let original = spend(&[funding], 90_000, 0);
        let mut mp = Mempool::new(MempoolConfig {
            max_bytes: original.size() + 50,
            ..MempoolConfig::default()
        });
        mp.accept(original.clone(), &chain, &ctx(&p)).unwrap();
        let bytes_before = mp.total_bytes();

        let mut bulky = spend(&[funding], 10_000, 0);
        bulky.outputs[0].script_pubkey = vec![OP_TRUE; 400];
        assert_eq!(
            mp.accept(bulky, &chain, &ctx(&p)),
            Err(MempoolRejection::ExceedsPoolSize)
        );
        assert!(mp.contains(&original.txid()));
        assert_eq!(mp.len(), 1);
        assert_eq!(mp.total_bytes(), bytes_before);
        assert_eq!(mp.spender(&funding), Some(original.txid()));
    }

    #[test]
    fn test_child_of_evictable_parent_rejected_without_eviction() {
        let p = params();
        let a = OutPoint::new([1; 32], 0);
        let b = OutPoint::new([2; 32], 0);
        let chain = chain_with(&[(a, 100_000), (b, 100_000)]);
        let size = spend(&[a], 0, 0xffff_ffff).size();
        let mut mp = Mempool::new(MempoolConfig {
            max_bytes: size * 2,
            ..MempoolConfig::default()
        });
        let low = spend(&[a], 99_000, 0xffff_ffff);
        let mid = spend(&[b], 95_000, 0xffff_ffff);
        mp.accept(low.clone(), &chain, &ctx(&p)).unwrap();
        mp.accept(mid.clone(), &chain, &ctx(&p)).unwrap();

        // fitting the child means evicting its own parent
        let child = spend(&[OutPoint::new(low.txid(), 0)], 89_000, 0xffff_ffff);
        assert_eq!(
            mp.accept(child, &chain, &ctx(&p)),
            Err(MempoolRejection::ExceedsPoolSize)
        );
        assert!(mp.contains(&low.txid()) && mp.contains(&mid.txid()));
        assert_eq!(mp.total_bytes(), size * 2);
    }

    #[test]
    fn test_remove_for_block_purges_conflicts() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = pool();
        let pooled = spend(&[funding], 90_000, 0xffff_ffff);
        mp.accept(pooled.clone(), &chain, &ctx(&p)).unwrap();

        let confirmed = spend(&[funding], 80_000, 0xffff_ffff);
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![confirmed],
        };
        assert_eq!(mp.remove_for_block(&block), vec![pooled.txid()]);
        assert!(mp.is_empty());
        assert_eq!(mp.spender(&funding), None);
    }

    #[test]
    fn test_remove_invalid_after_reorg() {
        let p = params();
        let funding = OutPoint::new([1; 32], 0);
        let chain = chain_with(&[(funding, 100_000)]);
        let mut mp = pool();
        let parent = spend(&[funding], 90_000, 0xffff_ffff);
        mp.accept(parent.clone(), &chain, &ctx(&p)).unwrap();
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 80_000, 0xffff_ffff);
        mp.accept(child, &chain, &ctx(&p)).unwrap();

        let empty = chain_with(&[]);
        let removed = mp.remove_invalid(&empty, &ctx(&p));
        assert_eq!(removed.len(), 2);
        assert!(mp.is_empty());
    }
}
