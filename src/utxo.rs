//! The unspent transaction output set
//!
//! Maps outpoints to [`Coin`] records and applies or reverts one block at a
//! time. Every applied block yields a [`BlockUndo`] holding exactly the
//! coins it removed and the outpoints it added, so disconnecting restores
//! the previous set byte for byte. An order-independent commitment over all
//! coins is maintained incrementally and recorded in each undo record; a
//! disconnect that does not land back on that commitment means the ledger
//! can no longer be trusted.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::crypto::double_sha256;
use crate::error::{ConsensusError, Result};
use crate::pow::U256;
use crate::script::opcodes::OP_RETURN;
use crate::serialization::{write_outpoint, write_output};
use crate::types::*;

/// Read access to coins, however they are backed
pub trait CoinView {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin>;
}

impl CoinView for HashMap<OutPoint, Coin> {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.get(outpoint).cloned()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("double spend of {}:{}", hash_to_hex(&.0.hash), .0.index)]
    DoubleSpend(OutPoint),
    #[error("missing input {}:{}", hash_to_hex(&.0.hash), .0.index)]
    MissingInput(OutPoint),
    #[error("output {}:{} already exists unspent", hash_to_hex(&.0.hash), .0.index)]
    DuplicateOutput(OutPoint),
}

/// Coins one transaction removed and the outpoints it added
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    /// Coins spent, in input order
    pub spent: Vec<(OutPoint, Coin)>,
    /// Outpoints created, in output order
    pub created: Vec<OutPoint>,
}

/// Undo data for a single block, one [`TxUndo`] per transaction in block
/// order. A transaction may spend what an earlier one in the same block
/// created, so reverting must walk transactions back to front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub block_hash: Hash,
    pub height: Natural,
    pub txs: Vec<TxUndo>,
    /// Set commitment before the block was applied
    pub commitment_before: Hash,
}

impl BlockUndo {
    pub fn new(block_hash: Hash, height: Natural, commitment_before: Hash) -> Self {
        Self {
            block_hash,
            height,
            txs: Vec::new(),
            commitment_before,
        }
    }

    /// Every coin the block spent, in spend order
    pub fn spent(&self) -> impl Iterator<Item = &(OutPoint, Coin)> {
        self.txs.iter().flat_map(|tx| tx.spent.iter())
    }

    /// Every outpoint the block created, in creation order
    pub fn created(&self) -> impl Iterator<Item = &OutPoint> {
        self.txs.iter().flat_map(|tx| tx.created.iter())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConsensusError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConsensusError::Serialization(e.to_string()))
    }
}

/// Outputs beginning with OP_RETURN can never be spent and are not stored
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN)
}

fn coin_digest(outpoint: &OutPoint, coin: &Coin) -> U256 {
    let mut data = Vec::with_capacity(64 + coin.output.script_pubkey.len());
    write_outpoint(&mut data, outpoint);
    data.extend_from_slice(&coin.height.to_le_bytes());
    data.push(coin.is_coinbase as u8);
    write_output(&mut data, &coin.output);
    U256::from_le_bytes(&double_sha256(&data))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    coins: HashMap<OutPoint, Coin>,
    commitment: U256,
}

impl CoinView for UtxoSet {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.get(outpoint).cloned()
    }
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.coins.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.coins.iter()
    }

    /// Order-independent digest of the whole set
    pub fn commitment(&self) -> Hash {
        self.commitment.to_le_bytes()
    }

    /// Recompute the commitment from scratch
    pub fn recompute_commitment(&self) -> Hash {
        self.coins
            .iter()
            .fold(U256::ZERO, |acc, (op, coin)| acc.wrapping_add(&coin_digest(op, coin)))
            .to_le_bytes()
    }

    fn insert(&mut self, outpoint: OutPoint, coin: Coin) {
        self.commitment = self.commitment.wrapping_add(&coin_digest(&outpoint, &coin));
        self.coins.insert(outpoint, coin);
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let coin = self.coins.remove(outpoint)?;
        self.commitment = self.commitment.wrapping_sub(&coin_digest(outpoint, &coin));
        Some(coin)
    }

    /// ApplyBlock: 𝒰𝒮 × ℬ × ℕ → 𝒰𝒮 × Undo | error
    ///
    /// For each transaction in block order:
    /// 1. Each non-coinbase input must reference a coin that exists and
    ///    was not already spent by this block; it is removed
    /// 2. Each spendable output is added, tagged with the height and
    ///    coinbase flag; overwriting an unspent coin is refused
    ///
    /// On failure every change already made is reverted before returning.
    pub fn apply_block(
        &mut self,
        block: &Block,
        height: Natural,
    ) -> std::result::Result<BlockUndo, UtxoError> {
        let mut undo = BlockUndo::new(block.hash(), height, self.commitment());
        let mut spent_here: HashSet<OutPoint> = HashSet::new();

        match self.apply_transactions(block, height, &mut undo, &mut spent_here) {
            Ok(()) => {
                debug!(
                    height,
                    spent = undo.spent().count(),
                    created = undo.created().count(),
                    "applied block to utxo set"
                );
                Ok(undo)
            }
            Err(e) => {
                self.revert(&undo);
                Err(e)
            }
        }
    }

    fn apply_transactions(
        &mut self,
        block: &Block,
        height: Natural,
        undo: &mut BlockUndo,
        spent_here: &mut HashSet<OutPoint>,
    ) -> std::result::Result<(), UtxoError> {
        for tx in &block.transactions {
            let mut tx_undo = TxUndo::default();
            let result = self.apply_transaction(tx, height, &mut tx_undo, spent_here);
            // a partial record still has to be reverted on failure
            undo.txs.push(tx_undo);
            result?;
        }
        Ok(())
    }

    fn apply_transaction(
        &mut self,
        tx: &Transaction,
        height: Natural,
        tx_undo: &mut TxUndo,
        spent_here: &mut HashSet<OutPoint>,
    ) -> std::result::Result<(), UtxoError> {
        let is_coinbase = tx.is_coinbase();
        if !is_coinbase {
            for input in &tx.inputs {
                match self.remove(&input.prevout) {
                    Some(coin) => {
                        spent_here.insert(input.prevout);
                        tx_undo.spent.push((input.prevout, coin));
                    }
                    None if spent_here.contains(&input.prevout) => {
                        return Err(UtxoError::DoubleSpend(input.prevout));
                    }
                    None => return Err(UtxoError::MissingInput(input.prevout)),
                }
            }
        }

        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            let outpoint = OutPoint::new(txid, index as u32);
            if self.contains(&outpoint) {
                return Err(UtxoError::DuplicateOutput(outpoint));
            }
            self.insert(outpoint, Coin::new(output.clone(), height, is_coinbase));
            tx_undo.created.push(outpoint);
        }
        Ok(())
    }

    /// Undo a partially or fully applied block without verification
    fn revert(&mut self, undo: &BlockUndo) {
        for tx in undo.txs.iter().rev() {
            for outpoint in tx.created.iter().rev() {
                self.remove(outpoint);
            }
            for (outpoint, coin) in tx.spent.iter().rev() {
                self.insert(*outpoint, coin.clone());
            }
        }
    }

    /// DisconnectBlock: 𝒰𝒮 × Undo → 𝒰𝒮 | fatal
    ///
    /// For each transaction, last to first:
    /// 1. Every outpoint it created must be present; remove it
    /// 2. Every outpoint it spent must be absent; restore it
    ///
    /// With `verify_commitment`, the resulting commitment must then equal
    /// the one recorded before the block was applied. Any mismatch is an
    /// internal invariant violation.
    pub fn disconnect_block(&mut self, undo: &BlockUndo, verify_commitment: bool) -> Result<()> {
        for tx in undo.txs.iter().rev() {
            for outpoint in tx.created.iter().rev() {
                if self.remove(outpoint).is_none() {
                    return Err(self.invariant_violation(
                        undo,
                        format!(
                            "created output {}:{} missing on disconnect",
                            hash_to_hex(&outpoint.hash),
                            outpoint.index
                        ),
                    ));
                }
            }
            for (outpoint, coin) in tx.spent.iter().rev() {
                if self.contains(outpoint) {
                    return Err(self.invariant_violation(
                        undo,
                        format!(
                            "restored output {}:{} already present",
                            hash_to_hex(&outpoint.hash),
                            outpoint.index
                        ),
                    ));
                }
                self.insert(*outpoint, coin.clone());
            }
        }

        if verify_commitment && self.commitment() != undo.commitment_before {
            return Err(self.invariant_violation(
                undo,
                "utxo commitment does not match pre-image after disconnect".to_string(),
            ));
        }
        debug!(height = undo.height, "disconnected block from utxo set");
        Ok(())
    }

    fn invariant_violation(&self, undo: &BlockUndo, reason: String) -> ConsensusError {
        error!(
            block = %hash_to_hex(&undo.block_hash),
            height = undo.height,
            %reason,
            "utxo disconnect failed"
        );
        ConsensusError::InternalInvariantViolation(reason)
    }
}

/// A view layering pending additions and spends over a base view
pub struct CoinOverlay<'a, V: CoinView + ?Sized> {
    base: &'a V,
    added: HashMap<OutPoint, Coin>,
    spent: HashSet<OutPoint>,
}

impl<'a, V: CoinView + ?Sized> CoinOverlay<'a, V> {
    pub fn new(base: &'a V) -> Self {
        Self {
            base,
            added: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    pub fn add_transaction(&mut self, tx: &Transaction, height: Natural) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            if is_unspendable(&output.script_pubkey) {
                continue;
            }
            self.added.insert(
                OutPoint::new(txid, index as u32),
                Coin::new(output.clone(), height, is_coinbase),
            );
        }
    }

    pub fn spend(&mut self, outpoint: &OutPoint) {
        if self.added.remove(outpoint).is_none() {
            self.spent.insert(*outpoint);
        }
    }
}

impl<'a, V: CoinView + ?Sized> CoinView for CoinOverlay<'a, V> {
    fn coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(coin) = self.added.get(outpoint) {
            return Some(coin.clone());
        }
        if self.spent.contains(outpoint) {
            return None;
        }
        self.base.coin(outpoint)
    }
}
