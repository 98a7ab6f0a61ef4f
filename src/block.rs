//! Block validation: structure, context and connection

use std::collections::HashSet;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::warn;

use crate::constants::*;
use crate::economic::max_coinbase_value;
use crate::error::{ConsensusError, Result};
use crate::params::ConsensusParams;
use crate::pow::check_proof_of_work;
use crate::script::{count_legacy_sigops, height_push, verify_script, ScriptFlags, TxContext};
use crate::serialization::compute_merkle_root;
use crate::transaction::{check_transaction, check_tx_inputs, is_final};
use crate::types::*;
use crate::utxo::{BlockUndo, CoinOverlay, CoinView, UtxoSet};

/// Block weight: there is no witness data, so every byte counts four times
pub fn block_weight(block: &Block) -> usize {
    block.size().saturating_mul(WITNESS_SCALE_FACTOR)
}

/// Legacy sigops in a transaction's input and output scripts
pub fn transaction_sigops(tx: &Transaction) -> usize {
    tx.inputs
        .iter()
        .map(|i| count_legacy_sigops(&i.script_sig))
        .chain(tx.outputs.iter().map(|o| count_legacy_sigops(&o.script_pubkey)))
        .sum()
}

/// CheckBlock: ℬ → {valid, malformed}
///
/// A block b = (h, txs) is well-formed if and only if:
/// 1. |txs| > 0 and weight(b) ≤ W_max
/// 2. txs[0] is a coinbase and no other transaction is
/// 3. ∀tx ∈ txs: CheckTransaction(tx) = valid
/// 4. MerkleRoot(txids) = h.merkle_root, with no duplicated subtree
/// 5. no two transactions share a txid
/// 6. SHA256(SHA256(h)) ≤ target(h.bits)
/// 7. Σ legacy sigops ≤ S_max
pub fn check_block(block: &Block, params: &ConsensusParams) -> Result<()> {
    if block.transactions.is_empty() {
        return Err(ConsensusError::Malformed("block has no transactions".into()));
    }
    let weight = block_weight(block);
    if weight > params.max_block_weight {
        return Err(ConsensusError::Malformed(format!(
            "block weight {} exceeds {}",
            weight, params.max_block_weight
        )));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::Malformed("first transaction is not a coinbase".into()));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ConsensusError::Malformed("more than one coinbase".into()));
    }

    for (i, tx) in block.transactions.iter().enumerate() {
        if let ValidationResult::Invalid(reason) = check_transaction(tx) {
            return Err(ConsensusError::Malformed(format!("transaction {}: {}", i, reason)));
        }
    }

    let txids: Vec<Hash> = block.transactions.iter().map(|tx| tx.txid()).collect();
    let (root, mutated) = compute_merkle_root(&txids);
    if mutated {
        return Err(ConsensusError::Malformed("merkle tree contains duplicate subtree".into()));
    }
    if root != block.header.merkle_root {
        return Err(ConsensusError::Malformed("merkle root mismatch".into()));
    }
    let mut seen = HashSet::with_capacity(txids.len());
    if !txids.iter().all(|txid| seen.insert(*txid)) {
        return Err(ConsensusError::Malformed("duplicate transaction".into()));
    }

    if !check_proof_of_work(&block.header, params)? {
        return Err(ConsensusError::Malformed("proof of work failed".into()));
    }

    let sigops: usize = block.transactions.iter().map(transaction_sigops).sum();
    if sigops > params.max_block_sigops {
        return Err(ConsensusError::Malformed(format!("too many sigops: {}", sigops)));
    }

    Ok(())
}

/// What a block's parent implies about the block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub height: Natural,
    /// Median time past of the parent
    pub median_time_past: u32,
    pub expected_bits: u32,
}

/// ContextualCheckBlock: ℬ × 𝒞 → {valid, invalid}
///
/// 1. h.bits = expected bits from the retarget schedule
/// 2. h.timestamp > median time past of the parent
/// 3. ∀tx ∈ txs: IsFinal(tx, height, median time past)
/// 4. height ≥ bip34_height ⇒ coinbase script starts with push(height)
pub fn contextual_check_block(
    block: &Block,
    ctx: &BlockContext,
    params: &ConsensusParams,
) -> Result<()> {
    if block.header.bits != ctx.expected_bits {
        return Err(ConsensusError::ContextuallyInvalid(format!(
            "incorrect difficulty bits {:#010x}, expected {:#010x}",
            block.header.bits, ctx.expected_bits
        )));
    }
    if block.header.timestamp <= ctx.median_time_past {
        return Err(ConsensusError::ContextuallyInvalid(format!(
            "block time {} not above median time past {}",
            block.header.timestamp, ctx.median_time_past
        )));
    }
    for tx in &block.transactions {
        if !is_final(tx, ctx.height, ctx.median_time_past as u64) {
            return Err(ConsensusError::ContextuallyInvalid(format!(
                "non-final transaction {}",
                hash_to_hex(&tx.txid())
            )));
        }
    }
    if ctx.height >= params.bip34_height {
        let expected = height_push(ctx.height);
        let script = block
            .transactions
            .first()
            .and_then(|cb| cb.inputs.first())
            .map(|input| input.script_sig.as_slice())
            .unwrap_or_default();
        if !script.starts_with(&expected) {
            return Err(ConsensusError::ContextuallyInvalid(
                "coinbase does not commit to block height".into(),
            ));
        }
    }
    Ok(())
}

/// One input awaiting script verification
#[derive(Debug, Clone)]
struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    coin: Coin,
}

/// CheckBlockInputs: ℬ × 𝒰𝒮 × ℕ → ℤ | invalid
///
/// For block b at height h against coin view us:
/// 1. Resolve every non-coinbase input, in block order, against us plus
///    the outputs of earlier transactions in b; apply coinbase maturity
/// 2. fees = Σ (inputs - outputs)
/// 3. coinbase outputs ≤ GetBlockSubsidy(h) + fees
/// 4. Every input's scripts verify; checks run in parallel and the first
///    failure in block order is reported
///
/// Reads only; nothing is applied. Returns the total fees.
pub fn check_block_inputs<V: CoinView + ?Sized>(
    block: &Block,
    view: &V,
    height: Natural,
    params: &ConsensusParams,
    pool: Option<&ThreadPool>,
) -> Result<Integer> {
    let mut overlay = CoinOverlay::new(view);
    let mut fees: Integer = 0;
    let mut checks = Vec::new();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        if !tx.is_coinbase() {
            let (fee, coins) = check_tx_inputs(tx, &overlay, height, params.coinbase_maturity)
                .map_err(|e| {
                    ConsensusError::ContextuallyInvalid(format!(
                        "transaction {}: {}",
                        hash_to_hex(&tx.txid()),
                        e
                    ))
                })?;
            fees = fees
                .checked_add(fee)
                .filter(|total| *total <= MAX_MONEY)
                .ok_or_else(|| ConsensusError::ContextuallyInvalid("fees out of range".into()))?;
            for (input_index, (input, coin)) in tx.inputs.iter().zip(coins).enumerate() {
                overlay.spend(&input.prevout);
                checks.push(ScriptCheck {
                    tx_index,
                    input_index,
                    coin,
                });
            }
        }
        overlay.add_transaction(tx, height);
    }

    let claimed = block
        .transactions
        .first()
        .and_then(|coinbase| coinbase.total_output_value())
        .ok_or_else(|| ConsensusError::ContextuallyInvalid("coinbase value out of range".into()))?;
    let allowed = max_coinbase_value(height, fees, params);
    if claimed > allowed {
        return Err(ConsensusError::ContextuallyInvalid(format!(
            "coinbase pays {} but subsidy plus fees is {}",
            claimed, allowed
        )));
    }

    run_script_checks(block, &checks, pool)?;
    Ok(fees)
}

fn run_script_checks(block: &Block, checks: &[ScriptCheck], pool: Option<&ThreadPool>) -> Result<()> {
    let flags = ScriptFlags::consensus();
    let first_failure = || {
        checks
            .par_iter()
            .filter_map(|check| {
                let tx = &block.transactions[check.tx_index];
                let ctx = TxContext::new(tx, check.input_index, check.coin.value());
                verify_script(
                    &tx.inputs[check.input_index].script_sig,
                    &check.coin.output.script_pubkey,
                    &ctx,
                    flags,
                )
                .err()
                .map(|e| (check.tx_index, check.input_index, e))
            })
            .min_by_key(|(tx_index, input_index, _)| (*tx_index, *input_index))
    };
    let failure = match pool {
        Some(pool) => pool.install(first_failure),
        None => first_failure(),
    };
    if let Some((tx_index, input_index, err)) = failure {
        let txid = block.transactions[tx_index].txid();
        warn!(
            txid = %hash_to_hex(&txid),
            input = input_index,
            %err,
            "script validation failed"
        );
        return Err(ConsensusError::ContextuallyInvalid(format!(
            "script failed for transaction {} input {}: {}",
            hash_to_hex(&txid),
            input_index,
            err
        )));
    }
    Ok(())
}

/// ConnectBlock: ℬ × 𝒰𝒮 × ℕ → 𝒰𝒮' × Undo | invalid
///
/// CheckBlockInputs, then ApplyBlock. The set is untouched on failure.
pub fn connect_block(
    block: &Block,
    utxo: &mut UtxoSet,
    height: Natural,
    params: &ConsensusParams,
    pool: Option<&ThreadPool>,
) -> Result<(BlockUndo, Integer)> {
    let fees = check_block_inputs(block, &*utxo, height, params, pool)?;
    let undo = utxo.apply_block(block, height)?;
    Ok((undo, fees))
}
