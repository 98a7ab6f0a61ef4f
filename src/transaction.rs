//! Transaction validation: stateless checks, finality and input resolution

use std::collections::HashSet;

use thiserror::Error;

use crate::constants::*;
use crate::types::*;
use crate::utxo::CoinView;

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |tx| ≤ M_max_tx_size
/// 3. ∀o ∈ outs: 0 ≤ o.value ≤ M_max, and Σ o.value ≤ M_max
/// 4. no two inputs spend the same outpoint
/// 5. coinbase: 2 ≤ |ins[0].script_sig| ≤ 100;
///    otherwise no input has a null prevout
pub fn check_transaction(tx: &Transaction) -> ValidationResult {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return ValidationResult::Invalid("Empty inputs or outputs".to_string());
    }

    let tx_size = tx.size();
    if tx_size > MAX_TX_SIZE {
        return ValidationResult::Invalid(format!("Transaction too large: {} bytes", tx_size));
    }

    let mut total: i64 = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 || output.value > MAX_MONEY {
            return ValidationResult::Invalid(format!(
                "Invalid output value {} at index {}",
                output.value, i
            ));
        }
        total += output.value;
        if total > MAX_MONEY {
            return ValidationResult::Invalid("Total output value out of range".to_string());
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return ValidationResult::Invalid("Duplicate input".to_string());
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return ValidationResult::Invalid(format!("Bad coinbase script length {}", len));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return ValidationResult::Invalid("Null prevout in non-coinbase transaction".to_string());
    }

    ValidationResult::Valid
}

/// IsFinal: 𝒯𝒳 × ℕ × ℕ → {true, false}
///
/// A transaction is final in a block at `height` with time `block_time`
/// when its lock time is zero, already passed (height or time, depending
/// on the threshold), or every input opts out with a final sequence.
pub fn is_final(tx: &Transaction, height: Natural, block_time: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        block_time
    };
    if (tx.lock_time as u64) < limit {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Whether any input opts in to replacement
pub fn signals_rbf(tx: &Transaction) -> bool {
    tx.inputs.iter().any(|input| input.sequence <= SEQUENCE_RBF)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxInputError {
    #[error("missing or spent input {}:{}", hash_to_hex(&.0.hash), .0.index)]
    Missing(OutPoint),
    #[error("premature spend of coinbase created at height {created}, spent at {spend_height}")]
    ImmatureCoinbase { created: Natural, spend_height: Natural },
    #[error("input value out of range")]
    ValueOutOfRange,
    #[error("input value {input} below output value {output}")]
    InsufficientValue { input: Integer, output: Integer },
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 × ℕ → (ℤ, 𝒰*) | error
///
/// For non-coinbase transaction tx against coin view us at height h:
/// 1. ∀i ∈ ins: us(i.prevout) exists
/// 2. coinbase coins satisfy h - created ≥ maturity
/// 3. Σ in ≤ M_max
/// 4. Σ in ≥ Σ out; fee = Σ in - Σ out
///
/// Returns the fee and the resolved coins in input order.
pub fn check_tx_inputs<V: CoinView + ?Sized>(
    tx: &Transaction,
    view: &V,
    spend_height: Natural,
    coinbase_maturity: Natural,
) -> Result<(Integer, Vec<Coin>), TxInputError> {
    let mut coins = Vec::with_capacity(tx.inputs.len());
    let mut total_in: i64 = 0;

    for input in &tx.inputs {
        let coin = view
            .coin(&input.prevout)
            .ok_or(TxInputError::Missing(input.prevout))?;
        if !coin.is_mature(spend_height, coinbase_maturity) {
            return Err(TxInputError::ImmatureCoinbase {
                created: coin.height,
                spend_height,
            });
        }
        if coin.value() < 0 || coin.value() > MAX_MONEY {
            return Err(TxInputError::ValueOutOfRange);
        }
        total_in += coin.value();
        if total_in > MAX_MONEY {
            return Err(TxInputError::ValueOutOfRange);
        }
        coins.push(coin);
    }

    let total_out = tx.total_output_value().ok_or(TxInputError::ValueOutOfRange)?;
    if total_in < total_out {
        return Err(TxInputError::InsufficientValue {
            input: total_in,
            output: total_out,
        });
    }
    Ok((total_in - total_out, coins))
}
