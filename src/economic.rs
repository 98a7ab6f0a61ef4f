//! Subsidy schedule and fee arithmetic

use crate::params::ConsensusParams;
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℤ
///
/// Formula: subsidy = S₀ × 2^(-⌊h/H⌋), zero after 64 halvings
/// Where:
/// - h = block height
/// - H = subsidy_halving_interval
/// - S₀ = initial_subsidy
pub fn get_block_subsidy(height: Natural, params: &ConsensusParams) -> Integer {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

/// Most a coinbase at `height` may claim given the block's total fees
pub fn max_coinbase_value(height: Natural, fees: Integer, params: &ConsensusParams) -> Integer {
    get_block_subsidy(height, params).saturating_add(fees)
}

/// Fee per 1000 bytes, as used by relay policy
pub fn fee_rate_per_kb(fee: Integer, size: usize) -> Integer {
    if size == 0 {
        return 0;
    }
    fee.saturating_mul(1000) / size as i64
}

/// Minimum fee for `size` bytes at `rate_per_kb`, rounded like the relay rule
pub fn min_fee_for_size(rate_per_kb: Integer, size: usize) -> Integer {
    let fee = rate_per_kb.saturating_mul(size as i64) / 1000;
    if fee == 0 && size != 0 && rate_per_kb > 0 {
        1
    } else {
        fee
    }
}

/// Whether fee_a / size_a > fee_b / size_b, without division
pub fn higher_fee_rate(fee_a: Integer, size_a: usize, fee_b: Integer, size_b: usize) -> bool {
    (fee_a as i128) * (size_b as i128) > (fee_b as i128) * (size_a as i128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{COIN, MAX_MONEY};

    #[test]
    fn test_subsidy_halving() {
        let params = ConsensusParams::mainnet_like();
        assert_eq!(get_block_subsidy(0, &params), 50 * COIN);
        assert_eq!(get_block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(get_block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(get_block_subsidy(210_000 * 64, &params), 0);
    }

    #[test]
    fn test_total_supply_below_cap() {
        let params = ConsensusParams::mainnet_like();
        let total: i64 = (0..64)
            .map(|era| get_block_subsidy(era * 210_000, &params) * 210_000)
            .sum();
        assert!(total <= MAX_MONEY);
    }

    #[test]
    fn test_fee_rates() {
        assert_eq!(fee_rate_per_kb(500, 250), 2000);
        assert_eq!(min_fee_for_size(1000, 250), 250);
        assert_eq!(min_fee_for_size(1, 250), 1);
        assert_eq!(min_fee_for_size(0, 250), 0);
        assert!(higher_fee_rate(300, 100, 500, 200));
        assert!(!higher_fee_rate(250, 100, 500, 200));
    }
}
