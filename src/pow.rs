//! Proof of work: 256-bit targets, compact encoding, block work and the
//! difficulty retarget schedule

use std::cmp::Ordering;
use std::fmt;

use crate::error::{ConsensusError, Result};
use crate::params::ConsensusParams;
use crate::types::*;

/// 256-bit unsigned integer, little-endian 64-bit limbs
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }
        result
    }

    pub fn not(&self) -> Self {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    pub fn overflowing_add(&self, other: &Self) -> (Self, bool) {
        let mut result = U256::ZERO;
        let mut carry = false;
        for i in 0..4 {
            let (s1, c1) = self.0[i].overflowing_add(other.0[i]);
            let (s2, c2) = s1.overflowing_add(carry as u64);
            result.0[i] = s2;
            carry = c1 || c2;
        }
        (result, carry)
    }

    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        match self.overflowing_add(other) {
            (v, false) => Some(v),
            _ => None,
        }
    }

    pub fn wrapping_add(&self, other: &Self) -> Self {
        self.overflowing_add(other).0
    }

    /// Subtraction modulo 2^256
    pub fn wrapping_sub(&self, other: &Self) -> Self {
        let negated = other.not().overflowing_add(&U256::ONE).0;
        self.overflowing_add(&negated).0
    }

    /// Saturates at `U256::MAX`; cumulative work never realistically gets there
    pub fn saturating_add(&self, other: &Self) -> Self {
        self.checked_add(other).unwrap_or(U256::MAX)
    }

    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        if self < other {
            return None;
        }
        let mut result = U256::ZERO;
        let mut borrow = false;
        for i in 0..4 {
            let (d1, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (d2, b2) = d1.overflowing_sub(borrow as u64);
            result.0[i] = d2;
            borrow = b1 || b2;
        }
        Some(result)
    }

    pub fn checked_mul_u64(&self, factor: u64) -> Option<Self> {
        let mut result = U256::ZERO;
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry;
            result.0[i] = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            return None;
        }
        Some(result)
    }

    /// Shift-subtract long division; `None` on division by zero
    pub fn checked_div(&self, divisor: &Self) -> Option<Self> {
        if divisor.is_zero() {
            return None;
        }
        if self < divisor {
            return Some(U256::ZERO);
        }
        let mut quotient = U256::ZERO;
        let mut remainder = *self;
        let shift = self.bits() - divisor.bits();
        let mut d = divisor.shl(shift);
        for s in (0..=shift).rev() {
            if let Some(r) = remainder.checked_sub(&d) {
                remainder = r;
                quotient.0[(s / 64) as usize] |= 1 << (s % 64);
            }
            d = d.shr(1);
        }
        Some(quotient)
    }

    /// Interpret 32 bytes as a little-endian number (hash byte order)
    pub fn from_le_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(buf);
        }
        U256(words)
    }

    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self)
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut be = self.to_le_bytes();
        be.reverse();
        write!(f, "{}", hex::encode(be))
    }
}

/// Decoded compact target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

/// Expand target from compact representation
///
/// The format is 0xEEMMMMMM: exponent E (bytes), 23-bit mantissa M and a
/// sign bit. The target is M × 256^(E-3).
pub fn expand_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;
    let target = if size <= 3 {
        U256::from_u64((word >> (8 * (3 - size))) as u64)
    } else {
        U256::from_u64(word as u64).shl(8 * (size - 3))
    };
    CompactTarget {
        target,
        negative: word != 0 && (bits & 0x0080_0000) != 0,
        overflow: word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)),
    }
}

/// Encode a target in compact form (shortest, sign bit clear)
pub fn to_compact(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        target.shr(8 * (size - 3)).low_u64() as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Target for `bits`, rejecting encodings a valid header may never use
pub fn target_from_bits(bits: u32, pow_limit: &U256) -> Result<U256> {
    let decoded = expand_compact(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return Err(ConsensusError::Malformed(format!("invalid compact target {:#010x}", bits)));
    }
    if decoded.target > *pow_limit {
        return Err(ConsensusError::Malformed(format!(
            "target {:#010x} easier than proof-of-work limit",
            bits
        )));
    }
    Ok(decoded.target)
}

pub fn pow_limit(params: &ConsensusParams) -> U256 {
    expand_compact(params.pow_limit_bits).target
}

/// CheckProofOfWork: ℋ → {true, false}
///
/// Formula: SHA256(SHA256(header)) ≤ ExpandTarget(header.bits), with the
/// hash read as a little-endian 256-bit number.
pub fn check_proof_of_work(header: &BlockHeader, params: &ConsensusParams) -> Result<bool> {
    let target = target_from_bits(header.bits, &pow_limit(params))?;
    let hash = U256::from_le_bytes(&header.hash());
    Ok(hash <= target)
}

/// Work implied by a target: 2^256 / (target + 1), computed as
/// (~target / (target + 1)) + 1 to stay within 256 bits.
pub fn block_work(bits: u32) -> U256 {
    let decoded = expand_compact(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return U256::ZERO;
    }
    let denominator = decoded.target.saturating_add(&U256::ONE);
    decoded
        .target
        .not()
        .checked_div(&denominator)
        .map(|q| q.saturating_add(&U256::ONE))
        .unwrap_or(U256::ZERO)
}

/// Whether the block at `height` starts a new difficulty window
pub fn is_retarget_height(height: Natural, params: &ConsensusParams) -> bool {
    !params.no_retargeting && height % params.retarget_interval == 0
}

/// CalculateNextWorkRequired: ℕ × ℕ × ℕ → ℕ
///
/// 1. actual = last_time - first_time, clamped to [T/4, 4T]
/// 2. new = old × actual / T
/// 3. new = min(new, pow_limit)
pub fn calculate_next_work_required(
    parent_bits: u32,
    first_block_time: u32,
    last_block_time: u32,
    params: &ConsensusParams,
) -> u32 {
    if params.no_retargeting {
        return parent_bits;
    }
    let timespan = params.target_timespan() as i64;
    let actual = (last_block_time as i64 - first_block_time as i64)
        .clamp(timespan / 4, timespan * 4) as u64;

    let limit = pow_limit(params);
    let old = expand_compact(parent_bits).target;
    let divisor = U256::from_u64(timespan as u64);
    let new = match old.checked_mul_u64(actual) {
        Some(scaled) => scaled.checked_div(&divisor),
        None => old
            .checked_div(&divisor)
            .and_then(|t| t.checked_mul_u64(actual)),
    }
    .unwrap_or(limit);

    to_compact(if new > limit { &limit } else { &new })
}

/// MedianTimePast: median of the given timestamps (the last N headers)
pub fn median_time_past(timestamps: &[u32]) -> u32 {
    if timestamps.is_empty() {
        return 0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // U256
    // ============================================================================

    #[test]
    fn test_u256_shifts() {
        let one = U256::ONE;
        assert_eq!(one.shl(64), U256([0, 1, 0, 0]));
        assert_eq!(one.shl(255).shr(255), one);
        assert_eq!(one.shl(256), U256::ZERO);
        assert_eq!(U256([0, 1, 0, 0]).shr(1), U256([1 << 63, 0, 0, 0]));
    }

    #[test]
    fn test_u256_add_sub() {
        let a = U256([u64::MAX, 0, 0, 0]);
        let (sum, overflow) = a.overflowing_add(&U256::ONE);
        assert_eq!(sum, U256([0, 1, 0, 0]));
        assert!(!overflow);
        assert_eq!(sum.checked_sub(&U256::ONE), Some(a));
        assert_eq!(U256::ONE.checked_sub(&sum), None);
        assert!(U256::MAX.checked_add(&U256::ONE).is_none());
    }

    #[test]
    fn test_u256_div() {
        let n = U256::from_u64(1_000_000);
        assert_eq!(n.checked_div(&U256::from_u64(7)), Some(U256::from_u64(142_857)));
        assert_eq!(n.checked_div(&U256::ZERO), None);
        let big = U256::ONE.shl(200);
        assert_eq!(big.checked_div(&U256::ONE.shl(100)), Some(U256::ONE.shl(100)));
    }

    #[test]
    fn test_u256_ordering() {
        assert!(U256([0, 0, 0, 1]) > U256([u64::MAX, u64::MAX, u64::MAX, 0]));
        assert_eq!(U256::ONE.bits(), 1);
        assert_eq!(U256::ONE.shl(200).bits(), 201);
    }

    // ============================================================================
    // COMPACT TARGETS
    // ============================================================================

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x207fffff, 0x1b0404cb, 0x03123456, 0x05009234] {
            let decoded = expand_compact(bits);
            assert!(!decoded.negative && !decoded.overflow);
            assert_eq!(to_compact(&decoded.target), bits);
        }
    }

    #[test]
    fn test_compact_small_exponent() {
        assert_eq!(expand_compact(0x01123456).target, U256::from_u64(0x12));
        assert_eq!(expand_compact(0x02123456).target, U256::from_u64(0x1234));
    }

    #[test]
    fn test_compact_negative_and_overflow() {
        assert!(expand_compact(0x04923456).negative);
        assert!(expand_compact(0xff123456).overflow);
        let limit = expand_compact(0x207fffff).target;
        assert!(target_from_bits(0x04923456, &limit).is_err());
        assert!(target_from_bits(0x00000000, &limit).is_err());
        assert!(target_from_bits(0x1d00ffff, &limit).is_ok());
        assert!(target_from_bits(0x2100ffff, &limit).is_err());
    }

    // ============================================================================
    // WORK
    // ============================================================================

    #[test]
    fn test_block_work() {
        // target 2^255 - 1 style regtest limit gives work 2
        assert_eq!(block_work(0x207fffff), U256::from_u64(2));
        // mainnet genesis difficulty: 0x100010001
        assert_eq!(block_work(0x1d00ffff), U256::from_u64(0x1_0001_0001));
        assert!(block_work(0x1b0404cb) > block_work(0x1d00ffff));
        assert_eq!(block_work(0), U256::ZERO);
    }

    // ============================================================================
    // RETARGET
    // ============================================================================

    #[test]
    fn test_retarget_on_schedule_keeps_bits() {
        let params = ConsensusParams::mainnet_like();
        let span = params.target_timespan() as u32;
        assert_eq!(calculate_next_work_required(0x1d00ffff, 0, span, &params), 0x1d00ffff);
    }

    #[test]
    fn test_retarget_fast_blocks_clamped() {
        let params = ConsensusParams::mainnet_like();
        // blocks arrived instantly: difficulty rises by the 4x maximum
        let bits = calculate_next_work_required(0x1c0ffff0, 1000, 1000, &params);
        let expected = expand_compact(0x1c0ffff0).target.shr(2);
        assert_eq!(expand_compact(bits).target, expected);
    }

    #[test]
    fn test_retarget_slow_blocks_capped_at_limit() {
        let params = ConsensusParams::mainnet_like();
        let span = params.target_timespan() as u32;
        let bits = calculate_next_work_required(0x1d00ffff, 0, span * 10, &params);
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn test_no_retargeting() {
        let params = ConsensusParams::regtest();
        assert_eq!(calculate_next_work_required(0x207fffff, 0, 1, &params), 0x207fffff);
        assert!(!is_retarget_height(150, &params));
    }

    #[test]
    fn test_median_time_past() {
        assert_eq!(median_time_past(&[5, 1, 3]), 3);
        assert_eq!(median_time_past(&[1, 2, 3, 4]), 3);
        assert_eq!(median_time_past(&[]), 0);
    }
}
