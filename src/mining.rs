//! Block creation for local networks and tests

use std::collections::HashSet;

use crate::block::transaction_sigops;
use crate::chainstate::ChainState;
use crate::constants::*;
use crate::economic::max_coinbase_value;
use crate::error::{ConsensusError, Result};
use crate::params::ConsensusParams;
use crate::pow::check_proof_of_work;
use crate::script::{height_push, opcodes::OP_TRUE, push_data};
use crate::serialization::calculate_merkle_root;
use crate::storage::BlockStore;
use crate::types::*;

/// Weight held back for the header and coinbase when filling a template
const COINBASE_RESERVED_WEIGHT: usize = 4000;

/// CreateCoinbase: ℕ × ℤ × 𝕊 × ℕ → 𝒯𝒳
///
/// The script sig is push(height) followed by an 8-byte extra nonce, so it
/// always satisfies the height commitment and the minimum script size.
pub fn create_coinbase(
    height: Natural,
    value: Integer,
    script_pubkey: ByteString,
    extra_nonce: u64,
) -> Transaction {
    let mut script_sig = height_push(height);
    push_data(&mut script_sig, &extra_nonce.to_le_bytes());
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

/// Grind the nonce until the header meets its own target.
/// Returns false if `max_tries` nonces all fail.
pub fn mine_header(header: &mut BlockHeader, params: &ConsensusParams, max_tries: u64) -> bool {
    for _ in 0..max_tries {
        if matches!(check_proof_of_work(header, params), Ok(true)) {
            return true;
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
    false
}

/// A mined block on top of `parent`, one target spacing later and at the
/// parent's difficulty
pub fn build_block(
    parent: &BlockHeader,
    transactions: Vec<Transaction>,
    params: &ConsensusParams,
) -> Result<Block> {
    let timestamp = parent
        .timestamp
        .saturating_add(params.target_spacing.min(u32::MAX as u64) as u32);
    let mut header = BlockHeader {
        version: 1,
        prev_block_hash: parent.hash(),
        merkle_root: calculate_merkle_root(&transactions)?,
        timestamp,
        bits: parent.bits,
        nonce: 0,
    };
    if !mine_header(&mut header, params, u32::MAX as u64) {
        return Err(ConsensusError::Unresolvable("nonce space exhausted".into()));
    }
    Ok(Block {
        header,
        transactions,
    })
}

/// Genesis block for a regtest network built from `params`
pub fn regtest_genesis(params: &ConsensusParams) -> Block {
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, b"consensus-engine regtest genesis");
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value: params.initial_subsidy,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    };
    let merkle_root = coinbase.txid();
    let mut header = BlockHeader {
        version: 1,
        prev_block_hash: NULL_HASH,
        merkle_root,
        timestamp: 1_600_000_000,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    mine_header(&mut header, params, u32::MAX as u64);
    Block {
        header,
        transactions: vec![coinbase],
    }
}

/// Unmined block built on the current tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    /// Coinbase first, then selected pool transactions parents-first
    pub transactions: Vec<Transaction>,
    pub fees: Integer,
    pub height: Natural,
}

impl BlockTemplate {
    pub fn into_block(self) -> Block {
        Block {
            header: self.header,
            transactions: self.transactions,
        }
    }

    /// Grind the nonce; `None` if `max_tries` was not enough
    pub fn mine(mut self, params: &ConsensusParams, max_tries: u64) -> Option<Block> {
        mine_header(&mut self.header, params, max_tries).then(|| self.into_block())
    }
}

/// CreateBlockTemplate: ChainState × 𝕊 × ℕ → BlockTemplate
///
/// 1. Pool entries are taken by descending fee-rate; an entry is only
///    taken once every in-pool parent has been, so blocks stay ordered
/// 2. Selection stops adding entries that would exceed the weight or
///    sigop limit
/// 3. The coinbase claims GetBlockSubsidy(height) + fees
/// 4. The timestamp is raised above the median time past if needed
pub fn create_block_template<S: BlockStore>(
    chain: &ChainState<S>,
    script_pubkey: &[u8],
    timestamp: u32,
) -> Result<BlockTemplate> {
    let params = chain.params();
    let ctx = chain.next_block_context();
    let tip = chain.tip();

    let mut pool = chain.mempool_snapshot();
    pool.sort_by(|a, b| {
        b.fee_rate_per_kb()
            .cmp(&a.fee_rate_per_kb())
            .then(a.sequence.cmp(&b.sequence))
    });

    let mut selected: Vec<Transaction> = Vec::new();
    let mut included: HashSet<Hash> = HashSet::new();
    let mut weight = COINBASE_RESERVED_WEIGHT;
    let mut sigops = 0;
    let mut fees: Integer = 0;

    loop {
        let mut progress = false;
        for entry in &pool {
            if included.contains(&entry.txid)
                || !entry.parents.iter().all(|p| included.contains(p))
            {
                continue;
            }
            let tx_weight = entry.size.saturating_mul(WITNESS_SCALE_FACTOR);
            let tx_sigops = transaction_sigops(&entry.tx);
            if weight + tx_weight > params.max_block_weight
                || sigops + tx_sigops > params.max_block_sigops
            {
                continue;
            }
            weight += tx_weight;
            sigops += tx_sigops;
            fees = fees.checked_add(entry.fee).ok_or_else(|| {
                ConsensusError::ContextuallyInvalid("template fees overflow".into())
            })?;
            included.insert(entry.txid);
            selected.push(entry.tx.clone());
            progress = true;
        }
        if !progress {
            break;
        }
    }

    let value = max_coinbase_value(ctx.height, fees, params);
    let coinbase = create_coinbase(ctx.height, value, script_pubkey.to_vec(), 0);
    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selected);

    let header = BlockHeader {
        version: 1,
        prev_block_hash: tip.hash,
        merkle_root: calculate_merkle_root(&transactions)?,
        timestamp: timestamp.max(ctx.median_time_past.saturating_add(1)),
        bits: ctx.expected_bits,
        nonce: 0,
    };
    Ok(BlockTemplate {
        header,
        transactions,
        fees,
        height: ctx.height,
    })
}
