//! Integration tests for mempool admission through the chain state, and
//! for block templates built from the pool

mod common;

use common::*;
use consensus_engine::chainstate::AcceptResult;
use consensus_engine::events::{ChainEvent, RemovalReason};
use consensus_engine::mining::{build_block, create_block_template, create_coinbase};
use consensus_engine::serialization::serialize_transaction;
use consensus_engine::storage::MemoryBlockStore;
use consensus_engine::*;
use secp256k1::SecretKey;

const RBF_SEQUENCE: u32 = 0xffff_fffd;

/// Chain of 101 blocks whose first coinbase pays `key`; returns the blocks
/// and the now-mature key-owned outpoint
fn funded_chain(key: &SecretKey) -> (TestChain<MemoryBlockStore>, Vec<Block>, OutPoint) {
    let t = new_chain();
    let first = build_block(
        &t.genesis.header,
        vec![create_coinbase(1, 50 * COIN, p2pkh_for(key), 0)],
        &t.params,
    )
    .unwrap();
    t.submit(&first).unwrap();
    let funding = coinbase_out(&first);
    let mut blocks = vec![first.clone()];
    blocks.extend(t.extend(&first, 1, 100, 0));
    (t, blocks, funding)
}

fn signed_spend(key: &SecretKey, prevout: OutPoint, value: Integer, sequence: u32) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout,
            script_sig: vec![],
            sequence,
        }],
        outputs: vec![TransactionOutput {
            value,
            script_pubkey: p2pkh_for(key),
        }],
        lock_time: 0,
    };
    sign_p2pkh(&mut tx, key);
    tx
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn test_signed_spend_accepted_and_announced() {
    let key = secret_key(0x11);
    let (t, _, funding) = funded_chain(&key);
    let events = t.chain.subscribe();

    let tx = signed_spend(&key, funding, 50 * COIN - 10_000, SEQUENCE_FINAL);
    let result = t.chain.submit_transaction(&serialize_transaction(&tx)).unwrap();
    assert_eq!(
        result,
        AcceptResult::InMempool {
            txid: tx.txid(),
            fee: 10_000,
            replaced: vec![]
        }
    );
    assert!(t.chain.mempool_contains(&tx.txid()));
    assert_eq!(
        events.try_recv(),
        Ok(ChainEvent::TransactionAccepted { txid: tx.txid() })
    );

    let err = t.chain.accept_transaction(tx).unwrap_err();
    assert!(matches!(err, ConsensusError::Policy(_)));
    assert!(!err.should_penalize_peer());
}

#[test]
fn test_wrong_key_rejected() {
    let key = secret_key(0x11);
    let (t, _, funding) = funded_chain(&key);

    let mut tx = signed_spend(&key, funding, 50 * COIN - 10_000, SEQUENCE_FINAL);
    let thief = secret_key(0x22);
    let sig = consensus_engine::sighash::sign_input(
        &thief,
        &tx,
        0,
        &p2pkh_for(&key),
        consensus_engine::sighash::SIGHASH_ALL,
    );
    let mut script_sig = Vec::new();
    consensus_engine::script::push_data(&mut script_sig, &sig);
    consensus_engine::script::push_data(&mut script_sig, &pubkey_bytes(&key));
    tx.inputs[0].script_sig = script_sig;

    let err = t.chain.accept_transaction(tx.clone()).unwrap_err();
    assert!(matches!(err, ConsensusError::ContextuallyInvalid(_)));
    assert!(!t.chain.mempool_contains(&tx.txid()));
}

#[test]
fn test_missing_input_is_not_penalized() {
    let t = new_chain();
    let tx = spend(&[OutPoint::new([7; 32], 0)], 1000, SEQUENCE_FINAL);
    let err = t.chain.accept_transaction(tx).unwrap_err();
    assert!(matches!(err, ConsensusError::Unresolvable(_)));
    assert!(!err.should_penalize_peer());
}

#[test]
fn test_immature_coinbase_rejected() {
    let t = new_chain();
    let blocks = t.extend(&t.genesis, 0, 50, 0);
    let tx = spend(&[coinbase_out(&blocks[0])], 50 * COIN - 10_000, SEQUENCE_FINAL);
    assert!(matches!(
        t.chain.accept_transaction(tx),
        Err(ConsensusError::ContextuallyInvalid(_))
    ));
}

#[test]
fn test_below_min_fee_rejected() {
    let key = secret_key(0x11);
    let (t, _, funding) = funded_chain(&key);
    let tx = signed_spend(&key, funding, 50 * COIN - 1, SEQUENCE_FINAL);
    let err = t.chain.accept_transaction(tx).unwrap_err();
    assert!(err.reason().contains("below minimum relay fee"));
}

// ============================================================================
// Conflicts and replacement
// ============================================================================

#[test]
fn test_replace_by_fee() {
    let key = secret_key(0x11);
    let (t, _, funding) = funded_chain(&key);

    let original = signed_spend(&key, funding, 50 * COIN - 10_000, RBF_SEQUENCE);
    t.chain.accept_transaction(original.clone()).unwrap();

    let stingy = signed_spend(&key, funding, 50 * COIN - 10_100, RBF_SEQUENCE);
    assert!(t.chain.accept_transaction(stingy).is_err());
    assert!(t.chain.mempool_contains(&original.txid()));

    let events = t.chain.subscribe();
    let bump = signed_spend(&key, funding, 50 * COIN - 50_000, RBF_SEQUENCE);
    let result = t.chain.accept_transaction(bump.clone()).unwrap();
    assert_eq!(
        result,
        AcceptResult::InMempool {
            txid: bump.txid(),
            fee: 50_000,
            replaced: vec![original.txid()]
        }
    );
    assert!(!t.chain.mempool_contains(&original.txid()));
    assert!(events.try_iter().any(|e| e
        == ChainEvent::TransactionRemoved {
            txid: original.txid(),
            reason: RemovalReason::Replaced
        }));
}

#[test]
fn test_conflict_without_signal_rejected() {
    let key = secret_key(0x11);
    let (t, _, funding) = funded_chain(&key);

    let original = signed_spend(&key, funding, 50 * COIN - 10_000, SEQUENCE_FINAL);
    t.chain.accept_transaction(original.clone()).unwrap();
    let double = signed_spend(&key, funding, 50 * COIN - 500_000, SEQUENCE_FINAL);
    let err = t.chain.accept_transaction(double).unwrap_err();
    assert!(err.reason().contains("not replaceable"));
    assert!(t.chain.mempool_contains(&original.txid()));
}

#[test]
fn test_block_purges_conflicting_pool_entries() {
    let t = new_chain();
    let base = t.extend(&t.genesis, 0, 101, 0);
    let funding = coinbase_out(&base[0]);

    let pooled = spend(&[funding], 50 * COIN - 10_000, SEQUENCE_FINAL);
    let child = spend(&[OutPoint::new(pooled.txid(), 0)], 50 * COIN - 20_000, SEQUENCE_FINAL);
    t.chain.accept_transaction(pooled.clone()).unwrap();
    t.chain.accept_transaction(child.clone()).unwrap();

    let mined = spend(&[funding], 50 * COIN - 30_000, SEQUENCE_FINAL);
    let block = t.block_on(base.last().unwrap(), 102, 0, vec![mined]);
    let events = t.chain.subscribe();
    assert!(matches!(t.submit(&block).unwrap(), AcceptResult::Connected { .. }));

    assert!(t.chain.mempool_snapshot().is_empty());
    let removed: Vec<Hash> = events
        .try_iter()
        .filter_map(|e| match e {
            ChainEvent::TransactionRemoved {
                txid,
                reason: RemovalReason::Conflict,
            } => Some(txid),
            _ => None,
        })
        .collect();
    assert!(removed.contains(&pooled.txid()));
    assert!(removed.contains(&child.txid()));
}

// ============================================================================
// Templates
// ============================================================================

#[test]
fn test_template_orders_parents_first_and_claims_fees() {
    let t = new_chain();
    let base = t.extend(&t.genesis, 0, 102, 0);

    let parent = spend(&[coinbase_out(&base[0])], 50 * COIN - 10_000, SEQUENCE_FINAL);
    let child = spend(&[OutPoint::new(parent.txid(), 0)], 50 * COIN - 50_000, SEQUENCE_FINAL);
    let other = spend(&[coinbase_out(&base[1])], 50 * COIN - 20_000, SEQUENCE_FINAL);
    for tx in [&parent, &child, &other] {
        t.chain.accept_transaction(tx.clone()).unwrap();
    }

    let tip = t.chain.tip();
    let template = create_block_template(&t.chain, &[0x51], tip.timestamp + 600).unwrap();
    assert_eq!(template.height, 103);
    assert_eq!(template.fees, 70_000);
    assert_eq!(template.transactions.len(), 4);
    assert_eq!(template.transactions[0].outputs[0].value, 50 * COIN + 70_000);

    let position = |txid: Hash| {
        template
            .transactions
            .iter()
            .position(|tx| tx.txid() == txid)
            .unwrap()
    };
    assert!(position(parent.txid()) < position(child.txid()));

    let block = template.mine(&t.params, u32::MAX as u64).unwrap();
    assert_eq!(
        t.submit(&block).unwrap(),
        AcceptResult::Connected {
            hash: block.hash(),
            height: 103
        }
    );
    assert!(t.chain.mempool_snapshot().is_empty());
    assert!(t.chain.get_utxo(&OutPoint::new(child.txid(), 0)).is_some());
}
