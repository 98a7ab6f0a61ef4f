//! Integration tests for the validation engine: fork choice, reorgs,
//! invalid branches, orphans and halting

mod common;

use common::*;
use consensus_engine::block_index::BlockStatus;
use consensus_engine::chainstate::AcceptResult;
use consensus_engine::events::{ChainEvent, RemovalReason};
use consensus_engine::mining::mine_header;
use consensus_engine::params::EngineConfig;
use consensus_engine::serialization::serialize_headers;
use consensus_engine::*;

// ============================================================================
// Extension and queries
// ============================================================================

#[test]
fn test_extend_active_chain() {
    let t = new_chain();
    let events = t.chain.subscribe();
    let blocks = t.extend(&t.genesis, 0, 3, 0);

    let tip = t.chain.tip();
    assert_eq!(tip.hash, blocks[2].hash());
    assert_eq!(tip.height, 3);
    assert_eq!(t.chain.block_by_height(2).unwrap(), Some(blocks[1].clone()));
    assert_eq!(t.chain.block_by_hash(&blocks[0].hash()).unwrap(), Some(blocks[0].clone()));
    assert_eq!(t.chain.header_status(&blocks[2].hash()), Some(BlockStatus::ValidChain));
    assert_eq!(t.chain.locator()[0], blocks[2].hash());
    assert_eq!(*t.chain.locator().last().unwrap(), t.genesis.hash());

    // coinbase outputs enter the set, genesis outputs do not
    assert!(t.chain.get_utxo(&coinbase_out(&blocks[0])).is_some());
    assert!(t.chain.get_utxo(&coinbase_out(&t.genesis)).is_none());

    let new_tips: Vec<ChainEvent> = events
        .try_iter()
        .filter(|e| matches!(e, ChainEvent::NewTip { .. }))
        .collect();
    assert_eq!(new_tips.len(), 3);
    assert_eq!(
        new_tips[2],
        ChainEvent::NewTip {
            hash: blocks[2].hash(),
            height: 3
        }
    );
}

#[test]
fn test_more_work_wins_and_equal_work_keeps_first() {
    let t = new_chain();
    let main = t.extend(&t.genesis, 0, 2, 1);

    let side1 = t.block_on(&t.genesis, 1, 2, vec![]);
    let side2 = t.block_on(&side1, 2, 2, vec![]);
    assert!(matches!(t.submit(&side1).unwrap(), AcceptResult::SideBranch { .. }));
    assert!(matches!(t.submit(&side2).unwrap(), AcceptResult::SideBranch { .. }));
    assert_eq!(t.chain.tip().hash, main[1].hash());

    let side3 = t.block_on(&side2, 3, 2, vec![]);
    assert_eq!(
        t.submit(&side3).unwrap(),
        AcceptResult::Connected {
            hash: side3.hash(),
            height: 3
        }
    );
    assert_eq!(t.chain.tip().hash, side3.hash());
    assert!(!t.chain.is_on_active_chain(&main[0].hash()));
    assert_eq!(t.chain.block_by_height(1).unwrap(), Some(side1));
}

// ============================================================================
// Reorganization
// ============================================================================

#[test]
fn test_reorg_returns_transactions_to_mempool() {
    let t = new_chain();
    let base = t.extend(&t.genesis, 0, 101, 0);
    let fork = base.last().unwrap();
    let funding = coinbase_out(&base[0]);

    let tx = spend(&[funding], 50 * COIN - 10_000, SEQUENCE_FINAL);
    let a = t.block_on(fork, 102, 1, vec![tx.clone()]);
    let a2 = t.block_on(fork, 102, 2, vec![]);
    let b = t.block_on(&a2, 103, 2, vec![]);

    assert!(matches!(t.submit(&a).unwrap(), AcceptResult::Connected { .. }));
    assert!(t.chain.get_utxo(&funding).is_none());
    assert!(t.chain.get_utxo(&OutPoint::new(tx.txid(), 0)).is_some());

    let events = t.chain.subscribe();
    assert!(matches!(t.submit(&a2).unwrap(), AcceptResult::SideBranch { .. }));
    assert_eq!(
        t.submit(&b).unwrap(),
        AcceptResult::Connected {
            hash: b.hash(),
            height: 103
        }
    );

    assert_eq!(t.chain.tip().hash, b.hash());
    assert!(t.chain.get_utxo(&funding).is_some());
    assert!(t.chain.get_utxo(&OutPoint::new(tx.txid(), 0)).is_none());
    assert!(t.chain.mempool_contains(&tx.txid()));

    let events: Vec<ChainEvent> = events.try_iter().collect();
    assert!(events.contains(&ChainEvent::BlockDisconnected {
        hash: a.hash(),
        height: 102
    }));
    assert!(events.contains(&ChainEvent::TransactionAccepted { txid: tx.txid() }));
    assert_eq!(
        events.last(),
        Some(&ChainEvent::NewTip {
            hash: b.hash(),
            height: 103
        })
    );
}

#[test]
fn test_reorg_purges_dependents_of_reverted_spends() {
    let t = new_chain();
    let base = t.extend(&t.genesis, 0, 101, 0);
    let fork = base.last().unwrap();
    let funding = coinbase_out(&base[0]);

    let tx = spend(&[funding], 50 * COIN - 10_000, SEQUENCE_FINAL);
    let a = t.block_on(fork, 102, 1, vec![tx.clone()]);
    t.submit(&a).unwrap();

    let child = spend(&[OutPoint::new(tx.txid(), 0)], 50 * COIN - 20_000, SEQUENCE_FINAL);
    t.chain.accept_transaction(child.clone()).unwrap();

    let double = spend(&[funding], 50 * COIN - 30_000, SEQUENCE_FINAL);
    let a2 = t.block_on(fork, 102, 2, vec![double]);
    let b = t.block_on(&a2, 103, 2, vec![]);
    t.submit(&a2).unwrap();

    let events = t.chain.subscribe();
    t.submit(&b).unwrap();

    assert_eq!(t.chain.tip().hash, b.hash());
    assert!(!t.chain.mempool_contains(&tx.txid()));
    assert!(!t.chain.mempool_contains(&child.txid()));
    assert!(events.try_iter().any(|e| e
        == ChainEvent::TransactionRemoved {
            txid: child.txid(),
            reason: RemovalReason::Reorg
        }));
}

#[test]
fn test_reorg_over_block_with_chained_spend() {
    let t = new_chain();
    let base = t.extend(&t.genesis, 0, 101, 0);
    let fork = base.last().unwrap();
    let funding = coinbase_out(&base[0]);

    let parent = spend(&[funding], 50 * COIN - 10_000, SEQUENCE_FINAL);
    let child = spend(&[OutPoint::new(parent.txid(), 0)], 50 * COIN - 20_000, SEQUENCE_FINAL);
    let a = t.block_on(fork, 102, 1, vec![parent.clone(), child.clone()]);
    assert!(matches!(t.submit(&a).unwrap(), AcceptResult::Connected { .. }));
    assert!(t.chain.get_utxo(&OutPoint::new(parent.txid(), 0)).is_none());

    let a2 = t.block_on(fork, 102, 2, vec![]);
    let b = t.block_on(&a2, 103, 2, vec![]);
    t.submit(&a2).unwrap();
    assert!(matches!(t.submit(&b).unwrap(), AcceptResult::Connected { .. }));
    assert_eq!(t.chain.tip().hash, b.hash());
    assert!(!t.chain.is_halted());
    assert!(t.chain.get_utxo(&funding).is_some());
    assert!(t.chain.get_utxo(&OutPoint::new(parent.txid(), 0)).is_none());
    assert!(t.chain.get_utxo(&OutPoint::new(child.txid(), 0)).is_none());
    assert!(t.chain.mempool_contains(&parent.txid()));
    assert!(t.chain.mempool_contains(&child.txid()));

    // replaying the winning branch alone lands on the same set
    let fresh = new_chain();
    fresh.extend(&fresh.genesis, 0, 101, 0);
    fresh.submit(&a2).unwrap();
    fresh.submit(&b).unwrap();
    assert_eq!(fresh.chain.tip().hash, b.hash());
    assert_eq!(fresh.chain.utxo_commitment(), t.chain.utxo_commitment());
}

#[test]
fn test_invalid_branch_falls_back_to_previous_tip() {
    let t = new_chain();
    let main = t.extend(&t.genesis, 0, 2, 1);
    let before = t.chain.utxo_commitment();

    let b1 = t.block_on(&t.genesis, 1, 2, vec![]);
    let b2 = t.block_paying(&b1, 2, 2, 50 * COIN + 1, vec![]);
    let b3 = t.block_on(&b2, 3, 2, vec![]);
    assert!(matches!(t.submit(&b1).unwrap(), AcceptResult::SideBranch { .. }));
    assert!(matches!(t.submit(&b2).unwrap(), AcceptResult::SideBranch { .. }));

    let events = t.chain.subscribe();
    let err = t.submit(&b3).unwrap_err();
    assert!(matches!(err, ConsensusError::ContextuallyInvalid(_)));
    assert!(err.reason().contains("reorg aborted"));

    assert_eq!(t.chain.tip().hash, main[1].hash());
    assert_eq!(t.chain.utxo_commitment(), before);
    assert_eq!(t.chain.header_status(&b2.hash()), Some(BlockStatus::Invalid));
    assert_eq!(t.chain.header_status(&b3.hash()), Some(BlockStatus::InvalidChild));
    assert!(!t.chain.header_status(&b1.hash()).unwrap().is_invalid());

    let abort = t.chain.last_reorg_abort().unwrap();
    assert_eq!(abort.failed_block, b2.hash());
    assert_eq!(abort.failed_height, 2);
    assert_eq!(abort.stable_tip, main[1].hash());
    assert_eq!(abort.stable_height, 2);

    // the tip ends where it started, so no new tip is announced
    assert!(!events
        .try_iter()
        .any(|e| matches!(e, ChainEvent::NewTip { .. })));
}

// ============================================================================
// Rejections
// ============================================================================

#[test]
fn test_coinbase_overclaim_rejected_without_state_change() {
    let t = new_chain();
    let a = t.extend(&t.genesis, 0, 1, 0);
    let before = t.chain.utxo_commitment();

    let bad = t.block_paying(&a[0], 2, 0, 50 * COIN + 1, vec![]);
    let err = t.submit(&bad).unwrap_err();
    assert!(matches!(err, ConsensusError::ContextuallyInvalid(_)));
    assert!(err.should_penalize_peer());
    assert_eq!(t.chain.tip().hash, a[0].hash());
    assert_eq!(t.chain.utxo_commitment(), before);
    assert_eq!(t.chain.header_status(&bad.hash()), Some(BlockStatus::Invalid));
    assert_eq!(t.chain.last_reorg_abort().unwrap().failed_block, bad.hash());

    // resubmission and descendants are refused without revalidation
    assert!(matches!(t.submit(&bad), Err(ConsensusError::ContextuallyInvalid(_))));
    let child = t.block_on(&bad, 3, 0, vec![]);
    assert!(matches!(t.submit(&child), Err(ConsensusError::ContextuallyInvalid(_))));
    assert_eq!(t.chain.header_status(&child.hash()), Some(BlockStatus::InvalidChild));
}

#[test]
fn test_malformed_block_does_not_poison_header() {
    let t = new_chain();
    let good = t.block_on(&t.genesis, 1, 0, vec![]);
    let mut bad = good.clone();
    bad.transactions[0].outputs[0].value = 1;

    let err = t.submit(&bad).unwrap_err();
    assert!(err.is_malformed());
    assert_eq!(t.chain.header_status(&good.hash()), None);

    assert!(matches!(t.submit(&good).unwrap(), AcceptResult::Connected { .. }));
}

#[test]
fn test_future_block_accepted_once_clock_catches_up() {
    let t = new_chain();
    let mut block = t.block_on(&t.genesis, 1, 0, vec![]);
    block.header.timestamp = (NOW + 3 * 60 * 60) as u32;
    assert!(mine_header(&mut block.header, &t.params, u32::MAX as u64));

    let err = t.submit(&block).unwrap_err();
    assert!(matches!(err, ConsensusError::Unresolvable(_)));
    assert!(!err.should_penalize_peer());
    assert_eq!(t.chain.header_status(&block.hash()), None);

    t.clock.advance(2 * 60 * 60);
    assert!(matches!(t.submit(&block).unwrap(), AcceptResult::Connected { .. }));
}

// ============================================================================
// Orphans and headers
// ============================================================================

#[test]
fn test_orphans_connect_when_parent_arrives() {
    let t = new_chain();
    let a = t.block_on(&t.genesis, 1, 0, vec![]);
    let b = t.block_on(&a, 2, 0, vec![]);
    let c = t.block_on(&b, 3, 0, vec![]);

    assert_eq!(
        t.submit(&c).unwrap(),
        AcceptResult::Orphan {
            hash: c.hash(),
            missing_parent: b.hash()
        }
    );
    assert!(matches!(t.submit(&b).unwrap(), AcceptResult::Orphan { .. }));
    assert_eq!(t.chain.orphan_count(), 2);

    assert!(matches!(t.submit(&a).unwrap(), AcceptResult::Connected { .. }));
    assert_eq!(t.chain.orphan_count(), 0);
    assert_eq!(t.chain.tip().hash, c.hash());
}

#[test]
fn test_orphans_expire() {
    let t = new_chain();
    let a = t.block_on(&t.genesis, 1, 0, vec![]);
    let b = t.block_on(&a, 2, 0, vec![]);
    t.submit(&b).unwrap();
    assert_eq!(t.chain.orphan_count(), 1);

    t.clock.advance(EngineConfig::default().orphan_expiry_secs + 1);
    t.submit(&a).unwrap();
    assert_eq!(t.chain.orphan_count(), 0);
    assert_eq!(t.chain.tip().hash, a.hash());
}

#[test]
fn test_headers_first_then_blocks() {
    let t = new_chain();
    let a = t.block_on(&t.genesis, 1, 0, vec![]);
    let b = t.block_on(&a, 2, 0, vec![]);

    let added = t
        .chain
        .submit_headers(&serialize_headers(&[a.header.clone(), b.header.clone()]))
        .unwrap();
    assert_eq!(added, 2);
    assert_eq!(t.chain.header_status(&b.hash()), Some(BlockStatus::HeaderOnly));
    assert_eq!(t.chain.tip().hash, t.genesis.hash());
    assert_eq!(t.chain.accept_headers(&[a.header.clone()]).unwrap(), 0);

    assert_eq!(
        t.submit(&b).unwrap(),
        AcceptResult::SideBranch {
            hash: b.hash(),
            height: 2
        }
    );
    assert!(matches!(t.submit(&a).unwrap(), AcceptResult::Connected { .. }));
    assert_eq!(t.chain.tip().hash, b.hash());
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_replay_in_any_order_reaches_same_state() {
    let producer = new_chain();
    let base = producer.extend(&producer.genesis, 0, 101, 0);
    let fork = base.last().unwrap();
    let tx = spend(&[coinbase_out(&base[0])], 50 * COIN - 10_000, SEQUENCE_FINAL);
    let a = producer.block_on(fork, 102, 1, vec![tx]);
    let a2 = producer.block_on(fork, 102, 2, vec![]);
    let b = producer.block_on(&a2, 103, 2, vec![]);
    for block in [&a, &a2, &b] {
        producer.submit(block).unwrap();
    }

    let replay = new_chain();
    for block in &base {
        replay.submit(block).unwrap();
    }
    for block in [&b, &a, &a2] {
        replay.submit(block).unwrap();
    }

    assert_eq!(replay.chain.tip(), producer.chain.tip());
    assert_eq!(replay.chain.utxo_commitment(), producer.chain.utxo_commitment());
    assert_eq!(replay.chain.utxo_snapshot(), producer.chain.utxo_snapshot());
    assert_eq!(
        producer.chain.utxo_snapshot().recompute_commitment(),
        producer.chain.utxo_commitment()
    );
}

// ============================================================================
// Halting and concurrency
// ============================================================================

#[test]
fn test_missing_undo_halts_engine() {
    let t = TestChain::with_store(EngineConfig::default(), LossyStore::default());
    let a = t.extend(&t.genesis, 0, 1, 1);
    let a2 = t.block_on(&t.genesis, 1, 2, vec![]);
    let b = t.block_on(&a2, 2, 2, vec![]);
    t.submit(&a2).unwrap();

    t.chain.store().lose_undo();
    let err = t.submit(&b).unwrap_err();
    assert!(err.is_fatal());
    assert!(t.chain.is_halted());

    // reads keep working, writes are refused
    assert_eq!(t.chain.tip().hash, a[0].hash());
    let next = t.block_on(&a[0], 2, 1, vec![]);
    assert!(t.submit(&next).unwrap_err().is_fatal());
    let tx = spend(&[coinbase_out(&a[0])], 1, SEQUENCE_FINAL);
    assert!(t.chain.accept_transaction(tx).unwrap_err().is_fatal());
}

#[test]
fn test_tip_readable_during_block_processing() {
    let t = new_chain();
    let mut blocks = Vec::new();
    let mut parent = t.genesis.clone();
    for height in 1..=20 {
        let block = t.block_on(&parent, height, 0, vec![]);
        parent = block.clone();
        blocks.push(block);
    }

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut last = 0;
            while last < 20 {
                let tip = t.chain.tip();
                assert!(tip.height >= last);
                last = tip.height;
                std::thread::yield_now();
            }
        });
        for block in &blocks {
            t.submit(block).unwrap();
        }
        reader.join().unwrap();
    });
    assert_eq!(t.chain.tip().height, 20);
}
