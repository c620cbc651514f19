//! Reorg flows: the disconnected-block buffer, post-replay aggregate
//! repair, and tip re-validation.

use super::*;
use crate::coins_view::CoinsViewCache;
use crate::{DisconnectedBlockTransactions, MemPoolOptions, RemovalReason};
use bitcoin::SignedAmount;
use std::sync::Mutex;

#[test]
fn reorg_replay_repairs_descendant_state() {
    let pool = MemPool::new(MemPoolOptions::default());

    let t1 = simple_tx(funding_outpoint(50, 0), 90_000);
    let t2 = simple_tx(spend(&t1, 0), 80_000);

    let mut buffer = DisconnectedBlockTransactions::new();
    buffer.add_for_block(&[t1.clone(), t2.clone()]);
    assert_eq!(buffer.len(), 2);

    // Replay the buffer child-first, the order that leaves the link table
    // incomplete: t2's admission cannot see t1.
    for (_, tx) in buffer.iter() {
        let t = if tx.compute_txid() == t1.compute_txid() { 10 } else { 11 };
        pool.add_unchecked(entry(tx, 1000, t));
    }
    buffer.clear();

    {
        let inner = pool.inner.read().unwrap();
        let e1 = inner.get_entry(&t1.compute_txid()).unwrap();
        assert_eq!(e1.count_with_descendants(), 1);
        assert!(e1.children.is_empty());
    }

    // The replay pass discovers t2 through the spender map and repairs both
    // directions.
    pool.update_transactions_from_block(&[t1.compute_txid()]);

    {
        let inner = pool.inner.read().unwrap();
        let e1 = inner.get_entry(&t1.compute_txid()).unwrap();
        let e2 = inner.get_entry(&t2.compute_txid()).unwrap();
        assert_eq!(e1.count_with_descendants(), 2);
        assert_eq!(e1.mod_fees_with_descendants(), SignedAmount::from_sat(2000));
        assert_eq!(e1.size_with_descendants(), e1.tx_size() + e2.tx_size());
        assert_eq!(e1.children.len(), 1);
        assert_eq!(e2.count_with_ancestors(), 2);
        assert_eq!(e2.mod_fees_with_ancestors(), SignedAmount::from_sat(2000));
        assert_eq!(e2.parents.len(), 1);
    }
    check_pool(&pool);
}

#[test]
fn reorg_replay_in_block_order_needs_no_repair() {
    let pool = MemPool::new(MemPoolOptions::default());

    let t1 = simple_tx(funding_outpoint(51, 0), 90_000);
    let t2 = simple_tx(spend(&t1, 0), 80_000);

    let mut buffer = DisconnectedBlockTransactions::new();
    buffer.add_for_block(&[t1.clone(), t2.clone()]);

    // Reverse insertion order is block order: parents first.
    let mut replayed = Vec::new();
    for (_, tx) in buffer.iter().rev() {
        pool.add_unchecked(entry(tx, 1000, 10));
        replayed.push(tx.compute_txid());
    }
    buffer.clear();
    assert_eq!(replayed, vec![t1.compute_txid(), t2.compute_txid()]);

    // Every replayed id is excluded, so this must change nothing.
    pool.update_transactions_from_block(&replayed);

    let inner = pool.inner.read().unwrap();
    let e1 = inner.get_entry(&t1.compute_txid()).unwrap();
    assert_eq!(e1.count_with_descendants(), 2);
    assert_eq!(e1.mod_fees_with_descendants(), SignedAmount::from_sat(2000));
    drop(inner);
    check_pool(&pool);
}

#[test]
fn reorg_replay_updates_grandchildren() {
    let pool = MemPool::new(MemPoolOptions::default());

    let t1 = simple_tx(funding_outpoint(52, 0), 90_000);
    let t2 = simple_tx(spend(&t1, 0), 80_000);
    let t3 = simple_tx(spend(&t2, 0), 70_000);

    // t2 and t3 were already in the pool (t3 admitted normally on top of
    // t2); t1 comes back from a disconnected block.
    pool.add_unchecked(entry(&t2, 1000, 10));
    pool.add_unchecked(entry(&t3, 1000, 11));
    pool.add_unchecked(entry(&t1, 1000, 12));

    pool.update_transactions_from_block(&[t1.compute_txid()]);

    let inner = pool.inner.read().unwrap();
    let e1 = inner.get_entry(&t1.compute_txid()).unwrap();
    let e2 = inner.get_entry(&t2.compute_txid()).unwrap();
    let e3 = inner.get_entry(&t3.compute_txid()).unwrap();
    assert_eq!(e1.count_with_descendants(), 3);
    assert_eq!(e1.mod_fees_with_descendants(), SignedAmount::from_sat(3000));
    assert_eq!(e2.count_with_ancestors(), 2);
    assert_eq!(e3.count_with_ancestors(), 3);
    assert_eq!(e3.mod_fees_with_ancestors(), SignedAmount::from_sat(3000));
    drop(inner);
    check_pool(&pool);
}

#[test]
fn remove_for_reorg_drops_unminable_entries() {
    let pool = MemPool::new(MemPoolOptions::default());
    let reasons: Arc<Mutex<Vec<(Txid, &'static str)>>> = Arc::default();
    {
        let reasons = reasons.clone();
        pool.on_entry_removed(move |tx, reason| {
            reasons.lock().unwrap().push((tx.compute_txid(), reason.as_str()))
        });
    }

    let mut chain = MockChain::at(100, 1_000_000);
    chain.active.insert(chain.ancestor_hash(70).unwrap());

    // Valid entry: no lock constraints, ordinary funding.
    let plain = simple_tx(funding_outpoint(53, 0), 90_000);
    pool.add_unchecked(entry(&plain, 1000, 10));

    // Height-locked beyond the new tip. Its recorded input block is still
    // on the active chain, so the cached lock points are reused as-is and
    // fail the evaluation.
    let locked = simple_tx(funding_outpoint(54, 0), 90_000);
    pool.add_unchecked(entry_with(
        &locked,
        1000,
        11,
        false,
        crate::LockPoints {
            height: 500,
            time: 0,
            max_input_block: chain.ancestor_hash(70),
        },
    ));
    // Its child goes with it.
    let locked_child = simple_tx(spend(&locked, 0), 80_000);
    pool.add_unchecked(entry(&locked_child, 1000, 12));

    // Coinbase spend that is no longer mature at the new tip.
    let immature = simple_tx(funding_outpoint(55, 0), 90_000);
    pool.add_unchecked(entry_with(
        &immature,
        1000,
        13,
        true,
        crate::LockPoints::default(),
    ));

    let mut base = MockCoinView::new();
    base.add_coin(funding_outpoint(55, 0), coin_at(95, 0, true));
    let mut coins = CoinsViewCache::new(base, 16);

    pool.remove_for_reorg(&mut coins, &chain);

    assert_in_mempool(&pool, &plain.compute_txid());
    assert_not_in_mempool(&pool, &locked.compute_txid());
    assert_not_in_mempool(&pool, &locked_child.compute_txid());
    assert_not_in_mempool(&pool, &immature.compute_txid());

    let reasons = reasons.lock().unwrap();
    assert_eq!(reasons.len(), 3);
    assert!(reasons.iter().all(|(_, reason)| *reason == "reorg"));
    check_pool(&pool);
}

#[test]
fn remove_for_reorg_refreshes_stale_lock_points() {
    let pool = MemPool::new(MemPoolOptions::default());
    let chain = MockChain::at(100, 1_000_000);

    // Lock points recorded against a block the new chain does not contain,
    // but the transaction itself has no active sequence locks: the
    // recomputation succeeds and is stored back.
    let tx = simple_tx(funding_outpoint(56, 0), 90_000);
    let txid = tx.compute_txid();
    pool.add_unchecked(entry_with(
        &tx,
        1000,
        10,
        false,
        crate::LockPoints {
            height: 0,
            time: 0,
            max_input_block: Some(bitcoin::BlockHash::from_byte_array([0xEE; 32])),
        },
    ));

    let mut coins = CoinsViewCache::new(MockCoinView::new(), 16);
    pool.remove_for_reorg(&mut coins, &chain);

    assert_in_mempool(&pool, &txid);
    let inner = pool.inner.read().unwrap();
    let lp = inner.get_entry(&txid).unwrap().lock_points().clone();
    // Refreshed: now anchored to the funding coin's block on the new chain.
    assert_eq!(lp.max_input_block, chain.ancestor_hash(1));
    assert_eq!(lp.height, 0);
}

#[test]
fn remove_recursive_sweeps_children_of_an_absent_parent() {
    let pool = MemPool::new(MemPoolOptions::default());

    // The parent was never re-accepted after a reorg, but its child made it
    // into the pool.
    let parent = simple_tx(funding_outpoint(57, 0), 90_000);
    let child = simple_tx(spend(&parent, 0), 80_000);
    let grandchild = simple_tx(spend(&child, 0), 70_000);
    pool.add_unchecked(entry(&child, 1000, 10));
    pool.add_unchecked(entry(&grandchild, 1000, 11));

    pool.remove_recursive(&parent, RemovalReason::Reorg);

    assert_mempool_size(&pool, 0);
    check_pool(&pool);
}

#[test]
fn disconnected_buffer_survives_multi_block_reorg() {
    let mut buffer = DisconnectedBlockTransactions::new();

    // Two blocks disconnect, newest first; each holds a parent-child pair.
    let new_parent = simple_tx(funding_outpoint(58, 0), 90_000);
    let new_child = simple_tx(spend(&new_parent, 0), 80_000);
    let old_parent = simple_tx(funding_outpoint(59, 0), 90_000);
    let old_child = simple_tx(spend(&old_parent, 0), 80_000);

    buffer.add_for_block(&[new_parent.clone(), new_child.clone()]);
    buffer.add_for_block(&[old_parent.clone(), old_child.clone()]);

    // Reverse insertion order yields the oldest block first, parents before
    // children within each block.
    let replay: Vec<Txid> = buffer
        .iter()
        .rev()
        .map(|(_, tx)| tx.compute_txid())
        .collect();
    assert_eq!(
        replay,
        vec![
            old_parent.compute_txid(),
            old_child.compute_txid(),
            new_parent.compute_txid(),
            new_child.compute_txid(),
        ]
    );

    // The new chain reconfirms one of them; it must not be replayed.
    buffer.remove_for_block(&[old_parent.clone()]);
    assert!(!buffer.contains(&old_parent.compute_txid()));
    assert_eq!(buffer.len(), 3);

    buffer.clear();
    assert_eq!(buffer.dynamic_memory_usage(), 0);
}
