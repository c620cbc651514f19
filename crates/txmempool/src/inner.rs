//! Pool state behind the critical section, and the aggregate maintenance
//! protocol.
//!
//! Every entry caches aggregates over its in-pool ancestors and descendants
//! so that eviction, mining order and admission control stay sub-linear in
//! the pool size. The price is a strict bookkeeping protocol:
//!
//! - Admission updates every ancestor's descendant aggregates and seeds the
//!   new entry's ancestor aggregates ([`MemPoolInner::add_unchecked`]).
//! - Before any entry is physically removed,
//!   [`MemPoolInner::update_for_remove_from_mempool`] must run over the whole
//!   removal set, while the link table is still intact, so surviving
//!   relatives shed the removed contributions. Removing an entry therefore
//!   always goes through [`MemPoolInner::remove_staged`].
//! - Reorg replay is the one case where a newly added entry can have in-pool
//!   children. The pool is knowingly inconsistent between the re-adds and
//!   [`MemPoolInner::update_transactions_from_block`]; see that method.

use crate::arena::{MemPoolArena, TxMemPoolEntry};
use crate::coins_view::{ChainView, Coin, CoinView, CoinsViewCache};
use crate::error::MempoolError;
use crate::locks::{self, LockPoints, COINBASE_MATURITY};
use crate::memusage;
use crate::options::MemPoolLimits;
use crate::policy::RollingFeeRate;
use crate::types::{
    BlockPolicyEstimator, EntryId, FeeRate, Notifications, RemovalReason, TxMempoolInfo,
};
use bitcoin::{Amount, OutPoint, SignedAmount, Transaction, Txid, Wtxid};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use tracing::debug;

/// Pool state protected by the `MemPool` facade's lock.
pub struct MemPoolInner {
    pub(crate) arena: MemPoolArena,

    /// Spent outpoint -> the entry spending it. Every input of every entry
    /// appears exactly once; this is what excludes in-pool double spends.
    pub(crate) map_next_tx: HashMap<OutPoint, EntryId>,

    /// Persistent priority deltas, applied at admission and kept after
    /// removal.
    pub(crate) map_deltas: HashMap<Txid, SignedAmount>,

    /// All witness hashes, in random order; each entry stores its slot for
    /// O(1) removal.
    pub(crate) txns_randomized: Vec<(Wtxid, EntryId)>,

    /// Transactions not yet announced to peers.
    pub(crate) unbroadcast: HashSet<Txid>,

    /// Sum of all entries' virtual sizes.
    pub(crate) total_tx_size: u64,

    /// Sum of all entries' base fees.
    pub(crate) total_fee: Amount,

    /// Memory attributed to entries and their link sets (not the containers
    /// themselves).
    pub(crate) cached_inner_usage: usize,

    pub(crate) rolling_fee: RollingFeeRate,

    pub(crate) notifications: Notifications,

    estimator: Option<Arc<dyn BlockPolicyEstimator>>,
}

impl MemPoolInner {
    pub(crate) fn new(now: i64, estimator: Option<Arc<dyn BlockPolicyEstimator>>) -> Self {
        Self {
            arena: MemPoolArena::new(),
            map_next_tx: HashMap::new(),
            map_deltas: HashMap::new(),
            txns_randomized: Vec::new(),
            unbroadcast: HashSet::new(),
            total_tx_size: 0,
            total_fee: Amount::ZERO,
            cached_inner_usage: 0,
            rolling_fee: RollingFeeRate::new(now),
            notifications: Notifications::default(),
            estimator,
        }
    }

    // === Queries ===

    pub(crate) fn size(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn total_tx_size(&self) -> u64 {
        self.total_tx_size
    }

    pub(crate) fn total_fee(&self) -> Amount {
        self.total_fee
    }

    pub(crate) fn exists(&self, txid: &Txid) -> bool {
        self.arena.get_by_txid(txid).is_some()
    }

    pub(crate) fn exists_wtxid(&self, wtxid: &Wtxid) -> bool {
        self.arena.get_by_wtxid(wtxid).is_some()
    }

    pub(crate) fn get_entry(&self, txid: &Txid) -> Option<&TxMemPoolEntry> {
        let id = self.arena.get_by_txid(txid)?;
        self.arena.get(id)
    }

    pub(crate) fn get(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.get_entry(txid).map(|entry| entry.tx().clone())
    }

    pub(crate) fn info(&self, txid: &Txid) -> Option<TxMempoolInfo> {
        let entry = self.get_entry(txid)?;
        Some(TxMempoolInfo {
            tx: entry.tx().clone(),
            time: entry.time(),
            fee_rate: FeeRate::from_fee_and_vsize(entry.fee(), entry.tx_size())
                .unwrap_or(FeeRate::ZERO),
            fee_delta: entry.fee_delta(),
        })
    }

    pub(crate) fn info_all(&self) -> Vec<TxMempoolInfo> {
        self.sorted_depth_and_score()
            .into_iter()
            .filter_map(|id| {
                let entry = self.arena.get(id)?;
                self.info(&entry.txid())
            })
            .collect()
    }

    pub(crate) fn query_hashes(&self) -> Vec<Txid> {
        self.sorted_depth_and_score()
            .into_iter()
            .filter_map(|id| self.arena.get(id).map(|entry| entry.txid()))
            .collect()
    }

    /// Entry ids sorted by in-pool depth (ancestor count), then raw-fee
    /// feerate descending. Raw fees keep prioritisation deltas from leaking
    /// through relay ordering.
    fn sorted_depth_and_score(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.arena.iter().map(|(id, _)| id).collect();
        ids.sort_by(|a, b| {
            let ea = self.arena.get(*a).expect("live entry");
            let eb = self.arena.get(*b).expect("live entry");
            ea.count_with_ancestors()
                .cmp(&eb.count_with_ancestors())
                .then_with(|| {
                    let fa = ea.fee().to_sat() as i128 * eb.tx_size() as i128;
                    let fb = eb.fee().to_sat() as i128 * ea.tx_size() as i128;
                    fb.cmp(&fa)
                })
                .then_with(|| ea.txid().cmp(&eb.txid()))
        });
        ids
    }

    /// Orders two ids by their descendant-score index position. False if
    /// either id is absent.
    pub(crate) fn compare_depth_and_score(&self, a: &Txid, b: &Txid) -> bool {
        let (Some(ia), Some(ib)) = (self.arena.get_by_txid(a), self.arena.get_by_txid(b)) else {
            return false;
        };
        let ka = self.arena.get(ia).expect("live entry").descendant_sort_key();
        let kb = self.arena.get(ib).expect("live entry").descendant_sort_key();
        (ka, ia).cmp(&(kb, ib)) == Ordering::Less
    }

    /// Whether none of the transaction's inputs spend a pool entry, i.e. it
    /// can be mined without dragging unconfirmed ancestors along.
    pub(crate) fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.input
            .iter()
            .all(|input| !self.exists(&input.previous_output.txid))
    }

    pub(crate) fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.map_next_tx.contains_key(outpoint)
    }

    pub(crate) fn transaction_within_chain_limit(&self, txid: &Txid, chain_limit: u64) -> bool {
        match self.get_entry(txid) {
            Some(entry) => {
                entry.count_with_descendants() < chain_limit
                    && entry.count_with_ancestors() < chain_limit
            }
            None => true,
        }
    }

    /// Txids with their feerates in mining order.
    pub(crate) fn iter_txids_by_priority(&self) -> Vec<(Txid, FeeRate)> {
        self.arena
            .iter_by_ancestor_score()
            .map(|(_, entry)| {
                (
                    entry.txid(),
                    FeeRate::from_fee_and_vsize(entry.fee(), entry.tx_size())
                        .unwrap_or(FeeRate::ZERO),
                )
            })
            .collect()
    }

    pub(crate) fn pending_broadcast(&self) -> Vec<(Txid, FeeRate)> {
        self.unbroadcast
            .iter()
            .filter_map(|txid| self.info(txid).map(|info| (*txid, info.fee_rate)))
            .collect()
    }

    pub(crate) fn mark_broadcast(&mut self, txids: &[Txid]) {
        for txid in txids {
            self.unbroadcast.remove(txid);
        }
    }

    pub(crate) fn dynamic_memory_usage(&self) -> usize {
        memusage::malloc_usage(mem::size_of::<TxMemPoolEntry>() + 12 * mem::size_of::<usize>())
            * self.arena.len()
            + memusage::hash_map_usage::<OutPoint, EntryId>(self.map_next_tx.len())
            + memusage::hash_map_usage::<Txid, SignedAmount>(self.map_deltas.len())
            + memusage::vec_usage::<(Wtxid, EntryId)>(self.txns_randomized.capacity())
            + self.cached_inner_usage
    }

    pub(crate) fn get_min_fee(
        &mut self,
        size_limit: usize,
        incremental: FeeRate,
        now: i64,
    ) -> FeeRate {
        let usage = self.dynamic_memory_usage();
        self.rolling_fee.get_min_fee(size_limit, usage, incremental, now)
    }

    // === Graph walks ===

    /// All in-pool ancestors of a prospective entry, with limit enforcement.
    ///
    /// With `search_parents` the parent set is seeded from the entry's
    /// inputs (required when the entry is not yet in the pool); otherwise
    /// the link table is used. Limits are checked in expansion order so the
    /// walk stays bounded even on failure.
    pub(crate) fn calculate_mempool_ancestors(
        &self,
        entry: &TxMemPoolEntry,
        limits: &MemPoolLimits,
        search_parents: bool,
    ) -> Result<HashSet<EntryId>, MempoolError> {
        let mut pending: HashSet<EntryId> = HashSet::new();

        if search_parents {
            for input in &entry.tx().input {
                if let Some(pid) = self.arena.get_by_txid(&input.previous_output.txid) {
                    pending.insert(pid);
                    if pending.len() as u64 + 1 > limits.max_ancestors {
                        return Err(MempoolError::TooManyAncestors {
                            limit: limits.max_ancestors,
                        });
                    }
                }
            }
        } else {
            let id = self
                .arena
                .get_by_txid(&entry.txid())
                .expect("entry is in the pool when search_parents is false");
            pending = self.arena.get(id).expect("live entry").parents.clone();
        }

        let entry_size = entry.tx_size();
        let mut ancestors: HashSet<EntryId> = HashSet::new();
        let mut total_size = entry_size as u64;

        while let Some(&stage_id) = pending.iter().next() {
            pending.remove(&stage_id);
            ancestors.insert(stage_id);

            let stage = self.arena.get(stage_id).expect("ancestor is in the pool");
            total_size += stage.tx_size() as u64;

            if (stage.size_with_descendants() + entry_size) as u64 > limits.max_descendant_size {
                return Err(MempoolError::DescendantSizeExceeded {
                    txid: stage.txid(),
                    limit: limits.max_descendant_size,
                });
            } else if stage.count_with_descendants() + 1 > limits.max_descendants {
                return Err(MempoolError::TooManyDescendants {
                    txid: stage.txid(),
                    limit: limits.max_descendants,
                });
            } else if total_size > limits.max_ancestor_size {
                return Err(MempoolError::AncestorSizeExceeded {
                    limit: limits.max_ancestor_size,
                });
            }

            for &parent in &stage.parents {
                if !ancestors.contains(&parent) {
                    pending.insert(parent);
                }
                if pending.len() as u64 + ancestors.len() as u64 + 1 > limits.max_ancestors {
                    return Err(MempoolError::TooManyAncestors {
                        limit: limits.max_ancestors,
                    });
                }
            }
        }

        Ok(ancestors)
    }

    /// Unlimited ancestor walk over the link table, excluding the start.
    fn walk_ancestors(&self, id: EntryId, ancestors: &mut HashSet<EntryId>) {
        let mut stage: Vec<EntryId> = self
            .arena
            .get(id)
            .expect("live entry")
            .parents
            .iter()
            .copied()
            .collect();

        while let Some(parent) = stage.pop() {
            if ancestors.insert(parent) {
                let entry = self.arena.get(parent).expect("live entry");
                stage.extend(entry.parents.iter().copied());
            }
        }
    }

    /// Accumulate all in-pool descendants of `id` into `descendants`,
    /// including `id` itself. Idempotent over anything already present.
    pub(crate) fn calculate_descendants(&self, id: EntryId, descendants: &mut HashSet<EntryId>) {
        let mut stage: Vec<EntryId> = Vec::new();
        if !descendants.contains(&id) {
            stage.push(id);
        }

        while let Some(it) = stage.pop() {
            descendants.insert(it);
            let entry = self.arena.get(it).expect("live entry");
            for &child in &entry.children {
                if !descendants.contains(&child) {
                    stage.push(child);
                }
            }
        }
    }

    // === Link table ===

    fn update_parent(&mut self, entry: EntryId, parent: EntryId, add: bool) {
        let changed = if add {
            self.arena.add_parent(entry, parent)
        } else {
            self.arena.remove_parent(entry, parent)
        };
        if changed {
            let delta = memusage::hash_set_entry_usage::<EntryId>();
            if add {
                self.cached_inner_usage += delta;
            } else {
                self.cached_inner_usage -= delta;
            }
        }
    }

    fn update_child(&mut self, entry: EntryId, child: EntryId, add: bool) {
        let changed = if add {
            self.arena.add_child(entry, child)
        } else {
            self.arena.remove_child(entry, child)
        };
        if changed {
            let delta = memusage::hash_set_entry_usage::<EntryId>();
            if add {
                self.cached_inner_usage += delta;
            } else {
                self.cached_inner_usage -= delta;
            }
        }
    }

    // === Admission ===

    /// Add a fully built entry, computing its ancestor set internally.
    pub(crate) fn add_unchecked(&mut self, entry: TxMemPoolEntry) -> EntryId {
        let ancestors = self
            .calculate_mempool_ancestors(&entry, &MemPoolLimits::unbounded(), true)
            .expect("unbounded limits cannot be exceeded");
        self.add_unchecked_with_ancestors(entry, &ancestors)
    }

    /// Add a fully built entry with a precomputed ancestor set.
    ///
    /// The entry must not double-spend any in-pool outpoint, and its id must
    /// be fresh; admission control establishes both before construction.
    pub(crate) fn add_unchecked_with_ancestors(
        &mut self,
        entry: TxMemPoolEntry,
        ancestors: &HashSet<EntryId>,
    ) -> EntryId {
        let tx = entry.tx().clone();
        let txid = entry.txid();
        let wtxid = entry.wtxid();
        let usage = entry.dynamic_memory_usage();
        let tx_size = entry.tx_size();
        let fee = entry.fee();

        let id = self.arena.insert(entry);

        // Apply any delta persisted before this id was (re)admitted.
        if let Some(&delta) = self.map_deltas.get(&txid) {
            if delta != SignedAmount::ZERO {
                self.arena.update_fee_delta(id, delta);
            }
        }

        self.cached_inner_usage += usage;

        let mut parent_ids: HashSet<EntryId> = HashSet::new();
        for input in &tx.input {
            let displaced = self.map_next_tx.insert(input.previous_output, id);
            debug_assert!(displaced.is_none(), "in-pool double spend admitted");
            if let Some(pid) = self.arena.get_by_txid(&input.previous_output.txid) {
                parent_ids.insert(pid);
            }
        }
        for pid in parent_ids {
            self.update_parent(id, pid, true);
        }

        self.update_ancestors_of(true, id, ancestors);
        self.update_entry_for_ancestors(id, ancestors);

        self.total_tx_size += tx_size as u64;
        self.total_fee += fee;

        // Insert at a uniformly random slot to keep the vector unordered.
        let idx = self.txns_randomized.len();
        self.txns_randomized.push((wtxid, id));
        self.arena.set_randomized_idx(id, idx);
        if idx > 0 {
            let slot = rand::thread_rng().gen_range(0..=idx);
            if slot != idx {
                self.txns_randomized.swap(slot, idx);
                let displaced_id = self.txns_randomized[idx].1;
                self.arena.set_randomized_idx(displaced_id, idx);
                self.arena.set_randomized_idx(id, slot);
            }
        }

        self.unbroadcast.insert(txid);
        self.notifications.notify_added(&tx);

        id
    }

    /// Register (or unregister) `id` as a descendant of every ancestor:
    /// direct parents gain or lose the child link, and all ancestors shift
    /// their descendant aggregates by the entry's size, modified fee and
    /// count.
    fn update_ancestors_of(&mut self, add: bool, id: EntryId, ancestors: &HashSet<EntryId>) {
        let entry = self.arena.get(id).expect("live entry");
        let parents: Vec<EntryId> = entry.parents.iter().copied().collect();
        let count: i64 = if add { 1 } else { -1 };
        let size = count * entry.tx_size();
        let fee = SignedAmount::from_sat(count * entry.modified_fee().to_sat());

        for parent in parents {
            self.update_child(parent, id, add);
        }
        for &ancestor in ancestors {
            self.arena.update_descendant_state(ancestor, size, fee, count);
        }
    }

    /// Seed a new entry's ancestor aggregates from its ancestor set.
    fn update_entry_for_ancestors(&mut self, id: EntryId, ancestors: &HashSet<EntryId>) {
        let mut size = 0i64;
        let mut fee = SignedAmount::ZERO;
        let mut sigops = 0i64;
        for &ancestor in ancestors {
            let entry = self.arena.get(ancestor).expect("live entry");
            size += entry.tx_size();
            fee += entry.modified_fee();
            sigops += entry.sigop_cost();
        }
        self.arena
            .update_ancestor_state(id, size, fee, ancestors.len() as i64, sigops);
    }

    // === Removal ===

    /// Repair aggregates and links for an entire removal set, while the
    /// link table is still intact.
    ///
    /// With `update_descendants`, surviving descendants of each removed
    /// entry also shed the entry from their ancestor aggregates; this is
    /// wanted when the removed entries were confirmed in a block (their
    /// in-pool descendants remain valid and must account the confirmed
    /// parents as gone).
    pub(crate) fn update_for_remove_from_mempool(
        &mut self,
        entries: &HashSet<EntryId>,
        update_descendants: bool,
    ) {
        if update_descendants {
            for &rid in entries {
                let mut descendants = HashSet::new();
                self.calculate_descendants(rid, &mut descendants);
                descendants.remove(&rid);

                let (size, fee, sigops) = {
                    let entry = self.arena.get(rid).expect("live entry");
                    (
                        -entry.tx_size(),
                        SignedAmount::from_sat(-entry.modified_fee().to_sat()),
                        -entry.sigop_cost(),
                    )
                };
                for descendant in descendants {
                    if !entries.contains(&descendant) {
                        self.arena
                            .update_ancestor_state(descendant, size, fee, -1, sigops);
                    }
                }
            }
        }

        // Subtract each removed entry from its surviving ancestors and sever
        // the parent->child edges. Ancestor walks must complete for the
        // whole set before any child->parent edge goes away, so severing the
        // reverse direction happens in a separate pass.
        for &rid in entries {
            let mut ancestors = HashSet::new();
            self.walk_ancestors(rid, &mut ancestors);
            ancestors.retain(|ancestor| !entries.contains(ancestor));
            self.update_ancestors_of(false, rid, &ancestors);
        }

        for &rid in entries {
            let children: Vec<EntryId> = self
                .arena
                .get(rid)
                .expect("live entry")
                .children
                .iter()
                .copied()
                .collect();
            for child in children {
                if !entries.contains(&child) {
                    self.update_parent(child, rid, false);
                }
            }
        }
    }

    /// Physically remove one entry. `update_for_remove_from_mempool` must
    /// already have run for the whole removal set.
    fn remove_unchecked(&mut self, id: EntryId, reason: RemovalReason) {
        let (tx, txid, idx, tx_size, fee, usage, link_count) = {
            let entry = self.arena.get(id).expect("removing a live entry");
            (
                entry.tx().clone(),
                entry.txid(),
                entry.idx_randomized,
                entry.tx_size(),
                entry.fee(),
                entry.dynamic_memory_usage(),
                entry.parents.len() + entry.children.len(),
            )
        };

        for input in &tx.input {
            self.map_next_tx.remove(&input.previous_output);
        }

        let last = self.txns_randomized.len() - 1;
        if idx != last {
            self.txns_randomized.swap(idx, last);
            let moved = self.txns_randomized[idx].1;
            self.arena.set_randomized_idx(moved, idx);
        }
        self.txns_randomized.pop();
        if self.txns_randomized.len() * 2 < self.txns_randomized.capacity() {
            self.txns_randomized.shrink_to_fit();
        }

        self.total_tx_size -= tx_size as u64;
        self.total_fee = Amount::from_sat(self.total_fee.to_sat().saturating_sub(fee.to_sat()));
        self.cached_inner_usage -=
            usage + link_count * memusage::hash_set_entry_usage::<EntryId>();
        self.unbroadcast.remove(&txid);

        self.arena.remove(id);

        if let Some(estimator) = &self.estimator {
            estimator.remove_tx(txid);
        }
        self.notifications.notify_removed(&tx, reason);
    }

    /// Remove a closed set of entries: every in-pool descendant of a member
    /// must itself be a member, unless the members were just confirmed in a
    /// block (`update_descendants`). Returns the number removed.
    pub(crate) fn remove_staged(
        &mut self,
        stage: &HashSet<EntryId>,
        update_descendants: bool,
        reason: RemovalReason,
    ) -> usize {
        self.update_for_remove_from_mempool(stage, update_descendants);
        for &id in stage {
            self.remove_unchecked(id, reason);
        }
        stage.len()
    }

    /// Remove a transaction and all its in-pool descendants.
    ///
    /// If the transaction itself is absent, any in-pool spenders of its
    /// outputs are removed instead; such children can linger when a reorg
    /// fails to re-accept the parent.
    pub(crate) fn remove_recursive(&mut self, tx: &Transaction, reason: RemovalReason) -> usize {
        let txid = tx.compute_txid();
        let mut to_remove: HashSet<EntryId> = HashSet::new();

        if let Some(id) = self.arena.get_by_txid(&txid) {
            to_remove.insert(id);
        } else {
            for vout in 0..tx.output.len() as u32 {
                if let Some(&spender) = self.map_next_tx.get(&OutPoint { txid, vout }) {
                    to_remove.insert(spender);
                }
            }
        }

        let mut stage = HashSet::new();
        for id in to_remove {
            self.calculate_descendants(id, &mut stage);
        }
        self.remove_staged(&stage, false, reason)
    }

    /// Recursively remove any pool entry spending an outpoint that `tx`
    /// also spends. Returns the number removed.
    pub(crate) fn remove_conflicts(&mut self, tx: &Transaction) -> usize {
        let txid = tx.compute_txid();
        let mut removed = 0;

        for input in &tx.input {
            if let Some(&conflict_id) = self.map_next_tx.get(&input.previous_output) {
                let conflict = self.arena.get(conflict_id).expect("spender map entry is live");
                let conflict_txid = conflict.txid();
                let conflict_tx = conflict.tx().clone();
                if conflict_txid != txid {
                    self.map_deltas.remove(&conflict_txid);
                    removed += self.remove_recursive(&conflict_tx, RemovalReason::Conflict);
                }
            }
        }

        removed
    }

    /// Handle a connected block: drop confirmed entries (repairing their
    /// surviving descendants), evict conflicts, clear spent prioritisations
    /// and let the rolling fee decay again. Returns the number removed.
    pub(crate) fn remove_for_block(
        &mut self,
        vtx: &[Arc<Transaction>],
        height: u32,
        now: i64,
    ) -> usize {
        if let Some(estimator) = self.estimator.clone() {
            let confirmed: Vec<TxMempoolInfo> = vtx
                .iter()
                .filter_map(|tx| self.info(&tx.compute_txid()))
                .collect();
            estimator.process_block(height, &confirmed);
        }

        let mut removed = 0;
        for tx in vtx {
            if let Some(id) = self.arena.get_by_txid(&tx.compute_txid()) {
                let mut stage = HashSet::new();
                stage.insert(id);
                removed += self.remove_staged(&stage, true, RemovalReason::Block);
            }
            removed += self.remove_conflicts(tx);
            self.map_deltas.remove(&tx.compute_txid());
        }

        self.rolling_fee.on_block_connected(now);
        removed
    }

    /// Re-evaluate every entry against a new tip after a reorg, removing
    /// (with descendants) whatever is no longer minable: failed absolute
    /// locktimes, failed relative locktimes, and immature coinbase spends.
    /// Lock points recomputed along the way are stored back.
    pub(crate) fn remove_for_reorg<B: CoinView>(
        &mut self,
        coins: &mut CoinsViewCache<B>,
        chain: &dyn ChainView,
    ) -> usize {
        let tip_mtp = chain.median_time_past();
        let next_height = chain.height() + 1;

        let mut to_remove: Vec<EntryId> = Vec::new();
        let mut refreshed: Vec<(EntryId, LockPoints)> = Vec::new();

        let ids: Vec<EntryId> = self.arena.iter().map(|(id, _)| id).collect();
        for id in ids {
            let (tx, lp, spends_coinbase) = {
                let entry = self.arena.get(id).expect("live entry");
                (
                    entry.tx().clone(),
                    entry.lock_points().clone(),
                    entry.spends_coinbase(),
                )
            };

            let valid_lp = locks::lock_points_still_valid(&lp, chain);
            let mut fresh_lp = None;
            let sequence_ok = if valid_lp {
                locks::evaluate_lock_points(&lp, next_height, tip_mtp)
            } else {
                let recomputed = locks::calculate_lock_points(
                    &tx,
                    |outpoint| self.resolve_coin(outpoint, coins, next_height, tip_mtp),
                    chain,
                    next_height,
                );
                match recomputed {
                    Some(lp) => {
                        let ok = locks::evaluate_lock_points(&lp, next_height, tip_mtp);
                        fresh_lp = Some(lp);
                        ok
                    }
                    None => false,
                }
            };

            let mut invalid = !locks::is_final_tx(&tx, next_height, tip_mtp) || !sequence_ok;

            if !invalid && spends_coinbase {
                for input in &tx.input {
                    if self.exists(&input.previous_output.txid) {
                        continue;
                    }
                    match coins.get_coin(&input.previous_output) {
                        None => {
                            invalid = true;
                            break;
                        }
                        Some(coin) => {
                            if coin.is_coinbase
                                && next_height.saturating_sub(coin.height) < COINBASE_MATURITY
                            {
                                invalid = true;
                                break;
                            }
                        }
                    }
                }
            }

            if invalid {
                to_remove.push(id);
            } else if let Some(lp) = fresh_lp {
                refreshed.push((id, lp));
            }
        }

        for (id, lp) in refreshed {
            self.arena.update_lock_points(id, lp);
        }

        let mut stage = HashSet::new();
        for id in to_remove {
            self.calculate_descendants(id, &mut stage);
        }
        let removed = self.remove_staged(&stage, false, RemovalReason::Reorg);
        if removed > 0 {
            debug!(removed, "removed transactions invalidated by reorg");
        }
        removed
    }

    /// Resolve an input coin pool-first: pool outputs are treated as
    /// confirming in the candidate block.
    fn resolve_coin<B: CoinView>(
        &self,
        outpoint: &OutPoint,
        coins: &mut CoinsViewCache<B>,
        next_height: u32,
        tip_mtp: i64,
    ) -> Option<Coin> {
        if let Some(pid) = self.arena.get_by_txid(&outpoint.txid) {
            let parent = self.arena.get(pid)?;
            let output = parent.tx().output.get(outpoint.vout as usize)?.clone();
            return Some(Coin {
                output,
                height: next_height,
                is_coinbase: false,
                median_time_past: tip_mtp,
            });
        }
        coins.get_coin(outpoint)
    }

    // === Eviction ===

    /// Evict lowest-scoring packages until dynamic usage fits `size_limit`.
    ///
    /// Each evicted package bumps the rolling minimum feerate to its package
    /// feerate. If `no_spends_remaining` is given, it collects outpoints
    /// that, after the eviction, are neither in the pool nor spent by it.
    /// Returns the number of transactions removed.
    pub(crate) fn trim_to_size(
        &mut self,
        size_limit: usize,
        mut no_spends_remaining: Option<&mut Vec<OutPoint>>,
    ) -> usize {
        let mut txn_removed = 0;
        let mut max_feerate_removed = FeeRate::ZERO;

        while !self.arena.is_empty() && self.dynamic_memory_usage() > size_limit {
            let (worst, package_fees, package_size) = {
                let (id, entry) = self
                    .arena
                    .iter_by_descendant_score()
                    .next()
                    .expect("pool is not empty");
                (
                    id,
                    entry.mod_fees_with_descendants(),
                    entry.size_with_descendants(),
                )
            };

            let package_fees = package_fees.to_unsigned().unwrap_or(Amount::ZERO);
            let removed_rate = FeeRate::from_fee_and_vsize(package_fees, package_size)
                .expect("package size is positive");
            if self.rolling_fee.track_package_removed(removed_rate) {
                debug!(rate = %removed_rate, "rolling minimum fee bumped");
            }
            max_feerate_removed = max_feerate_removed.max(removed_rate);

            let mut stage = HashSet::new();
            self.calculate_descendants(worst, &mut stage);
            txn_removed += stage.len();

            let evicted: Option<Vec<Arc<Transaction>>> = no_spends_remaining.is_some().then(|| {
                stage
                    .iter()
                    .map(|id| self.arena.get(*id).expect("staged entry").tx().clone())
                    .collect()
            });

            self.remove_staged(&stage, false, RemovalReason::SizeLimit);

            if let (Some(out), Some(evicted)) = (no_spends_remaining.as_mut(), evicted) {
                for tx in evicted {
                    for input in &tx.input {
                        if self.exists(&input.previous_output.txid) {
                            continue;
                        }
                        if !self.map_next_tx.contains_key(&input.previous_output) {
                            out.push(input.previous_output);
                        }
                    }
                }
            }
        }

        if txn_removed > 0 {
            debug!(
                removed = txn_removed,
                max_feerate = %max_feerate_removed,
                "trimmed mempool to size limit"
            );
        }
        txn_removed
    }

    /// Remove every entry older than `time`, with descendants. Returns the
    /// number removed.
    pub(crate) fn expire(&mut self, time: i64) -> usize {
        let expired: Vec<EntryId> = self
            .arena
            .iter_by_entry_time()
            .take_while(|(_, entry)| entry.time() < time)
            .map(|(id, _)| id)
            .collect();

        let mut stage = HashSet::new();
        for id in expired {
            self.calculate_descendants(id, &mut stage);
        }

        let removed = self.remove_staged(&stage, false, RemovalReason::Expiry);
        if removed > 0 {
            debug!(removed, cutoff = time, "expired transactions");
        }
        removed
    }

    // === Reorg replay ===

    /// Repair descendant state after disconnected-block transactions were
    /// re-added.
    ///
    /// `hashes_to_update` must be the re-added ids in their original block
    /// order. Until this runs, the link table understates children and
    /// functions that walk it are not safe to use; children are therefore
    /// discovered through the spender map here. Ids also present in
    /// `hashes_to_update` are skipped as descendants, since their own
    /// admission already accounted for them.
    pub(crate) fn update_transactions_from_block(&mut self, hashes_to_update: &[Txid]) {
        let already_included: HashSet<Txid> = hashes_to_update.iter().copied().collect();
        let mut cached_descendants: HashMap<EntryId, HashSet<EntryId>> = HashMap::new();

        for txid in hashes_to_update.iter().rev() {
            let Some(id) = self.arena.get_by_txid(txid) else {
                continue;
            };

            let n_outputs = self.arena.get(id).expect("live entry").tx().output.len() as u32;
            let mut children: HashSet<EntryId> = HashSet::new();
            for vout in 0..n_outputs {
                if let Some(&child) = self.map_next_tx.get(&OutPoint { txid: *txid, vout }) {
                    children.insert(child);
                }
            }

            for child in children {
                let child_txid = self.arena.get(child).expect("live entry").txid();
                if !already_included.contains(&child_txid) {
                    self.update_child(id, child, true);
                    self.update_parent(child, id, true);
                }
            }

            self.update_for_descendants(id, &mut cached_descendants, &already_included);
        }
    }

    /// Fold the (possibly pre-existing) descendants of one re-added entry
    /// into its aggregates, and the entry into theirs.
    ///
    /// `cached_descendants` memoizes walked subtrees so chains shared across
    /// several re-added entries are only walked once. Descendants whose id
    /// is in `exclude` were re-added after this entry and are already
    /// accounted for.
    fn update_for_descendants(
        &mut self,
        update_id: EntryId,
        cached_descendants: &mut HashMap<EntryId, HashSet<EntryId>>,
        exclude: &HashSet<Txid>,
    ) {
        let mut stage: Vec<EntryId> = self
            .arena
            .get(update_id)
            .expect("live entry")
            .children
            .iter()
            .copied()
            .collect();
        let mut all_descendants: HashSet<EntryId> = HashSet::new();

        while let Some(cit) = stage.pop() {
            if !all_descendants.insert(cit) {
                continue;
            }
            let children: Vec<EntryId> = self
                .arena
                .get(cit)
                .expect("live entry")
                .children
                .iter()
                .copied()
                .collect();
            for child in children {
                if let Some(cached) = cached_descendants.get(&child) {
                    // Already walked: splice in the memoized subtree.
                    for &descendant in cached {
                        all_descendants.insert(descendant);
                    }
                } else if !all_descendants.contains(&child) {
                    stage.push(child);
                }
            }
        }

        let (update_size, update_fee, update_sigops) = {
            let entry = self.arena.get(update_id).expect("live entry");
            (
                entry.tx_size(),
                SignedAmount::from_sat(entry.modified_fee().to_sat()),
                entry.sigop_cost(),
            )
        };

        let mut modify_size = 0i64;
        let mut modify_fee = SignedAmount::ZERO;
        let mut modify_count = 0i64;
        for descendant in all_descendants {
            let (descendant_txid, size, fee) = {
                let entry = self.arena.get(descendant).expect("live entry");
                (
                    entry.txid(),
                    entry.tx_size(),
                    SignedAmount::from_sat(entry.modified_fee().to_sat()),
                )
            };
            if exclude.contains(&descendant_txid) {
                continue;
            }
            modify_size += size;
            modify_fee += fee;
            modify_count += 1;
            cached_descendants
                .entry(update_id)
                .or_default()
                .insert(descendant);
            self.arena
                .update_ancestor_state(descendant, update_size, update_fee, 1, update_sigops);
        }
        self.arena
            .update_descendant_state(update_id, modify_size, modify_fee, modify_count);
    }

    // === Prioritisation ===

    /// Add `fee_delta` to the persistent bias for `txid`, rippling the
    /// change through the aggregates of any in-pool entry, its ancestors and
    /// its descendants.
    pub(crate) fn prioritise_transaction(&mut self, txid: Txid, fee_delta: SignedAmount) {
        let delta = self.map_deltas.entry(txid).or_insert(SignedAmount::ZERO);
        *delta += fee_delta;
        let delta = *delta;

        if let Some(id) = self.arena.get_by_txid(&txid) {
            self.arena.update_fee_delta(id, delta);

            let mut ancestors = HashSet::new();
            self.walk_ancestors(id, &mut ancestors);
            for &ancestor in &ancestors {
                self.arena
                    .update_descendant_state(ancestor, 0, fee_delta, 0);
            }

            let mut descendants = HashSet::new();
            self.calculate_descendants(id, &mut descendants);
            descendants.remove(&id);
            for descendant in descendants {
                self.arena
                    .update_ancestor_state(descendant, 0, fee_delta, 0, 0);
            }
        }

        debug!(%txid, delta = delta.to_sat(), "prioritised transaction");
    }

    /// Add the stored bias for `txid`, if any, to an external fee value.
    pub(crate) fn apply_delta(&self, txid: &Txid, fee: &mut SignedAmount) {
        if let Some(delta) = self.map_deltas.get(txid) {
            *fee += *delta;
        }
    }

    pub(crate) fn clear_prioritisation(&mut self, txid: &Txid) {
        self.map_deltas.remove(txid);
    }

    // === Maintenance ===

    /// Drop all entries and pool bookkeeping. Priority deltas survive: they
    /// are keyed by id, not by entry.
    pub(crate) fn clear(&mut self, now: i64) {
        self.arena = MemPoolArena::new();
        self.map_next_tx.clear();
        self.txns_randomized.clear();
        self.unbroadcast.clear();
        self.total_tx_size = 0;
        self.total_fee = Amount::ZERO;
        self.cached_inner_usage = 0;
        self.rolling_fee.reset(now);
    }

    /// Verify every pool invariant from first principles, panicking on any
    /// violation. Quadratic; meant for sanity-check sampling and tests.
    pub(crate) fn check(&self, coins: &dyn CoinView) {
        let mut total_size: u64 = 0;
        let mut total_fee = Amount::ZERO;
        let mut inner_usage: usize = 0;
        let link_usage = memusage::hash_set_entry_usage::<EntryId>();

        for (id, entry) in self.arena.iter() {
            let tx = entry.tx();
            total_size += entry.tx_size() as u64;
            total_fee += entry.fee();
            inner_usage += entry.dynamic_memory_usage()
                + (entry.parents.len() + entry.children.len()) * link_usage;

            let mut computed_parents: HashSet<EntryId> = HashSet::new();
            for input in &tx.input {
                assert_eq!(
                    self.map_next_tx.get(&input.previous_output),
                    Some(&id),
                    "every input must be registered to its spender"
                );
                if let Some(pid) = self.arena.get_by_txid(&input.previous_output.txid) {
                    computed_parents.insert(pid);
                    assert!(
                        self.arena.get(pid).expect("live entry").children.contains(&id),
                        "parent must list this entry as a child"
                    );
                } else {
                    assert!(
                        coins.have_coin(&input.previous_output),
                        "inputs must be in the pool or the coin view"
                    );
                }
            }
            assert_eq!(
                computed_parents, entry.parents,
                "link-table parents must match inputs"
            );

            for child in &entry.children {
                assert!(
                    self.arena.get(*child).expect("live entry").parents.contains(&id),
                    "child must list this entry as a parent"
                );
            }

            let mut ancestors = HashSet::new();
            self.walk_ancestors(id, &mut ancestors);
            let mut count = 1u64;
            let mut size = entry.tx_size();
            let mut fees = entry.modified_fee();
            let mut sigops = entry.sigop_cost();
            for ancestor in &ancestors {
                let a = self.arena.get(*ancestor).expect("live entry");
                count += 1;
                size += a.tx_size();
                fees += a.modified_fee();
                sigops += a.sigop_cost();
            }
            assert_eq!(entry.count_with_ancestors(), count);
            assert_eq!(entry.size_with_ancestors(), size);
            assert_eq!(entry.mod_fees_with_ancestors(), fees);
            assert_eq!(entry.sigop_cost_with_ancestors(), sigops);

            let mut descendants = HashSet::new();
            self.calculate_descendants(id, &mut descendants);
            let mut count = 0u64;
            let mut size = 0i64;
            let mut fees = SignedAmount::ZERO;
            for descendant in &descendants {
                let d = self.arena.get(*descendant).expect("live entry");
                count += 1;
                size += d.tx_size();
                fees += d.modified_fee();
            }
            assert_eq!(entry.count_with_descendants(), count);
            assert_eq!(entry.size_with_descendants(), size);
            assert_eq!(entry.mod_fees_with_descendants(), fees);

            assert_eq!(
                self.txns_randomized.get(entry.idx_randomized),
                Some(&(entry.wtxid(), id)),
                "randomized vector slot must point back at the entry"
            );
        }

        for (outpoint, id) in &self.map_next_tx {
            let spender = self.arena.get(*id).expect("spender map entries point at live entries");
            assert!(
                spender
                    .tx()
                    .input
                    .iter()
                    .any(|input| input.previous_output == *outpoint),
                "spender map entry must correspond to an actual input"
            );
        }

        assert_eq!(self.txns_randomized.len(), self.arena.len());
        assert_eq!(total_size, self.total_tx_size);
        assert_eq!(total_fee, self.total_fee);
        assert_eq!(inner_usage, self.cached_inner_usage);
    }
}
