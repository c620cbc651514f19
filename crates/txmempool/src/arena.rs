//! Arena-backed entry storage with the pool's four concurrent orderings.
//!
//! Entries live in a slotmap and refer to each other through [`EntryId`]
//! handles, so the parent/child graph never holds owning references. On top
//! of the primary storage sit two hash indexes (txid, wtxid) and three
//! ordered indexes (descendant score, entry time, ancestor score).
//!
//! Score keys are cached inside each entry to solve the remove-before-mutate
//! problem: a mutation that can change a sort key must remove the entry from
//! the ordered indexes under its old key, apply the change, then reinsert
//! under the recomputed key. All such mutations go through the `update_*`
//! primitives below; anything else (links, lock points, the randomized-vector
//! slot) is key-neutral.

use crate::locks::LockPoints;
use crate::memusage;
use crate::types::{signed, EntryId};
use bitcoin::{Amount, SignedAmount, Transaction, Txid, Weight, Wtxid};
use slotmap::{DefaultKey, SlotMap};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::mem;
use std::sync::Arc;

/// A fee-per-size fraction, compared exactly by cross-multiplication.
///
/// Keeping the numerator and denominator separate avoids both float drift
/// and the precision loss of scaled integer division; `i128` widening makes
/// the cross products overflow-free for any realistic fee and size.
#[derive(Debug, Clone, Copy)]
pub struct ScoreFraction {
    /// Modified fees in satoshis (signed: priority deltas may be negative).
    pub fee: i64,
    /// Virtual size in bytes, always positive.
    pub size: i64,
}

impl Ord for ScoreFraction {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee as i128 * other.size as i128;
        let rhs = other.fee as i128 * self.size as i128;
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for ScoreFraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScoreFraction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoreFraction {}

/// Key for the descendant-score index.
///
/// Ascending on `max(entry feerate, package feerate)`, older entries first
/// on ties. Eviction pops from the front: the lowest-paying package goes
/// first, and among equals the oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescendantScoreKey {
    pub score: ScoreFraction,
    pub time: i64,
}

impl Ord for DescendantScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| self.time.cmp(&other.time))
    }
}

impl PartialOrd for DescendantScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key for the ancestor-score index.
///
/// Descending on `min(entry feerate, ancestor feerate)`, smaller txid first
/// on ties. Iteration order is mining order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncestorScoreKey {
    pub score: ScoreFraction,
    pub txid: Txid,
}

impl Ord for AncestorScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for AncestorScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One unconfirmed transaction in the pool.
///
/// Alongside its own data, an entry carries aggregates over all in-pool
/// transactions that depend on it ("descendants") and all it depends on
/// ("ancestors"), both including the entry itself. If this entry is removed,
/// every descendant must be removed as well.
pub struct TxMemPoolEntry {
    tx: Arc<Transaction>,
    txid: Txid,
    wtxid: Wtxid,
    /// Base fee, cached to avoid parent-transaction lookups.
    fee: Amount,
    /// ... and the transaction weight.
    tx_weight: Weight,
    /// ... and total memory usage.
    usage_size: usize,
    /// Local time when entering the mempool.
    time: i64,
    /// Chain height when entering the mempool.
    entry_height: u32,
    /// Whether any input spends a coinbase output.
    spends_coinbase: bool,
    /// Total signature-operation cost.
    sigop_cost: i64,
    /// Priority bias applied for mining ordering.
    fee_delta: SignedAmount,
    /// Cached relative-locktime constraints.
    lock_points: LockPoints,

    // Descendant aggregates, including this entry.
    count_with_descendants: u64,
    size_with_descendants: i64,
    mod_fees_with_descendants: SignedAmount,

    // Ancestor aggregates, including this entry.
    count_with_ancestors: u64,
    size_with_ancestors: i64,
    mod_fees_with_ancestors: SignedAmount,
    sigop_cost_with_ancestors: i64,

    // In-pool graph links, maintained by the pool together with admission
    // and removal. Orphan (out-of-pool) parents are not represented.
    pub(crate) parents: HashSet<EntryId>,
    pub(crate) children: HashSet<EntryId>,

    // Cached index keys; see the module docs.
    cached_descendant_key: DescendantScoreKey,
    cached_ancestor_key: AncestorScoreKey,

    /// Slot in the pool's randomized wtxid vector.
    pub(crate) idx_randomized: usize,
}

impl TxMemPoolEntry {
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        time: i64,
        entry_height: u32,
        spends_coinbase: bool,
        sigop_cost: i64,
        lock_points: LockPoints,
    ) -> Self {
        let txid = tx.compute_txid();
        let wtxid = tx.compute_wtxid();
        let tx_weight = tx.weight();
        let usage_size = memusage::malloc_usage(mem::size_of::<Transaction>() + tx.total_size())
            + memusage::malloc_usage(mem::size_of::<Self>());
        let vsize = tx_weight.to_vbytes_ceil() as i64;

        let mut entry = Self {
            tx,
            txid,
            wtxid,
            fee,
            tx_weight,
            usage_size,
            time,
            entry_height,
            spends_coinbase,
            sigop_cost,
            fee_delta: SignedAmount::ZERO,
            lock_points,
            count_with_descendants: 1,
            size_with_descendants: vsize,
            mod_fees_with_descendants: signed(fee),
            count_with_ancestors: 1,
            size_with_ancestors: vsize,
            mod_fees_with_ancestors: signed(fee),
            sigop_cost_with_ancestors: sigop_cost,
            parents: HashSet::new(),
            children: HashSet::new(),
            cached_descendant_key: DescendantScoreKey {
                score: ScoreFraction { fee: 0, size: 1 },
                time,
            },
            cached_ancestor_key: AncestorScoreKey {
                score: ScoreFraction { fee: 0, size: 1 },
                txid,
            },
            idx_randomized: usize::MAX,
        };
        entry.cached_descendant_key = entry.compute_descendant_key();
        entry.cached_ancestor_key = entry.compute_ancestor_key();
        entry
    }

    pub fn tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn wtxid(&self) -> Wtxid {
        self.wtxid
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Base fee plus the priority delta.
    pub fn modified_fee(&self) -> SignedAmount {
        signed(self.fee) + self.fee_delta
    }

    pub fn fee_delta(&self) -> SignedAmount {
        self.fee_delta
    }

    /// Virtual size in bytes (witness-discounted weight).
    pub fn tx_size(&self) -> i64 {
        self.tx_weight.to_vbytes_ceil() as i64
    }

    pub fn tx_weight(&self) -> Weight {
        self.tx_weight
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn height(&self) -> u32 {
        self.entry_height
    }

    pub fn spends_coinbase(&self) -> bool {
        self.spends_coinbase
    }

    pub fn sigop_cost(&self) -> i64 {
        self.sigop_cost
    }

    pub fn lock_points(&self) -> &LockPoints {
        &self.lock_points
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.usage_size
    }

    pub fn count_with_descendants(&self) -> u64 {
        self.count_with_descendants
    }

    pub fn size_with_descendants(&self) -> i64 {
        self.size_with_descendants
    }

    pub fn mod_fees_with_descendants(&self) -> SignedAmount {
        self.mod_fees_with_descendants
    }

    pub fn count_with_ancestors(&self) -> u64 {
        self.count_with_ancestors
    }

    pub fn size_with_ancestors(&self) -> i64 {
        self.size_with_ancestors
    }

    pub fn mod_fees_with_ancestors(&self) -> SignedAmount {
        self.mod_fees_with_ancestors
    }

    pub fn sigop_cost_with_ancestors(&self) -> i64 {
        self.sigop_cost_with_ancestors
    }

    /// Feerate used for the descendant-score index:
    /// `max(own feerate, package feerate)`.
    pub(crate) fn descendant_score(&self) -> ScoreFraction {
        let own = ScoreFraction {
            fee: self.modified_fee().to_sat(),
            size: self.tx_size(),
        };
        let package = ScoreFraction {
            fee: self.mod_fees_with_descendants.to_sat(),
            size: self.size_with_descendants,
        };
        own.max(package)
    }

    /// Feerate used for the ancestor-score index:
    /// `min(own feerate, ancestor feerate)`.
    pub(crate) fn ancestor_score(&self) -> ScoreFraction {
        let own = ScoreFraction {
            fee: self.modified_fee().to_sat(),
            size: self.tx_size(),
        };
        let with_ancestors = ScoreFraction {
            fee: self.mod_fees_with_ancestors.to_sat(),
            size: self.size_with_ancestors,
        };
        own.min(with_ancestors)
    }

    /// Current position key in the descendant-score index.
    pub(crate) fn descendant_sort_key(&self) -> DescendantScoreKey {
        self.cached_descendant_key
    }

    fn compute_descendant_key(&self) -> DescendantScoreKey {
        DescendantScoreKey {
            score: self.descendant_score(),
            time: self.time,
        }
    }

    fn compute_ancestor_key(&self) -> AncestorScoreKey {
        AncestorScoreKey {
            score: self.ancestor_score(),
            txid: self.txid,
        }
    }

    fn apply_descendant_delta(&mut self, size: i64, fee: SignedAmount, count: i64) {
        self.size_with_descendants += size;
        self.mod_fees_with_descendants += fee;
        self.count_with_descendants = (self.count_with_descendants as i64 + count) as u64;
    }

    fn apply_ancestor_delta(&mut self, size: i64, fee: SignedAmount, count: i64, sigops: i64) {
        self.size_with_ancestors += size;
        self.mod_fees_with_ancestors += fee;
        self.count_with_ancestors = (self.count_with_ancestors as i64 + count) as u64;
        self.sigop_cost_with_ancestors += sigops;
    }

    /// Replace the priority delta, shifting own descendant and ancestor fee
    /// aggregates by the change.
    fn apply_fee_delta(&mut self, new_delta: SignedAmount) {
        let change = new_delta - self.fee_delta;
        self.mod_fees_with_descendants += change;
        self.mod_fees_with_ancestors += change;
        self.fee_delta = new_delta;
    }
}

/// Arena holding all mempool entries with multi-index support.
pub struct MemPoolArena {
    entries: SlotMap<DefaultKey, TxMemPoolEntry>,

    by_txid: HashMap<Txid, EntryId>,
    by_wtxid: HashMap<Wtxid, EntryId>,

    by_descendant_score: BTreeSet<(DescendantScoreKey, EntryId)>,
    by_entry_time: BTreeSet<(i64, EntryId)>,
    by_ancestor_score: BTreeSet<(AncestorScoreKey, EntryId)>,
}

impl MemPoolArena {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::new(),
            by_txid: HashMap::new(),
            by_wtxid: HashMap::new(),
            by_descendant_score: BTreeSet::new(),
            by_entry_time: BTreeSet::new(),
            by_ancestor_score: BTreeSet::new(),
        }
    }

    /// Insert a new entry, indexing it everywhere. The entry's id must be
    /// fresh; admission control rejects duplicates before construction.
    pub fn insert(&mut self, entry: TxMemPoolEntry) -> EntryId {
        let txid = entry.txid;
        let wtxid = entry.wtxid;
        let time = entry.time;
        let desc_key = entry.cached_descendant_key;
        let anc_key = entry.cached_ancestor_key;

        let id = EntryId(self.entries.insert(entry));

        let displaced = self.by_txid.insert(txid, id);
        debug_assert!(displaced.is_none(), "duplicate txid admitted: {txid}");
        self.by_wtxid.insert(wtxid, id);
        self.by_descendant_score.insert((desc_key, id));
        self.by_entry_time.insert((time, id));
        self.by_ancestor_score.insert((anc_key, id));

        id
    }

    /// Remove an entry, de-indexing it everywhere.
    pub fn remove(&mut self, id: EntryId) -> Option<TxMemPoolEntry> {
        let entry = self.entries.remove(id.0)?;

        self.by_txid.remove(&entry.txid);
        self.by_wtxid.remove(&entry.wtxid);
        self.by_descendant_score
            .remove(&(entry.cached_descendant_key, id));
        self.by_entry_time.remove(&(entry.time, id));
        self.by_ancestor_score
            .remove(&(entry.cached_ancestor_key, id));

        Some(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&TxMemPoolEntry> {
        self.entries.get(id.0)
    }

    pub fn get_by_txid(&self, txid: &Txid) -> Option<EntryId> {
        self.by_txid.get(txid).copied()
    }

    pub fn get_by_wtxid(&self, wtxid: &Wtxid) -> Option<EntryId> {
        self.by_wtxid.get(wtxid).copied()
    }

    /// Re-sort an entry in the ordered indexes across a key-changing mutation.
    fn reindex(&mut self, id: EntryId, mutate: impl FnOnce(&mut TxMemPoolEntry)) {
        let entry = &self.entries[id.0];
        let old_desc = (entry.cached_descendant_key, id);
        let old_anc = (entry.cached_ancestor_key, id);
        self.by_descendant_score.remove(&old_desc);
        self.by_ancestor_score.remove(&old_anc);

        let entry = &mut self.entries[id.0];
        mutate(entry);
        entry.cached_descendant_key = entry.compute_descendant_key();
        entry.cached_ancestor_key = entry.compute_ancestor_key();

        let new_desc = (entry.cached_descendant_key, id);
        let new_anc = (entry.cached_ancestor_key, id);
        self.by_descendant_score.insert(new_desc);
        self.by_ancestor_score.insert(new_anc);
    }

    /// Shift an entry's descendant aggregates and re-sort.
    pub fn update_descendant_state(
        &mut self,
        id: EntryId,
        size: i64,
        fee: SignedAmount,
        count: i64,
    ) {
        self.reindex(id, |entry| entry.apply_descendant_delta(size, fee, count));
    }

    /// Shift an entry's ancestor aggregates and re-sort.
    pub fn update_ancestor_state(
        &mut self,
        id: EntryId,
        size: i64,
        fee: SignedAmount,
        count: i64,
        sigops: i64,
    ) {
        self.reindex(id, |entry| {
            entry.apply_ancestor_delta(size, fee, count, sigops)
        });
    }

    /// Replace an entry's priority delta and re-sort.
    pub fn update_fee_delta(&mut self, id: EntryId, new_delta: SignedAmount) {
        self.reindex(id, |entry| entry.apply_fee_delta(new_delta));
    }

    /// Refresh cached lock points. Key-neutral, no reindexing.
    pub fn update_lock_points(&mut self, id: EntryId, lp: LockPoints) {
        if let Some(entry) = self.entries.get_mut(id.0) {
            entry.lock_points = lp;
        }
    }

    /// Record the entry's slot in the randomized wtxid vector. Key-neutral.
    pub fn set_randomized_idx(&mut self, id: EntryId, idx: usize) {
        self.entries[id.0].idx_randomized = idx;
    }

    pub fn add_parent(&mut self, id: EntryId, parent: EntryId) -> bool {
        self.entries[id.0].parents.insert(parent)
    }

    pub fn remove_parent(&mut self, id: EntryId, parent: EntryId) -> bool {
        self.entries[id.0].parents.remove(&parent)
    }

    pub fn add_child(&mut self, id: EntryId, child: EntryId) -> bool {
        self.entries[id.0].children.insert(child)
    }

    pub fn remove_child(&mut self, id: EntryId, child: EntryId) -> bool {
        self.entries[id.0].children.remove(&child)
    }

    /// Iterate all entries in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.entries.iter().map(|(key, entry)| (EntryId(key), entry))
    }

    /// Iterate entries in eviction order: lowest package feerate first.
    pub fn iter_by_descendant_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_descendant_score
            .iter()
            .map(|(_, id)| (*id, &self.entries[id.0]))
    }

    /// Iterate entries in admission order: oldest first.
    pub fn iter_by_entry_time(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_entry_time
            .iter()
            .map(|(_, id)| (*id, &self.entries[id.0]))
    }

    /// Iterate entries in mining order: highest ancestor feerate first.
    pub fn iter_by_ancestor_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_ancestor_score
            .iter()
            .map(|(_, id)| (*id, &self.entries[id.0]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemPoolArena {
    fn default() -> Self {
        Self::new()
    }
}
