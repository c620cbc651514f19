//! # Transaction Memory Pool
//!
//! Storage for transactions that are valid against the current best chain
//! and candidates for inclusion in the next block.
//!
//! 1. Package tracking.
//!     - Every entry carries aggregate fee/size/count/sigop statistics over
//!       its in-pool ancestors and descendants, maintained incrementally so
//!       admission control, mining order and eviction run in sub-linear time.
//! 2. Orderings.
//!     - One entry set, four live views: by id, by descendant score
//!       (eviction), by entry time (expiry), by ancestor score (mining).
//! 3. Fee management.
//!     - Size-limit eviction removes whole packages, lowest package feerate
//!       first, and raises an exponentially decaying minimum-feerate floor.
//!     - Per-id priority deltas bias mining order and persist across
//!       removal and re-admission.
//! 4. Reorg support.
//!     - Disconnected-block transactions are staged in order, replayed after
//!       the reorg, and the pool's aggregates are repaired in one pass.
//!
//! The pool does not validate scripts or consensus rules; it receives
//! already-validated entries and consumes read-only [`CoinView`] /
//! [`ChainView`] seams for the chain state it needs.

mod arena;
mod coins_view;
mod disconnected;
mod error;
mod inner;
mod locks;
mod memusage;
mod options;
mod policy;
#[cfg(test)]
mod tests;
mod types;

pub use self::arena::{MemPoolArena, TxMemPoolEntry};
pub use self::coins_view::{
    ChainView, Coin, CoinView, CoinsViewCache, CoinsViewMemPool, MEMPOOL_HEIGHT,
};
pub use self::disconnected::DisconnectedBlockTransactions;
pub use self::error::MempoolError;
pub use self::inner::MemPoolInner;
pub use self::locks::{
    calculate_lock_points, evaluate_lock_points, is_final_tx, lock_points_still_valid,
    LockPoints, COINBASE_MATURITY,
};
pub use self::options::{MemPoolLimits, MemPoolOptions, MemPoolOptionsBuilder};
pub use self::policy::ROLLING_FEE_HALFLIFE;
pub use self::types::{BlockPolicyEstimator, EntryId, FeeRate, RemovalReason, TxMempoolInfo};

use bitcoin::{OutPoint, SignedAmount, Transaction, Txid, Wtxid};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe transaction memory pool.
///
/// All state lives behind one lock; every public operation acquires it once
/// and completes without blocking, so operations are linearizable and
/// notifications fire in mutation order.
pub struct MemPool {
    /// Configuration (immutable after creation).
    options: MemPoolOptions,

    /// All pool state, guarded by the critical section.
    pub(crate) inner: RwLock<MemPoolInner>,

    /// Bumped on every mutation; block-template builders watch this to
    /// detect staleness.
    transactions_updated: AtomicU32,

    /// `n` means `check` runs n-in-2^32 times per invocation.
    check_frequency: AtomicU32,
}

impl MemPool {
    /// Create a new pool with the given options.
    pub fn new(options: MemPoolOptions) -> Self {
        Self::with_estimator_opt(options, None)
    }

    /// Create a new pool wired to a fee-estimation collaborator.
    pub fn with_estimator(
        options: MemPoolOptions,
        estimator: Arc<dyn BlockPolicyEstimator>,
    ) -> Self {
        Self::with_estimator_opt(options, Some(estimator))
    }

    fn with_estimator_opt(
        options: MemPoolOptions,
        estimator: Option<Arc<dyn BlockPolicyEstimator>>,
    ) -> Self {
        let check_frequency = (options.check_ratio.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
        Self {
            inner: RwLock::new(MemPoolInner::new(Self::current_time(), estimator)),
            options,
            transactions_updated: AtomicU32::new(0),
            check_frequency: AtomicU32::new(check_frequency),
        }
    }

    pub fn options(&self) -> &MemPoolOptions {
        &self.options
    }

    fn current_time() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64
    }

    fn read(&self) -> RwLockReadGuard<'_, MemPoolInner> {
        self.inner.read().expect("mempool lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemPoolInner> {
        self.inner.write().expect("mempool lock poisoned")
    }

    // === Admission ===

    /// Add a validated entry, computing its in-pool ancestors internally.
    ///
    /// The caller has already enforced policy (limits via
    /// [`Self::calculate_mempool_ancestors`], fee floor via
    /// [`Self::get_min_fee`]); this only performs the bookkeeping.
    pub fn add_unchecked(&self, entry: TxMemPoolEntry) {
        self.write().add_unchecked(entry);
        self.transactions_updated.fetch_add(1, Ordering::SeqCst);
    }

    /// Add a validated entry with its ancestor set precomputed by
    /// [`Self::calculate_mempool_ancestors`].
    pub fn add_unchecked_with_ancestors(
        &self,
        entry: TxMemPoolEntry,
        ancestors: &HashSet<EntryId>,
    ) {
        self.write().add_unchecked_with_ancestors(entry, ancestors);
        self.transactions_updated.fetch_add(1, Ordering::SeqCst);
    }

    /// Compute the in-pool ancestors of a prospective entry under the given
    /// limits. `search_parents` must be true when the entry is not (yet) in
    /// the pool.
    pub fn calculate_mempool_ancestors(
        &self,
        entry: &TxMemPoolEntry,
        limits: &MemPoolLimits,
        search_parents: bool,
    ) -> Result<HashSet<EntryId>, MempoolError> {
        self.read()
            .calculate_mempool_ancestors(entry, limits, search_parents)
    }

    /// All in-pool descendants of `txid`, itself included. Empty if absent.
    pub fn calculate_descendants(&self, txid: &Txid) -> HashSet<EntryId> {
        let inner = self.read();
        let mut descendants = HashSet::new();
        if let Some(id) = inner.arena.get_by_txid(txid) {
            inner.calculate_descendants(id, &mut descendants);
        }
        descendants
    }

    // === Removal ===

    /// Remove a transaction and all its in-pool descendants.
    pub fn remove_recursive(&self, tx: &Transaction, reason: RemovalReason) {
        let removed = self.write().remove_recursive(tx, reason);
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
    }

    /// Remove a pre-staged, descendant-closed set of entries.
    pub fn remove_staged(
        &self,
        stage: &HashSet<EntryId>,
        update_descendants: bool,
        reason: RemovalReason,
    ) {
        let removed = self.write().remove_staged(stage, update_descendants, reason);
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
    }

    /// Process a connected block: remove confirmed transactions and their
    /// conflicts, and reset the rolling-fee clock.
    pub fn remove_for_block(&self, vtx: &[Arc<Transaction>], height: u32) {
        let removed = self
            .write()
            .remove_for_block(vtx, height, Self::current_time());
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
    }

    /// Recursively remove any entry spending an outpoint `tx` also spends.
    pub fn remove_conflicts(&self, tx: &Transaction) {
        let removed = self.write().remove_conflicts(tx);
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
    }

    /// Re-evaluate all entries against a new tip after a reorg, removing
    /// whatever is no longer minable.
    pub fn remove_for_reorg<B: CoinView>(
        &self,
        coins: &mut CoinsViewCache<B>,
        chain: &dyn ChainView,
    ) {
        let removed = self.write().remove_for_reorg(coins, chain);
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
    }

    /// Evict lowest-scoring packages until dynamic usage fits `size_limit`.
    pub fn trim_to_size(&self, size_limit: usize, no_spends_remaining: Option<&mut Vec<OutPoint>>) {
        let removed = self.write().trim_to_size(size_limit, no_spends_remaining);
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
    }

    /// Remove every entry older than `time` (and its descendants).
    /// Returns the number removed.
    pub fn expire(&self, time: i64) -> usize {
        let removed = self.write().expire(time);
        self.transactions_updated
            .fetch_add(removed as u32, Ordering::SeqCst);
        removed
    }

    /// Repair descendant state after reorg replay; see
    /// [`MemPoolInner::update_transactions_from_block`].
    pub fn update_transactions_from_block(&self, hashes_to_update: &[Txid]) {
        self.write().update_transactions_from_block(hashes_to_update);
        self.transactions_updated.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop all entries. Priority deltas survive.
    pub fn clear(&self) {
        self.write().clear(Self::current_time());
        self.transactions_updated.fetch_add(1, Ordering::SeqCst);
    }

    // === Prioritisation ===

    /// Bias `txid` by `fee_delta` for mining order, persistently.
    pub fn prioritise_transaction(&self, txid: &Txid, fee_delta: SignedAmount) {
        self.write().prioritise_transaction(*txid, fee_delta);
        self.transactions_updated.fetch_add(1, Ordering::SeqCst);
    }

    /// Add the stored bias for `txid`, if any, to an external fee value.
    pub fn apply_delta(&self, txid: &Txid, fee: &mut SignedAmount) {
        self.read().apply_delta(txid, fee);
    }

    /// Forget the stored bias for `txid` (e.g. once it is mined).
    pub fn clear_prioritisation(&self, txid: &Txid) {
        self.write().clear_prioritisation(txid);
    }

    // === Queries ===

    pub fn exists(&self, txid: &Txid) -> bool {
        self.read().exists(txid)
    }

    pub fn exists_wtxid(&self, wtxid: &Wtxid) -> bool {
        self.read().exists_wtxid(wtxid)
    }

    pub fn get(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.read().get(txid)
    }

    pub fn info(&self, txid: &Txid) -> Option<TxMempoolInfo> {
        self.read().info(txid)
    }

    /// All entries, sorted by depth and score.
    pub fn info_all(&self) -> Vec<TxMempoolInfo> {
        self.read().info_all()
    }

    pub fn size(&self) -> usize {
        self.read().size()
    }

    pub fn total_tx_size(&self) -> u64 {
        self.read().total_tx_size()
    }

    pub fn total_fee(&self) -> bitcoin::Amount {
        self.read().total_fee()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.read().dynamic_memory_usage()
    }

    /// All ids, sorted by depth and score.
    pub fn query_hashes(&self) -> Vec<Txid> {
        self.read().query_hashes()
    }

    /// Whether none of `tx`'s inputs are in the pool.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        self.read().has_no_inputs_of(tx)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.read().is_spent(outpoint)
    }

    /// False if the transaction is in the pool and beyond the given chain
    /// limit in either direction.
    pub fn transaction_within_chain_limit(&self, txid: &Txid, chain_limit: u64) -> bool {
        self.read().transaction_within_chain_limit(txid, chain_limit)
    }

    /// Orders two ids by their descendant-score index position. False if
    /// either is absent.
    pub fn compare_depth_and_score(&self, a: &Txid, b: &Txid) -> bool {
        self.read().compare_depth_and_score(a, b)
    }

    /// The minimum feerate to get into the pool; see
    /// [`ROLLING_FEE_HALFLIFE`] for the decay behavior.
    pub fn get_min_fee(&self, size_limit: usize) -> FeeRate {
        self.write().get_min_fee(
            size_limit,
            self.options.incremental_relay_feerate,
            Self::current_time(),
        )
    }

    /// Txids with their feerates in mining order.
    pub fn iter_txids_by_priority(&self) -> Vec<(Txid, FeeRate)> {
        self.read().iter_txids_by_priority()
    }

    // === Relay bookkeeping ===

    /// Transactions not yet announced to peers, with their feerates.
    pub fn pending_broadcast(&self) -> Vec<(Txid, FeeRate)> {
        self.read().pending_broadcast()
    }

    /// Mark transactions as announced.
    pub fn mark_broadcast(&self, txids: &[Txid]) {
        self.write().mark_broadcast(txids);
    }

    // === Notifications ===

    /// Subscribe to entry-added events. The callback runs inside the pool's
    /// critical section and must not call back into the pool.
    pub fn on_entry_added(&self, f: impl Fn(&Arc<Transaction>) + Send + Sync + 'static) {
        self.write().notifications.on_entry_added(Box::new(f));
    }

    /// Subscribe to entry-removed events. Same reentrancy rules as
    /// [`Self::on_entry_added`].
    pub fn on_entry_removed(
        &self,
        f: impl Fn(&Arc<Transaction>, RemovalReason) + Send + Sync + 'static,
    ) {
        self.write().notifications.on_entry_removed(Box::new(f));
    }

    // === Maintenance ===

    pub fn transactions_updated(&self) -> u32 {
        self.transactions_updated.load(Ordering::SeqCst)
    }

    pub fn add_transactions_updated(&self, n: u32) {
        self.transactions_updated.fetch_add(n, Ordering::SeqCst);
    }

    /// Set the sanity-check sampling ratio (0.0 disables, 1.0 checks every
    /// invocation).
    pub fn set_sanity_check(&self, ratio: f64) {
        let frequency = (ratio.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
        self.check_frequency.store(frequency, Ordering::SeqCst);
    }

    /// Probabilistically verify all pool invariants against `coins`,
    /// aborting on violation. A no-op unless sanity checking is enabled and
    /// this invocation is sampled.
    pub fn check(&self, coins: &dyn CoinView) {
        let frequency = self.check_frequency.load(Ordering::SeqCst);
        if frequency == 0 {
            return;
        }
        if frequency != u32::MAX && rand::random::<u32>() >= frequency {
            return;
        }
        self.read().check(coins);
    }
}
