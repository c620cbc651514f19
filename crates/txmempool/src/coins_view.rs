//! Coin lookup seams consumed and exposed by the pool.
//!
//! The pool never owns chain state. It consumes a read-only [`CoinView`]
//! (plus a [`ChainView`] for reorg re-checks) and exposes
//! [`CoinsViewMemPool`], which layers unconfirmed pool outputs on top of a
//! base view so validation can evaluate candidates spending in-pool parents.

use crate::MemPool;
use bitcoin::{BlockHash, OutPoint, TxOut};
use schnellru::{ByLength, LruMap};

/// Fake height value used in [`Coin`] to signify it is only in the memory pool.
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

/// An unspent transaction output together with its confirmation metadata.
#[derive(Debug, Clone)]
pub struct Coin {
    pub output: TxOut,
    /// Confirmation height, or [`MEMPOOL_HEIGHT`] for pool-synthesized coins.
    pub height: u32,
    pub is_coinbase: bool,
    /// Median-time-past of the confirming block (0 for pool coins).
    pub median_time_past: i64,
}

/// Read-only coin lookup over the best chain's UTXO set.
pub trait CoinView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }
}

/// Read-only view of the active chain, consumed by reorg handling.
pub trait ChainView {
    /// Height of the current best tip.
    fn height(&self) -> u32;

    /// Median-time-past of the current best tip.
    fn median_time_past(&self) -> i64;

    /// Whether the block is an ancestor of (or equal to) the best tip.
    fn is_on_active_chain(&self, block: &BlockHash) -> bool;

    /// Hash of the active-chain block at the given height.
    fn ancestor_hash(&self, height: u32) -> Option<BlockHash>;
}

/// LRU-fronted coin cache over a base view.
///
/// Reorg processing re-checks every pool entry's inputs; the cache keeps
/// repeated lookups of shared funding outputs cheap. Negative results are
/// cached too. Must be flushed (`on_block_connected`) whenever the base view
/// advances.
pub struct CoinsViewCache<B> {
    base: B,
    cache: LruMap<OutPoint, Option<Coin>, ByLength>,
}

impl<B: CoinView> CoinsViewCache<B> {
    pub fn new(base: B, cache_size: u32) -> Self {
        Self {
            base,
            cache: LruMap::new(ByLength::new(cache_size)),
        }
    }

    pub fn get_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        // A hit must promote the entry, or hot shared outpoints age out of
        // the LRU as fast as cold ones.
        if let Some(cached) = self.cache.get(outpoint) {
            return cached.clone();
        }

        let coin = self.base.get_coin(outpoint);
        self.cache.insert(*outpoint, coin.clone());
        coin
    }

    /// Batch-prefetch coins before a scan.
    pub fn ensure_coins(&mut self, outpoints: &[OutPoint]) {
        for outpoint in outpoints {
            // Existence probe only; recency is left to the real lookups.
            if self.cache.peek(outpoint).is_none() {
                let coin = self.base.get_coin(outpoint);
                self.cache.insert(*outpoint, coin);
            }
        }
    }

    /// Drop cached results; the base view has moved to a new tip.
    pub fn on_block_connected(&mut self) {
        self.cache.clear();
    }

    pub fn base(&self) -> &B {
        &self.base
    }
}

/// A [`CoinView`] that brings pool transactions into view.
///
/// Outputs of pool entries are reported as spendable coins at
/// [`MEMPOOL_HEIGHT`]; anything else defers to the base view. Spends by
/// other pool transactions are deliberately not masked here: callers want
/// every input available for script evaluation, and intra-pool double spends
/// are excluded by the pool's own spender map.
pub struct CoinsViewMemPool<'a> {
    base: &'a dyn CoinView,
    mempool: &'a MemPool,
}

impl<'a> CoinsViewMemPool<'a> {
    pub fn new(base: &'a dyn CoinView, mempool: &'a MemPool) -> Self {
        Self { base, mempool }
    }
}

impl CoinView for CoinsViewMemPool<'_> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(tx) = self.mempool.get(&outpoint.txid) {
            return tx.output.get(outpoint.vout as usize).map(|output| Coin {
                output: output.clone(),
                height: MEMPOOL_HEIGHT,
                is_coinbase: false,
                median_time_past: 0,
            });
        }

        self.base.get_coin(outpoint)
    }
}
