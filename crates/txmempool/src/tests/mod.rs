//! Scenario tests for the pool: aggregate bookkeeping, limits, eviction,
//! prioritisation, block connection and reorg replay.

use crate::coins_view::{ChainView, Coin, CoinView};
use crate::locks::LockPoints;
use crate::{MemPool, TxMemPoolEntry};
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

mod reorg_tests;

/// Fluent transaction builder for tests.
pub struct TxBuilder {
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, outpoint: OutPoint, sequence: u32) -> Self {
        self.inputs.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::default(),
            sequence: Sequence(sequence),
            witness: Witness::default(),
        });
        self
    }

    pub fn output(mut self, value: Amount, script_pubkey: ScriptBuf) -> Self {
        self.outputs.push(TxOut {
            value,
            script_pubkey,
        });
        self
    }

    pub fn build(self) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: self.inputs,
            output: self.outputs,
        })
    }
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A throwaway P2PKH script.
pub fn dummy_script() -> ScriptBuf {
    ScriptBuf::from_hex("76a914000000000000000000000000000000000000000088ac").unwrap()
}

/// A confirmed outpoint outside the pool, distinct per tag.
pub fn funding_outpoint(tag: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([tag; 32]),
        vout,
    }
}

/// The outpoint of one of `tx`'s outputs.
pub fn spend(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout,
    }
}

/// A simple single-input single-output spend of `outpoint`.
pub fn simple_tx(outpoint: OutPoint, value: u64) -> Arc<Transaction> {
    TxBuilder::new()
        .input(outpoint, 0xFFFF_FFFF)
        .output(Amount::from_sat(value), dummy_script())
        .build()
}

/// Build a pool entry with the given fee and admission time.
pub fn entry(tx: &Arc<Transaction>, fee: u64, time: i64) -> TxMemPoolEntry {
    TxMemPoolEntry::new(
        tx.clone(),
        Amount::from_sat(fee),
        time,
        1,
        false,
        4,
        LockPoints::default(),
    )
}

/// Build an entry with explicit lock points and coinbase-spend flag.
pub fn entry_with(
    tx: &Arc<Transaction>,
    fee: u64,
    time: i64,
    spends_coinbase: bool,
    lock_points: LockPoints,
) -> TxMemPoolEntry {
    TxMemPoolEntry::new(
        tx.clone(),
        Amount::from_sat(fee),
        time,
        1,
        spends_coinbase,
        4,
        lock_points,
    )
}

/// Coin view resolving specific outpoints, with an optional catch-all coin
/// so invariant checks can resolve arbitrary funding inputs.
pub struct MockCoinView {
    coins: HashMap<OutPoint, Coin>,
    default_coin: bool,
}

impl MockCoinView {
    /// A view that resolves every outpoint to a plain confirmed coin.
    pub fn new() -> Self {
        Self {
            coins: HashMap::new(),
            default_coin: true,
        }
    }

    /// A view that only resolves explicitly added coins.
    pub fn empty() -> Self {
        Self {
            coins: HashMap::new(),
            default_coin: false,
        }
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }
}

impl CoinView for MockCoinView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(coin) = self.coins.get(outpoint) {
            return Some(coin.clone());
        }
        self.default_coin.then(|| coin_at(1, 0, false))
    }
}

pub fn coin_at(height: u32, median_time_past: i64, is_coinbase: bool) -> Coin {
    Coin {
        output: TxOut {
            value: Amount::from_sat(100_000),
            script_pubkey: dummy_script(),
        },
        height,
        is_coinbase,
        median_time_past,
    }
}

/// Fixed-tip chain view for reorg tests.
pub struct MockChain {
    pub height: u32,
    pub mtp: i64,
    pub active: HashSet<BlockHash>,
}

impl MockChain {
    pub fn at(height: u32, mtp: i64) -> Self {
        Self {
            height,
            mtp,
            active: HashSet::new(),
        }
    }
}

impl ChainView for MockChain {
    fn height(&self) -> u32 {
        self.height
    }

    fn median_time_past(&self) -> i64 {
        self.mtp
    }

    fn is_on_active_chain(&self, block: &BlockHash) -> bool {
        self.active.contains(block)
    }

    fn ancestor_hash(&self, height: u32) -> Option<BlockHash> {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&height.to_le_bytes());
        Some(BlockHash::from_byte_array(bytes))
    }
}

pub fn assert_in_mempool(pool: &MemPool, txid: &Txid) {
    assert!(
        pool.exists(txid),
        "expected transaction {txid} to be in mempool"
    );
}

pub fn assert_not_in_mempool(pool: &MemPool, txid: &Txid) {
    assert!(
        !pool.exists(txid),
        "expected transaction {txid} to NOT be in mempool"
    );
}

pub fn assert_mempool_size(pool: &MemPool, expected: usize) {
    let actual = pool.size();
    assert_eq!(actual, expected, "expected mempool size {expected}, got {actual}");
}

/// Run the full invariant check against a permissive coin view.
pub fn check_pool(pool: &MemPool) {
    pool.inner
        .read()
        .expect("mempool lock poisoned")
        .check(&MockCoinView::new());
}
