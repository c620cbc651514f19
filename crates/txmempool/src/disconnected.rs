//! Staging buffer for transactions from disconnected blocks.
//!
//! During a reorg it is cheaper to collect the disconnected transactions
//! (in order), drop any that the new chain reconfirms, and re-process the
//! remainder once the reorg completes, than to re-accept mid-reorg. The
//! buffer keeps two views of the same set: unique by txid, and sequenced by
//! insertion.

use crate::memusage;
use bitcoin::{Transaction, Txid};
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

/// Ordered, id-unique staging of disconnected-block transactions.
///
/// The buffer must be drained (replayed into the pool or cleared) before it
/// is dropped; a surviving entry at drop signals a reorg-processing bug and
/// aborts.
#[derive(Default)]
pub struct DisconnectedBlockTransactions {
    /// Insertion sequence -> transaction.
    queued_tx: BTreeMap<u64, Arc<Transaction>>,
    by_txid: HashMap<Txid, u64>,
    next_seq: u64,
    cached_inner_usage: usize,
}

impl DisconnectedBlockTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a single transaction. Duplicate ids are ignored.
    pub fn add_transaction(&mut self, tx: Arc<Transaction>) {
        let txid = tx.compute_txid();
        if self.by_txid.contains_key(&txid) {
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.cached_inner_usage += tx_usage(&tx);
        self.by_txid.insert(txid, seq);
        self.queued_tx.insert(seq, tx);
    }

    /// Stage a disconnected block's transactions.
    ///
    /// The block is walked in reverse, so that iterating the buffer's
    /// insertion order in reverse replays each block in its original
    /// (parents-first) order.
    pub fn add_for_block(&mut self, vtx: &[Arc<Transaction>]) {
        for tx in vtx.iter().rev() {
            self.add_transaction(tx.clone());
        }
    }

    /// Drop any staged transaction reconfirmed by a newly connected block.
    pub fn remove_for_block(&mut self, vtx: &[Arc<Transaction>]) {
        // Short-circuit in the common case of a block extending the tip.
        if self.queued_tx.is_empty() {
            return;
        }

        for tx in vtx {
            if let Some(seq) = self.by_txid.remove(&tx.compute_txid()) {
                let removed = self.queued_tx.remove(&seq).expect("indexes in sync");
                self.cached_inner_usage -= tx_usage(&removed);
            }
        }
    }

    /// Remove one staged transaction by its insertion sequence.
    pub fn remove_entry(&mut self, seq: u64) -> Option<Arc<Transaction>> {
        let tx = self.queued_tx.remove(&seq)?;
        self.by_txid.remove(&tx.compute_txid());
        self.cached_inner_usage -= tx_usage(&tx);
        Some(tx)
    }

    pub fn clear(&mut self) {
        self.queued_tx.clear();
        self.by_txid.clear();
        self.cached_inner_usage = 0;
    }

    /// Staged transactions in insertion order, with their sequence numbers.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, &Arc<Transaction>)> {
        self.queued_tx.iter().map(|(seq, tx)| (*seq, tx))
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.by_txid.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.queued_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued_tx.is_empty()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        memusage::malloc_usage(mem::size_of::<Arc<Transaction>>() + 6 * mem::size_of::<usize>())
            * self.queued_tx.len()
            + self.cached_inner_usage
    }
}

fn tx_usage(tx: &Transaction) -> usize {
    memusage::malloc_usage(mem::size_of::<Transaction>() + tx.total_size())
}

impl Drop for DisconnectedBlockTransactions {
    fn drop(&mut self) {
        // Leftover entries mean the reorg-processing code failed to replay
        // or discard them; the pool would silently lose transactions.
        if !std::thread::panicking() {
            assert!(
                self.queued_tx.is_empty(),
                "disconnected-block buffer dropped with {} staged transactions",
                self.queued_tx.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn tx(tag: u8) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([tag; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence(0xFFFF_FFFF),
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: ScriptBuf::new(),
            }],
        })
    }

    #[test]
    fn block_order_replays_parents_first() {
        let mut buffer = DisconnectedBlockTransactions::new();
        let parent = tx(1);
        let child = tx(2);
        buffer.add_for_block(&[parent.clone(), child.clone()]);

        // Reverse insertion order restores block order.
        let replay: Vec<Txid> = buffer
            .iter()
            .rev()
            .map(|(_, tx)| tx.compute_txid())
            .collect();
        assert_eq!(replay, vec![parent.compute_txid(), child.compute_txid()]);

        buffer.clear();
    }

    #[test]
    fn reconfirmed_transactions_are_dropped() {
        let mut buffer = DisconnectedBlockTransactions::new();
        let a = tx(1);
        let b = tx(2);
        buffer.add_for_block(&[a.clone(), b.clone()]);
        assert_eq!(buffer.len(), 2);

        buffer.remove_for_block(&[a.clone()]);
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.contains(&a.compute_txid()));
        assert!(buffer.contains(&b.compute_txid()));

        buffer.clear();
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let mut buffer = DisconnectedBlockTransactions::new();
        let a = tx(1);
        buffer.add_transaction(a.clone());
        let usage = buffer.dynamic_memory_usage();
        buffer.add_transaction(a.clone());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.dynamic_memory_usage(), usage);

        buffer.clear();
    }

    #[test]
    fn usage_tracks_contents() {
        let mut buffer = DisconnectedBlockTransactions::new();
        assert_eq!(buffer.dynamic_memory_usage(), 0);

        buffer.add_transaction(tx(1));
        let one = buffer.dynamic_memory_usage();
        assert!(one > 0);

        buffer.add_transaction(tx(2));
        assert!(buffer.dynamic_memory_usage() > one);

        buffer.clear();
        assert_eq!(buffer.dynamic_memory_usage(), 0);
    }

    #[test]
    #[should_panic(expected = "disconnected-block buffer dropped")]
    fn drop_with_staged_entries_panics() {
        let mut buffer = DisconnectedBlockTransactions::new();
        buffer.add_transaction(tx(1));
        drop(buffer);
    }
}
