//! Core type definitions for the mempool.

use bitcoin::{Amount, SignedAmount, Transaction, Txid};
use slotmap::DefaultKey;
use std::fmt;
use std::sync::Arc;

/// Handle to an entry in the mempool arena.
///
/// Handles stay valid until the entry is removed; they are how entries refer
/// to each other in the parent/child link sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) DefaultKey);

/// Fee rate in satoshis per virtual kilobyte.
///
/// All conversions are total: the sat/kvB scaling is done in 128 bits and
/// saturates at `u64::MAX` rather than overflowing, and a feerate over a
/// non-positive size simply does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate(pub u64);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    /// Create fee rate from satoshis per virtual byte.
    pub const fn from_sat_per_vb(sat_vb: u64) -> Self {
        Self(sat_vb.saturating_mul(1000))
    }

    /// Create fee rate from satoshis per kilovirtual byte.
    pub const fn from_sat_per_kvb(sat_kvb: u64) -> Self {
        Self(sat_kvb)
    }

    /// Feerate of `fee` spread over `vsize` virtual bytes, rounded down.
    /// `None` when the size is not positive.
    pub fn from_fee_and_vsize(fee: Amount, vsize: i64) -> Option<Self> {
        if vsize <= 0 {
            return None;
        }

        let sat_kvb = fee.to_sat() as u128 * 1000 / vsize as u128;
        Some(Self(u64::try_from(sat_kvb).unwrap_or(u64::MAX)))
    }

    /// The fee this rate implies for `vsize` virtual bytes, rounded down.
    /// Non-positive sizes cost nothing.
    pub fn fee_for(&self, vsize: i64) -> Amount {
        if vsize <= 0 {
            return Amount::ZERO;
        }

        let sats = self.0 as u128 * vsize as u128 / 1000;
        Amount::from_sat(u64::try_from(sats).unwrap_or(u64::MAX))
    }

    /// Get the fee rate in satoshis per kilovirtual byte.
    pub fn as_sat_per_kvb(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/kvB", self.0)
    }
}

/// Widen an unsigned amount for signed aggregate arithmetic.
pub(crate) fn signed(amount: Amount) -> SignedAmount {
    SignedAmount::from_sat(amount.to_sat() as i64)
}

/// Reason a transaction left the mempool, passed to removal notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Manually removed or unknown reason.
    Unknown,
    /// Expired from the mempool.
    Expiry,
    /// Evicted while trimming to the size limit.
    SizeLimit,
    /// Removed during chain reorganization.
    Reorg,
    /// Included in a block.
    Block,
    /// Conflicted with an in-block transaction.
    Conflict,
    /// Replaced by a higher-fee transaction.
    Replaced,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Expiry => "expiry",
            Self::SizeLimit => "sizelimit",
            Self::Reorg => "reorg",
            Self::Block => "block",
            Self::Conflict => "conflict",
            Self::Replaced => "replaced",
        }
    }
}

/// Information about a mempool transaction, as reported to external callers.
#[derive(Debug, Clone)]
pub struct TxMempoolInfo {
    /// The transaction itself.
    pub tx: Arc<Transaction>,
    /// Time the transaction entered the mempool.
    pub time: i64,
    /// Feerate of the transaction (base fee, not modified).
    pub fee_rate: FeeRate,
    /// The persistent priority delta applied to this transaction.
    pub fee_delta: SignedAmount,
}

/// Collaborator notified about confirmed entries and removals, so fee
/// estimation can track what the pool observed.
pub trait BlockPolicyEstimator: Send + Sync {
    /// Called with the entries a connected block confirmed, before they are
    /// removed from the pool.
    fn process_block(&self, block_height: u32, entries: &[TxMempoolInfo]);

    /// Called for every entry leaving the pool.
    fn remove_tx(&self, txid: Txid);
}

pub(crate) type EntryAddedFn = Box<dyn Fn(&Arc<Transaction>) + Send + Sync>;
pub(crate) type EntryRemovedFn = Box<dyn Fn(&Arc<Transaction>, RemovalReason) + Send + Sync>;

/// Subscriber registry for entry lifecycle notifications.
///
/// Callbacks run synchronously inside the pool's critical section, in the
/// order the effecting mutations occurred. They must not call back into the
/// pool.
#[derive(Default)]
pub(crate) struct Notifications {
    added: Vec<EntryAddedFn>,
    removed: Vec<EntryRemovedFn>,
}

impl Notifications {
    pub(crate) fn on_entry_added(&mut self, f: EntryAddedFn) {
        self.added.push(f);
    }

    pub(crate) fn on_entry_removed(&mut self, f: EntryRemovedFn) {
        self.removed.push(f);
    }

    pub(crate) fn notify_added(&self, tx: &Arc<Transaction>) {
        for f in &self.added {
            f(tx);
        }
    }

    pub(crate) fn notify_removed(&self, tx: &Arc<Transaction>, reason: RemovalReason) {
        for f in &self.removed {
            f(tx, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feerate_construction_is_total() {
        assert_eq!(FeeRate::from_sat_per_vb(2).as_sat_per_kvb(), 2000);

        assert_eq!(
            FeeRate::from_fee_and_vsize(Amount::from_sat(300), 150),
            Some(FeeRate(2000))
        );
        // Rounds down, never up.
        assert_eq!(
            FeeRate::from_fee_and_vsize(Amount::from_sat(999), 1000),
            Some(FeeRate(999))
        );

        // No feerate without a size.
        assert_eq!(FeeRate::from_fee_and_vsize(Amount::from_sat(1), 0), None);
        assert_eq!(FeeRate::from_fee_and_vsize(Amount::from_sat(1), -7), None);

        // Absurd fees saturate instead of overflowing the kvB scaling.
        assert_eq!(
            FeeRate::from_fee_and_vsize(Amount::from_sat(u64::MAX), 1),
            Some(FeeRate(u64::MAX))
        );
    }

    #[test]
    fn feerate_fee_for_size() {
        let rate = FeeRate::from_sat_per_kvb(2500);
        assert_eq!(rate.fee_for(400), Amount::from_sat(1000));
        // Truncated, consistent with from_fee_and_vsize.
        assert_eq!(rate.fee_for(399), Amount::from_sat(997));
        assert_eq!(rate.fee_for(0), Amount::ZERO);
        assert_eq!(rate.fee_for(-3), Amount::ZERO);
    }
}
