//! Locktime bookkeeping: absolute finality and BIP68 relative lock points.
//!
//! Lock points cache the chain height and median-time-past a transaction
//! needs before it can be mined. As long as the active chain still contains
//! the highest-height block funding the transaction, the cached values stay
//! valid across reorgs; otherwise they must be recomputed from the input
//! coins.

use crate::coins_view::{ChainView, Coin};
use bitcoin::absolute::{LockTime, LOCK_TIME_THRESHOLD};
use bitcoin::{BlockHash, OutPoint, Transaction};

/// Blocks a coinbase output must wait before being spent.
pub const COINBASE_MATURITY: u32 = 100;

const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
const SEQUENCE_LOCKTIME_GRANULARITY: i64 = 512;

/// Cached relative-locktime constraints of a pool entry.
#[derive(Debug, Clone, Default)]
pub struct LockPoints {
    /// First block height at which the transaction may be included.
    pub height: i32,
    /// Minimum median-time-past of the block prior to inclusion.
    pub time: i64,
    /// Highest block containing one of the inputs used in the calculation.
    pub max_input_block: Option<BlockHash>,
}

/// Whether the transaction's absolute locktime permits inclusion in a block
/// at `block_height` whose predecessor has median-time-past `block_mtp`.
pub fn is_final_tx(tx: &Transaction, block_height: u32, block_mtp: i64) -> bool {
    if tx.lock_time == LockTime::ZERO {
        return true;
    }

    let lock_time_limit = if tx.lock_time.to_consensus_u32() < LOCK_TIME_THRESHOLD {
        block_height as i64
    } else {
        block_mtp
    };

    if (tx.lock_time.to_consensus_u32() as i64) < lock_time_limit {
        return true;
    }

    tx.input.iter().all(|txin| txin.sequence.is_final())
}

/// Whether cached lock points survived a reorg.
///
/// If the calculation involved no confirmed inputs the points do not depend
/// on the chain at all; otherwise the recorded block must still be active.
pub fn lock_points_still_valid(lp: &LockPoints, chain: &dyn ChainView) -> bool {
    match &lp.max_input_block {
        Some(block) => chain.is_on_active_chain(block),
        None => true,
    }
}

/// Whether lock points permit inclusion at `block_height` / `block_mtp`.
pub fn evaluate_lock_points(lp: &LockPoints, block_height: u32, block_mtp: i64) -> bool {
    lp.height <= block_height as i32 && lp.time <= block_mtp
}

/// Compute lock points for `tx` from its input coins, for a candidate block
/// at `next_height`.
///
/// `resolve` must yield a coin for every input (pool outputs synthesized at
/// the candidate height, confirmed outputs at their real height). Returns
/// `None` when an input is unavailable or a coinbase input fails to disable
/// its sequence lock, both of which make the transaction unminable.
pub fn calculate_lock_points(
    tx: &Transaction,
    mut resolve: impl FnMut(&OutPoint) -> Option<Coin>,
    chain: &dyn ChainView,
    next_height: u32,
) -> Option<LockPoints> {
    let mut lock_height: i32 = 0;
    let mut lock_time: i64 = 0;
    let mut max_input_height: Option<u32> = None;

    for input in &tx.input {
        let coin = resolve(&input.previous_output)?;
        let sequence = input.sequence.0;

        if coin.is_coinbase && (sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG) == 0 {
            return None;
        }

        if coin.height < next_height {
            max_input_height = Some(max_input_height.unwrap_or(0).max(coin.height));
        }

        if (sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            continue;
        }

        let masked = sequence & SEQUENCE_LOCKTIME_MASK;

        if (sequence & SEQUENCE_LOCKTIME_TYPE_FLAG) == 0 {
            let min_height = coin.height.checked_add(masked)?;
            lock_height = lock_height.max(min_height as i32);
        } else {
            let offset = (masked as i64).checked_mul(SEQUENCE_LOCKTIME_GRANULARITY)?;
            let min_time = coin.median_time_past.checked_add(offset)?;
            lock_time = lock_time.max(min_time);
        }
    }

    let max_input_block = max_input_height.and_then(|height| chain.ancestor_hash(height));

    Some(LockPoints {
        height: lock_height,
        time: lock_time,
        max_input_block,
    })
}
