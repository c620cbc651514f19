//! Dynamic minimum feerate for pool admission.
//!
//! The floor rises to the feerate of evicted packages while the pool is
//! trimming, and decays exponentially during calm periods, so new
//! transactions face a predictable admission threshold.

use crate::types::FeeRate;

/// Half-life of the rolling minimum feerate decay, in seconds.
pub const ROLLING_FEE_HALFLIFE: i64 = 60 * 60 * 12;

/// Exponentially decaying admission floor.
///
/// Decay is gated on a block having been connected since the last bump:
/// repeated evictions between blocks keep the floor pinned at the highest
/// evicted rate.
#[derive(Debug)]
pub(crate) struct RollingFeeRate {
    /// Current floor in sat/kvB.
    rate: f64,
    last_update: i64,
    block_since_bump: bool,
}

impl RollingFeeRate {
    pub(crate) fn new(now: i64) -> Self {
        Self {
            rate: 0.0,
            last_update: now,
            block_since_bump: false,
        }
    }

    pub(crate) fn reset(&mut self, now: i64) {
        self.rate = 0.0;
        self.last_update = now;
        self.block_since_bump = false;
    }

    /// Record a block connection: stamp the decay clock and allow decay again.
    pub(crate) fn on_block_connected(&mut self, now: i64) {
        self.last_update = now;
        self.block_since_bump = true;
    }

    /// Raise the floor to the feerate of an evicted package. Returns whether
    /// the floor moved.
    pub(crate) fn track_package_removed(&mut self, rate: FeeRate) -> bool {
        let rate = rate.as_sat_per_kvb() as f64;
        if rate > self.rate {
            self.rate = rate;
            self.block_since_bump = false;
            true
        } else {
            false
        }
    }

    /// Current admission floor.
    ///
    /// Halves every [`ROLLING_FEE_HALFLIFE`] seconds once a block has been
    /// connected since the last bump; the half-life shrinks when usage is
    /// well below the size limit. Snaps to zero once the decayed rate drops
    /// under half of `incremental`, bounding how long the tail of the decay
    /// lingers.
    pub(crate) fn get_min_fee(
        &mut self,
        size_limit: usize,
        usage: usize,
        incremental: FeeRate,
        now: i64,
    ) -> FeeRate {
        if !self.block_since_bump || self.rate == 0.0 {
            return FeeRate(self.rate.round() as u64);
        }

        if now > self.last_update + 10 {
            let mut halflife = ROLLING_FEE_HALFLIFE as f64;
            if usage < size_limit / 4 {
                halflife /= 4.0;
            } else if usage < size_limit / 2 {
                halflife /= 2.0;
            }

            self.rate /= 2f64.powf((now - self.last_update) as f64 / halflife);
            self.last_update = now;

            if self.rate < incremental.as_sat_per_kvb() as f64 / 2.0 {
                self.rate = 0.0;
                return FeeRate::ZERO;
            }
        }

        FeeRate((self.rate.round() as u64).max(incremental.as_sat_per_kvb()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INCREMENTAL: FeeRate = FeeRate(1000);

    #[test]
    fn bump_records_highest_rate() {
        let mut rolling = RollingFeeRate::new(0);
        assert!(rolling.track_package_removed(FeeRate(5000)));
        assert!(!rolling.track_package_removed(FeeRate(4000)));
        assert!(rolling.track_package_removed(FeeRate(6000)));

        // No block since the bump: the raw rate is reported undecayed.
        assert_eq!(
            rolling.get_min_fee(1_000_000, 1_000_000, INCREMENTAL, 100_000),
            FeeRate(6000)
        );
    }

    #[test]
    fn decays_by_half_life_after_block() {
        let mut rolling = RollingFeeRate::new(0);
        rolling.track_package_removed(FeeRate(8000));
        rolling.on_block_connected(0);

        // Usage at the limit: plain half-life. One half-life halves the rate.
        let rate = rolling.get_min_fee(1_000_000, 1_000_000, INCREMENTAL, ROLLING_FEE_HALFLIFE);
        assert_eq!(rate, FeeRate(4000));
    }

    #[test]
    fn snaps_to_zero_below_half_incremental() {
        let mut rolling = RollingFeeRate::new(0);
        rolling.track_package_removed(FeeRate(8000));
        rolling.on_block_connected(0);

        // After many half-lives the decayed rate is far below incremental/2.
        let rate = rolling.get_min_fee(
            1_000_000,
            1_000_000,
            INCREMENTAL,
            ROLLING_FEE_HALFLIFE * 10,
        );
        assert_eq!(rate, FeeRate::ZERO);

        // And stays there without further decay computation.
        let rate = rolling.get_min_fee(
            1_000_000,
            1_000_000,
            INCREMENTAL,
            ROLLING_FEE_HALFLIFE * 11,
        );
        assert_eq!(rate, FeeRate::ZERO);
    }

    #[test]
    fn floor_never_reports_below_incremental_while_active() {
        let mut rolling = RollingFeeRate::new(0);
        rolling.track_package_removed(FeeRate(2100));
        rolling.on_block_connected(0);

        // Decayed to 1050, still above incremental/2; reported rate is
        // clamped up to the incremental relay feerate.
        let rate = rolling.get_min_fee(1_000_000, 1_000_000, INCREMENTAL, ROLLING_FEE_HALFLIFE);
        assert_eq!(rate, FeeRate(1050));

        let rate = rolling.get_min_fee(
            1_000_000,
            1_000_000,
            INCREMENTAL,
            ROLLING_FEE_HALFLIFE + ROLLING_FEE_HALFLIFE / 2,
        );
        assert!(rate >= INCREMENTAL);
    }
}
