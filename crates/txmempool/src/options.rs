use crate::types::FeeRate;
use std::time::Duration;

/// Ancestor/descendant chain limits enforced at admission time.
#[derive(Clone, Debug)]
pub struct MemPoolLimits {
    /// Maximum number of in-pool ancestors a transaction may have (itself included).
    pub max_ancestors: u64,

    /// Maximum total virtual size of a transaction plus its in-pool ancestors.
    pub max_ancestor_size: u64,

    /// Maximum number of in-pool descendants any ancestor may end up with.
    pub max_descendants: u64,

    /// Maximum total virtual size of any ancestor plus its in-pool descendants.
    pub max_descendant_size: u64,
}

impl Default for MemPoolLimits {
    fn default() -> Self {
        Self {
            max_ancestors: 25,
            max_ancestor_size: 101_000,
            max_descendants: 25,
            max_descendant_size: 101_000,
        }
    }
}

impl MemPoolLimits {
    /// Limits that never trigger, for callers that must not fail (reorg re-adds).
    pub fn unbounded() -> Self {
        Self {
            max_ancestors: u64::MAX,
            max_ancestor_size: u64::MAX,
            max_descendants: u64::MAX,
            max_descendant_size: u64::MAX,
        }
    }
}

/// Configuration options for the transaction memory pool.
#[derive(Clone, Debug)]
pub struct MemPoolOptions {
    /// Maximum dynamic memory usage of the pool in MB (default: 300).
    pub max_size_mb: usize,

    /// Number of hours to keep transactions in the pool.
    pub expiry_hours: u32,

    /// Feerate increment used to bound how long the rolling minimum feerate
    /// takes to decay back to zero.
    pub incremental_relay_feerate: FeeRate,

    /// Fraction of admissions after which the full invariant check runs.
    /// Zero disables checking.
    pub check_ratio: f64,

    pub limits: MemPoolLimits,
}

impl Default for MemPoolOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 300,
            expiry_hours: 336, // 2 weeks
            incremental_relay_feerate: FeeRate::from_sat_per_kvb(1000),
            check_ratio: 0.0,
            limits: MemPoolLimits::default(),
        }
    }
}

impl MemPoolOptions {
    /// Create new mempool options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuring mempool options.
    pub fn builder() -> MemPoolOptionsBuilder {
        MemPoolOptionsBuilder::default()
    }

    /// Get the maximum size of the mempool in bytes.
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb * 1_000_000
    }

    /// Get the expiry duration.
    pub fn expiry_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_hours as u64 * 3600)
    }
}

/// Builder pattern for [`MemPoolOptions`].
#[derive(Default)]
pub struct MemPoolOptionsBuilder {
    options: MemPoolOptions,
}

impl MemPoolOptionsBuilder {
    /// Set maximum size of the mempool in MB.
    pub fn max_size_mb(mut self, size: usize) -> Self {
        self.options.max_size_mb = size;
        self
    }

    /// Set expiry time in hours.
    pub fn expiry_hours(mut self, hours: u32) -> Self {
        self.options.expiry_hours = hours;
        self
    }

    /// Set the incremental relay feerate (sat/kvB).
    pub fn incremental_relay_feerate(mut self, rate: u64) -> Self {
        self.options.incremental_relay_feerate = FeeRate::from_sat_per_kvb(rate);
        self
    }

    /// Set the invariant checking ratio (0.0 disables, 1.0 checks every admission).
    pub fn check_ratio(mut self, ratio: f64) -> Self {
        self.options.check_ratio = ratio;
        self
    }

    /// Set maximum number of ancestors.
    pub fn max_ancestors(mut self, count: u64) -> Self {
        self.options.limits.max_ancestors = count;
        self
    }

    /// Set maximum ancestor size.
    pub fn max_ancestor_size(mut self, size: u64) -> Self {
        self.options.limits.max_ancestor_size = size;
        self
    }

    /// Set maximum number of descendants.
    pub fn max_descendants(mut self, count: u64) -> Self {
        self.options.limits.max_descendants = count;
        self
    }

    /// Set maximum descendant size.
    pub fn max_descendant_size(mut self, size: u64) -> Self {
        self.options.limits.max_descendant_size = size;
        self
    }

    /// Build the final [`MemPoolOptions`].
    pub fn build(self) -> MemPoolOptions {
        self.options
    }
}
