//! Execution statistics: instruction count, cost and timing.
//!
//! The engine meters by uniform fuel, one unit per instruction. A cost table
//! therefore collapses to a single weight (its largest entry) that multiplies
//! the instruction count. Host-function cost is added on top.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wasm_embed_common::StatisticsOptions;

#[derive(Debug)]
struct Counters {
    instr_count: u64,
    host_cost: u64,
    elapsed: Duration,
    cost_weight: u64,
    cost_limit: u64,
}

/// Shared statistics counters. Clones observe the same counters.
#[derive(Debug, Clone)]
pub struct Statistics {
    inner: Arc<Mutex<Counters>>,
}

impl Statistics {
    pub fn new(options: &StatisticsOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counters {
                instr_count: 0,
                host_cost: 0,
                elapsed: Duration::ZERO,
                cost_weight: 1,
                cost_limit: options.cost_limit,
            })),
        }
    }

    /// Instructions executed since the last [`Statistics::clear`].
    pub fn instr_count(&self) -> u64 {
        self.inner.lock().instr_count
    }

    /// Instructions per second of measured execution time.
    pub fn instr_per_second(&self) -> f64 {
        let counters = self.inner.lock();
        let secs = counters.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = counters.instr_count as f64;
        count / secs
    }

    /// Weighted instruction cost plus host-function cost.
    pub fn total_cost(&self) -> u64 {
        let counters = self.inner.lock();
        Self::total(&counters)
    }

    /// Wall-clock time spent executing.
    pub fn execution_time(&self) -> Duration {
        self.inner.lock().elapsed
    }

    /// Set per-instruction costs. The largest entry becomes the uniform weight;
    /// an empty table resets it to 1.
    pub fn set_cost_table(&self, table: &[u64]) {
        let weight = table.iter().copied().max().unwrap_or(1).max(1);
        self.inner.lock().cost_weight = weight;
    }

    pub fn cost_weight(&self) -> u64 {
        self.inner.lock().cost_weight
    }

    /// Cap on the total cost. Executions that would exceed it stop with
    /// [`wasm_embed_common::RuntimeError::CostLimitExceeded`].
    pub fn set_cost_limit(&self, limit: u64) {
        self.inner.lock().cost_limit = limit;
    }

    pub fn cost_limit(&self) -> u64 {
        self.inner.lock().cost_limit
    }

    /// Reset the counters. The cost table and limit are kept.
    pub fn clear(&self) {
        let mut counters = self.inner.lock();
        counters.instr_count = 0;
        counters.host_cost = 0;
        counters.elapsed = Duration::ZERO;
    }

    /// Fuel the next execution may burn before hitting the cost limit.
    pub(crate) fn fuel_budget(&self) -> u64 {
        let counters = self.inner.lock();
        if counters.cost_limit == u64::MAX {
            return u64::MAX;
        }
        let remaining = counters.cost_limit.saturating_sub(Self::total(&counters));
        remaining / counters.cost_weight
    }

    pub(crate) fn record(&self, instructions: u64, host_cost: u64, elapsed: Duration) {
        let mut counters = self.inner.lock();
        counters.instr_count = counters.instr_count.saturating_add(instructions);
        counters.host_cost = counters.host_cost.saturating_add(host_cost);
        counters.elapsed += elapsed;
    }

    fn total(counters: &Counters) -> u64 {
        counters
            .instr_count
            .saturating_mul(counters.cost_weight)
            .saturating_add(counters.host_cost)
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(&StatisticsOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cost_uses_weight_and_host_cost() {
        let stats = Statistics::default();
        stats.record(10, 0, Duration::from_millis(1));
        assert_eq!(stats.total_cost(), 10);

        stats.set_cost_table(&[1, 3, 2]);
        assert_eq!(stats.cost_weight(), 3);
        stats.record(0, 5, Duration::ZERO);
        assert_eq!(stats.total_cost(), 35);
    }

    #[test]
    fn test_empty_cost_table_resets_weight() {
        let stats = Statistics::default();
        stats.set_cost_table(&[4]);
        stats.set_cost_table(&[]);
        assert_eq!(stats.cost_weight(), 1);
        stats.set_cost_table(&[0, 0]);
        assert_eq!(stats.cost_weight(), 1);
    }

    #[test]
    fn test_fuel_budget() {
        let stats = Statistics::default();
        assert_eq!(stats.fuel_budget(), u64::MAX);

        stats.set_cost_limit(100);
        stats.set_cost_table(&[2]);
        assert_eq!(stats.fuel_budget(), 50);

        stats.record(20, 10, Duration::ZERO);
        // 100 - (20 * 2 + 10) = 50 cost left, 25 instructions
        assert_eq!(stats.fuel_budget(), 25);

        stats.record(100, 0, Duration::ZERO);
        assert_eq!(stats.fuel_budget(), 0);
    }

    #[test]
    fn test_instr_per_second() {
        let stats = Statistics::default();
        assert!(stats.instr_per_second().abs() < f64::EPSILON);

        stats.record(1000, 0, Duration::from_millis(500));
        assert!((stats.instr_per_second() - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_clear_keeps_table_and_limit() {
        let stats = Statistics::default();
        stats.set_cost_table(&[3]);
        stats.set_cost_limit(9);
        stats.record(1, 1, Duration::from_millis(1));

        stats.clear();
        assert_eq!(stats.instr_count(), 0);
        assert_eq!(stats.total_cost(), 0);
        assert_eq!(stats.execution_time(), Duration::ZERO);
        assert_eq!(stats.cost_weight(), 3);
        assert_eq!(stats.cost_limit(), 9);
    }

    #[test]
    fn test_clones_share_counters() {
        let stats = Statistics::default();
        let other = stats.clone();
        other.record(7, 0, Duration::ZERO);
        assert_eq!(stats.instr_count(), 7);
    }
}
