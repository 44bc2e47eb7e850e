//! Scheduler configuration

use serde::{Deserialize, Serialize};

use crate::tensor::Context;

/// Configuration of one swap-in/swap-out scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Context describing the host memory class
    pub host_ctx: Context,

    /// Context describing the device memory class
    pub device_ctx: Context,

    /// Device memory budget in bytes
    ///
    /// Half of the budget is reserved for in-flight evictions, so prefetch
    /// never grows past `budget_bytes - budget_bytes / 2`.
    pub budget_bytes: u64,
}

impl SchedulerConfig {
    /// Create a configuration with the given contexts and budget
    pub fn new(host_ctx: Context, device_ctx: Context, budget_bytes: u64) -> Self {
        Self { host_ctx, device_ctx, budget_bytes }
    }

    /// Bytes the planner may keep reserved for in-flight evictions
    pub fn eviction_budget_bytes(&self) -> u64 {
        self.budget_bytes / 2
    }

    /// Bytes the planner may keep reserved for prefetched data
    pub fn prefetch_budget_bytes(&self) -> u64 {
        self.budget_bytes - self.eviction_budget_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_split() {
        let config = SchedulerConfig::new(
            Context::new("CpuCachedArray"),
            Context::new("CudaCachedArray"),
            100,
        );
        assert_eq!(config.eviction_budget_bytes(), 50);
        assert_eq!(config.prefetch_budget_bytes(), 50);

        let odd = SchedulerConfig::new(
            Context::new("CpuCachedArray"),
            Context::new("CudaCachedArray"),
            101,
        );
        // The odd byte stays on the prefetch side.
        assert_eq!(odd.eviction_budget_bytes(), 50);
        assert_eq!(odd.prefetch_budget_bytes(), 51);
    }
}
