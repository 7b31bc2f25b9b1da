//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::writer::{DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_THRESHOLD};

/// Tuning knobs for a run.
///
/// # Examples
///
/// ```ignore
/// use evalgrid::orchestrator::OrchestratorConfig;
/// use std::time::Duration;
///
/// let config = OrchestratorConfig::new()
///     .with_max_concurrent_cells(10)
///     .with_store_flush_interval(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of cells in flight at once.
    pub max_concurrent_cells: usize,

    /// Flush the run store once this many results are pending.
    pub store_flush_threshold: usize,

    /// Flush the run store when the pending batch is this old.
    pub store_flush_interval: Duration,

    /// TTL of the polling-visible run state record in the key-value store.
    pub run_state_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorConfig {
    /// Default values: 5 concurrent cells, store batches of 10 flushed at
    /// least every 5 seconds, run state kept for 24 hours.
    pub fn new() -> Self {
        Self {
            max_concurrent_cells: 5,
            store_flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            store_flush_interval: DEFAULT_FLUSH_INTERVAL,
            run_state_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_max_concurrent_cells(mut self, max: usize) -> Self {
        self.max_concurrent_cells = max.max(1);
        self
    }

    pub fn with_store_flush_threshold(mut self, threshold: usize) -> Self {
        self.store_flush_threshold = threshold.max(1);
        self
    }

    pub fn with_store_flush_interval(mut self, interval: Duration) -> Self {
        self.store_flush_interval = interval;
        self
    }

    pub fn with_run_state_ttl(mut self, ttl: Duration) -> Self {
        self.run_state_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::new();
        assert_eq!(config.max_concurrent_cells, 5);
        assert_eq!(config.store_flush_threshold, 10);
        assert_eq!(config.store_flush_interval, Duration::from_secs(5));
        assert_eq!(config.run_state_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_builder_chain() {
        let config = OrchestratorConfig::new()
            .with_max_concurrent_cells(12)
            .with_store_flush_threshold(3)
            .with_store_flush_interval(Duration::from_millis(100));
        assert_eq!(config.max_concurrent_cells, 12);
        assert_eq!(config.store_flush_threshold, 3);
        assert_eq!(config.store_flush_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_concurrency_floor() {
        let config = OrchestratorConfig::new().with_max_concurrent_cells(0);
        assert_eq!(config.max_concurrent_cells, 1);
    }
}
