//! Sync and admission configuration.

use std::time::Duration;

/// Limits for deferred admission and ancestor backfill.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a pending block may wait for its missing ancestors before it is dropped.
    pub pending_ttl: Duration,

    /// Maximum number of pending blocks held at once. The oldest is evicted when full.
    pub max_pending: usize,

    /// Delay between backfill attempts for the same missing ancestor.
    pub backfill_interval: Duration,

    /// Number of backfill requests sent per missing ancestor, the first one included.
    pub backfill_retries: u32,

    /// How often the sync loop sweeps expired pending blocks and retries backfill.
    pub sweep_interval: Duration,

    /// Most hashes answered from a single block request; the rest are ignored.
    pub max_request_hashes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(30),
            max_pending: 1024,
            backfill_interval: Duration::from_secs(2),
            backfill_retries: 3,
            sweep_interval: Duration::from_millis(500),
            max_request_hashes: 256,
        }
    }
}

impl SyncConfig {
    /// Create a new sync configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending block time-to-live.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Set the pending index capacity.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Set the delay between backfill attempts.
    pub fn with_backfill_interval(mut self, interval: Duration) -> Self {
        self.backfill_interval = interval;
        self
    }

    /// Set the backfill attempt budget.
    pub fn with_backfill_retries(mut self, retries: u32) -> Self {
        self.backfill_retries = retries;
        self
    }

    /// Set the sweep interval of the sync loop.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the per-request hash limit.
    pub fn with_max_request_hashes(mut self, max: usize) -> Self {
        self.max_request_hashes = max;
        self
    }
}
