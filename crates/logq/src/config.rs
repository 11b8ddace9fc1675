//! Dispatcher tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for transaction assembly and the dispatch backstops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long a transaction may stay incomplete before the age backstop
    /// forces it.
    ///
    /// Default: 120 s
    pub incomplete_timeout: Duration,

    /// Upper bound on simultaneously incomplete transactions; the oldest are
    /// forced until the bound holds.
    ///
    /// Default: 1000
    pub incomplete_max: usize,

    /// Ring-reference chunks a transaction may hold before its store falls
    /// back to a private buffer.
    ///
    /// Default: 3
    pub chunks_per_tx: usize,

    /// Retired transaction shells kept for reuse. Reused shells keep their
    /// grown buffers, amortising allocation.
    ///
    /// Default: 10
    pub cache_pool_size: usize,

    /// Minimum private buffer size in words; growth doubles from here.
    ///
    /// Default: 64
    pub min_buffer_words: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            incomplete_timeout: Duration::from_secs(120),
            incomplete_max: 1000,
            chunks_per_tx: 3,
            cache_pool_size: 10,
            min_buffer_words: 64,
        }
    }
}

impl DispatchConfig {
    /// Sets the incomplete-transaction age limit.
    pub fn with_incomplete_timeout(mut self, timeout: Duration) -> Self {
        self.incomplete_timeout = timeout;
        self
    }

    /// Sets the incomplete-transaction store bound.
    pub fn with_incomplete_max(mut self, max: usize) -> Self {
        self.incomplete_max = max;
        self
    }

    /// Sets the per-transaction chunk budget.
    pub fn with_chunks_per_tx(mut self, chunks: usize) -> Self {
        self.chunks_per_tx = chunks;
        self
    }

    /// Sets the retired-shell pool size.
    pub fn with_cache_pool_size(mut self, size: usize) -> Self {
        self.cache_pool_size = size;
        self
    }

    /// Sets the minimum private buffer size in words.
    pub fn with_min_buffer_words(mut self, words: usize) -> Self {
        self.min_buffer_words = words;
        self
    }
}
