//! Configuration for the shard search engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardSearchError};

/// Configuration for [`ShardSearchEngine`](crate::engine::ShardSearchEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSearchConfig {
    /// Maximum number of searchers kept open in the cache.
    pub max_open_shards: usize,

    /// How long a cached searcher may sit unused before it is evicted.
    pub searcher_idle_timeout: Duration,

    /// How long a cached searcher may live regardless of use.
    pub searcher_live_timeout: Duration,

    /// Size of the pool running per-shard tasks, shared by all searches.
    pub max_threads: usize,

    /// Size of the pool running matchers, shared by all searches.
    pub max_match_threads: usize,

    /// Default number of shards one search runs at the same time.
    pub max_threads_per_search: usize,

    /// Bound of the per-shard matched document queue.
    pub handoff_queue_capacity: usize,

    /// How often blocked producers and consumers re-check cancellation.
    pub poll_interval: Duration,

    /// Largest number of clauses a compiled query may have.
    pub max_boolean_clause_count: usize,

    /// Number of threads closing evicted searchers.
    pub close_threads: usize,
}

impl Default for ShardSearchConfig {
    fn default() -> Self {
        Self {
            max_open_shards: 2,
            searcher_idle_timeout: Duration::from_secs(60),
            searcher_live_timeout: Duration::from_secs(600),
            max_threads: num_cpus::get(),
            max_match_threads: num_cpus::get(),
            max_threads_per_search: 5,
            handoff_queue_capacity: 1000,
            poll_interval: Duration::from_millis(100),
            max_boolean_clause_count: 1024,
            close_threads: 1,
        }
    }
}

impl ShardSearchConfig {
    /// Set the searcher cache capacity.
    pub fn with_max_open_shards(mut self, max_open_shards: usize) -> Self {
        self.max_open_shards = max_open_shards;
        self
    }

    /// Set the idle expiry of cached searchers.
    pub fn with_searcher_idle_timeout(mut self, timeout: Duration) -> Self {
        self.searcher_idle_timeout = timeout;
        self
    }

    /// Set the live expiry of cached searchers.
    pub fn with_searcher_live_timeout(mut self, timeout: Duration) -> Self {
        self.searcher_live_timeout = timeout;
        self
    }

    /// Set the shard task pool size.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the matcher pool size.
    pub fn with_max_match_threads(mut self, max_match_threads: usize) -> Self {
        self.max_match_threads = max_match_threads;
        self
    }

    /// Set the default per-search concurrency cap.
    pub fn with_max_threads_per_search(mut self, max_threads_per_search: usize) -> Self {
        self.max_threads_per_search = max_threads_per_search;
        self
    }

    /// Set the bound of the per-shard hand-off queue.
    pub fn with_handoff_queue_capacity(mut self, capacity: usize) -> Self {
        self.handoff_queue_capacity = capacity;
        self
    }

    /// Set the cancellation polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the clause limit for compiled queries.
    pub fn with_max_boolean_clause_count(mut self, count: usize) -> Self {
        self.max_boolean_clause_count = count;
        self
    }

    /// Set the number of close threads.
    pub fn with_close_threads(mut self, close_threads: usize) -> Self {
        self.close_threads = close_threads;
        self
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("max_open_shards", self.max_open_shards),
            ("max_threads", self.max_threads),
            ("max_match_threads", self.max_match_threads),
            ("max_threads_per_search", self.max_threads_per_search),
            ("handoff_queue_capacity", self.handoff_queue_capacity),
            ("max_boolean_clause_count", self.max_boolean_clause_count),
            ("close_threads", self.close_threads),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(ShardSearchError::invalid_config(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.poll_interval.is_zero() || self.poll_interval >= Duration::from_secs(1) {
            return Err(ShardSearchError::invalid_config(format!(
                "poll_interval must be between 0 and 1s, got {:?}",
                self.poll_interval
            )));
        }
        if self.searcher_idle_timeout.is_zero() || self.searcher_live_timeout.is_zero() {
            return Err(ShardSearchError::invalid_config(
                "searcher timeouts must be greater than 0",
            ));
        }

        Ok(())
    }
}
