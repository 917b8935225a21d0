//! Source-chain deposit watching

use std::time::Duration;

use serde::Serialize;

use crate::cache::DEFAULT_CACHE_SIZE;
use crate::writers::retry::RetryConfig;

pub mod event;

pub use event::EventWatcher;

/// Tuning shared by every source-chain watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Largest block span requested from `get_events` at once
    pub max_block_range: u64,
    /// Backoff for failed range fetches and re-subscriptions. The watcher
    /// never gives up on a range; `max_retries` only bounds the backoff growth.
    pub retry: RetryConfig,
    /// Consecutive failures before the watcher reports Degraded
    pub circuit_breaker_threshold: u32,
    /// Proposal keys remembered for duplicate/divergence detection
    pub dedup_capacity: usize,
    /// Header hashes remembered for reorg detection
    pub header_window: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_block_range: 1_000,
            retry: RetryConfig {
                max_retries: 10,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
            circuit_breaker_threshold: 10,
            dedup_capacity: DEFAULT_CACHE_SIZE,
            header_window: 1_024,
        }
    }
}

/// Progress of one watcher, published for `/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStatus {
    /// Next block height to process
    pub next_block: Option<u64>,
    /// Latest head observed on the subscription
    pub head: Option<u64>,
    /// Last height persisted to the checkpoint store
    pub checkpoint: Option<u64>,
    pub deposits_emitted: u64,
    pub decode_errors: u64,
    pub divergences: u64,
}
