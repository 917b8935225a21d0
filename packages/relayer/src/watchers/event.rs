//! Confirmed-deposit watcher for one source chain
//!
//! Heights move through three states: observed (header seen), confirmed
//! (`head - height >= confirmation_depth`) and processed (events emitted and
//! the cursor advanced past it). Only confirmed heights are ever fetched, in
//! strictly increasing order. A range's new records are saved as pending
//! together with the checkpoint that covers them, then handed to the router;
//! the destination pipeline clears them once their proposals are finished.
//!
//! Once a height is confirmed its hash is fixed. Any later header, parent
//! link or fetched event that disagrees with it halts the watcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{WatcherConfig, WatcherStatus};
use crate::cache::{BoundedMap, DEFAULT_CACHE_TTL};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::codec::{self, bytes32_to_hex};
use crate::connector::{BlockStream, ChainConnector};
use crate::error::{ConnectorError, RelayerError, Result};
use crate::health::{Component, HealthReporter};
use crate::metrics;
use crate::shutdown;
use crate::types::{
    BlockHeader, ChainDescriptor, ChainId, DepositRecord, Hash32, ProposalKey, RawEvent,
    StartMode,
};

/// Watches one source chain and emits confirmed deposits in block order
pub struct EventWatcher {
    chain_id: ChainId,
    name: String,
    connector: Arc<dyn ChainConnector>,
    confirmation_depth: u64,
    start_mode: StartMode,
    start_block: u64,
    store: Arc<dyn CheckpointStore>,
    config: WatcherConfig,
    health: HealthReporter,
    /// First height not yet processed; `None` until known (latest mode)
    next_block: Option<u64>,
    head: Option<u64>,
    checkpoint: Checkpoint,
    checkpoint_failing: bool,
    /// Recently observed block hashes by height
    header_hashes: BTreeMap<u64, Hash32>,
    /// Payload hash of every recently emitted proposal key
    seen: BoundedMap<ProposalKey, Hash32>,
    consecutive_failures: u32,
    stats: WatcherStatus,
    status: watch::Sender<WatcherStatus>,
}

impl EventWatcher {
    pub fn new(
        chain: &ChainDescriptor,
        store: Arc<dyn CheckpointStore>,
        config: WatcherConfig,
        health: HealthReporter,
    ) -> Self {
        let (status, _) = watch::channel(WatcherStatus::default());
        let seen = BoundedMap::new(config.dedup_capacity, DEFAULT_CACHE_TTL);

        Self {
            chain_id: chain.chain_id,
            name: chain.name.clone(),
            connector: chain.connector.clone(),
            confirmation_depth: chain.confirmation_depth,
            start_mode: chain.start_mode,
            start_block: chain.start_block,
            store,
            config,
            health,
            next_block: None,
            head: None,
            checkpoint: Checkpoint::default(),
            checkpoint_failing: false,
            header_hashes: BTreeMap::new(),
            seen,
            consecutive_failures: 0,
            stats: WatcherStatus::default(),
            status,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn next_block(&self) -> Option<u64> {
        self.next_block
    }

    pub fn head(&self) -> Option<u64> {
        self.head
    }

    /// Progress updates, for the status endpoint
    pub fn status(&self) -> watch::Receiver<WatcherStatus> {
        self.status.subscribe()
    }

    fn publish_status(&mut self) {
        self.stats.next_block = self.next_block;
        self.stats.head = self.head;
        self.status.send_replace(self.stats.clone());
    }

    /// Position the cursor from the checkpoint store and start mode
    pub async fn resume(&mut self) -> Result<()> {
        let stored = self.store.load(self.chain_id).await?;

        match (self.start_mode, stored) {
            (StartMode::Checkpoint, Some(checkpoint)) => {
                info!(
                    chain_id = %self.chain_id,
                    chain = %self.name,
                    height = checkpoint.block_height,
                    last_nonce = ?checkpoint.max_nonce(),
                    "Resuming from checkpoint"
                );
                self.next_block = Some(checkpoint.block_height.saturating_add(1));
                self.stats.checkpoint = Some(checkpoint.block_height);
                self.checkpoint = checkpoint;
            }
            (StartMode::Checkpoint, None) => {
                info!(
                    chain_id = %self.chain_id,
                    chain = %self.name,
                    start_block = self.start_block,
                    "No checkpoint found, starting at configured block"
                );
                self.next_block = Some(self.start_block);
            }
            (StartMode::Latest, stored) => {
                // Keep nonce history for ordering checks; height comes from the first header
                if let Some(checkpoint) = stored {
                    self.checkpoint.resource_nonces = checkpoint.resource_nonces;
                }
                info!(
                    chain_id = %self.chain_id,
                    chain = %self.name,
                    "Starting from latest confirmed block"
                );
                self.next_block = None;
            }
        }

        self.publish_status();
        Ok(())
    }

    /// Highest height whose hash may no longer change: processed, or at
    /// least `confirmation_depth` below the head
    fn settled_height(&self) -> Option<u64> {
        let processed = self.next_block.and_then(|next| next.checked_sub(1));
        let confirmed = self
            .head
            .and_then(|head| head.checked_sub(self.confirmation_depth));
        processed.max(confirmed)
    }

    fn is_settled(&self, height: u64) -> bool {
        self.settled_height().is_some_and(|settled| height <= settled)
    }

    /// Record a header from the subscription, checking it against settled history
    pub fn observe_header(&mut self, header: BlockHeader) -> Result<()> {
        if self.is_settled(header.height) {
            if let Some(known) = self.header_hashes.get(&header.height).copied() {
                if known != header.hash {
                    return Err(self.reorg(header.height, &known, &header.hash));
                }
            }
        }
        if let Some(parent_height) = header.height.checked_sub(1) {
            match self.header_hashes.get(&parent_height).copied() {
                Some(known) if known != header.parent_hash => {
                    if self.is_settled(parent_height) {
                        return Err(self.reorg(parent_height, &known, &header.parent_hash));
                    }
                    // Unconfirmed fork: forget everything seen above the settled height
                    let keep_below = self.settled_height().map_or(0, |h| h.saturating_add(1));
                    let dropped = self.header_hashes.split_off(&keep_below).len();
                    debug!(
                        chain_id = %self.chain_id,
                        height = header.height,
                        dropped,
                        "Unconfirmed blocks replaced"
                    );
                    self.header_hashes.insert(parent_height, header.parent_hash);
                }
                Some(_) => {}
                None => {
                    self.header_hashes.insert(parent_height, header.parent_hash);
                }
            }
        }

        self.header_hashes.insert(header.height, header.hash);
        let keep_from = header.height.saturating_sub(self.config.header_window);
        if self
            .header_hashes
            .first_key_value()
            .is_some_and(|(h, _)| *h < keep_from)
        {
            self.header_hashes = self.header_hashes.split_off(&keep_from);
        }

        self.head = Some(header.height);
        if self.next_block.is_none() {
            let start = header
                .height
                .saturating_add(1)
                .saturating_sub(self.confirmation_depth);
            info!(
                chain_id = %self.chain_id,
                head = header.height,
                start,
                "Latest start position resolved"
            );
            self.next_block = Some(start);
        }

        metrics::set_chain_head(self.chain_id, header.height);
        self.publish_status();
        Ok(())
    }

    /// Next confirmed range to process, if any
    pub fn next_range(&self) -> Option<(u64, u64)> {
        let next = self.next_block?;
        let head = self.head?;
        let confirmed = head.checked_sub(self.confirmation_depth)?;
        if next > confirmed {
            return None;
        }
        let span = self.config.max_block_range.max(1);
        Some((next, confirmed.min(next.saturating_add(span - 1))))
    }

    fn reorg(&self, height: u64, expected: &Hash32, observed: &Hash32) -> RelayerError {
        let err = RelayerError::ReorgDetected {
            chain_id: self.chain_id,
            height,
            expected: bytes32_to_hex(expected),
            observed: bytes32_to_hex(observed),
        };
        error!(
            chain_id = %self.chain_id,
            chain = %self.name,
            height,
            error = %err,
            "Confirmed block changed; halting watcher, operator intervention required"
        );
        metrics::record_error(self.chain_id, "reorg");
        self.health
            .halted(Component::Watcher, format!("reorg detected at height {}", height));
        err
    }

    fn connector_reorg(&self, height: u64) -> RelayerError {
        let expected = self.header_hashes.get(&height).copied().unwrap_or_default();
        self.reorg(height, &expected, &[0u8; 32])
    }

    fn record_failure(&mut self, error: &ConnectorError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        metrics::set_consecutive_failures(self.chain_id, "watcher", self.consecutive_failures);
        metrics::record_error(self.chain_id, "connector");

        if self.consecutive_failures == self.config.circuit_breaker_threshold {
            warn!(
                chain_id = %self.chain_id,
                failures = self.consecutive_failures,
                error = %error,
                "Watcher circuit breaker tripped"
            );
            self.health.degraded(
                Component::Watcher,
                format!(
                    "{} consecutive connector failures: {}",
                    self.consecutive_failures, error
                ),
            );
        }
    }

    fn record_success(&mut self) {
        if self.consecutive_failures >= self.config.circuit_breaker_threshold {
            info!(chain_id = %self.chain_id, "Watcher connector recovered");
            self.health.healthy(Component::Watcher);
        }
        if self.consecutive_failures > 0 {
            self.consecutive_failures = 0;
            metrics::set_consecutive_failures(self.chain_id, "watcher", 0);
        }
    }

    /// Events of `from..=to` in block and event order
    pub async fn fetch_events(
        &self,
        from: u64,
        to: u64,
    ) -> std::result::Result<Vec<RawEvent>, ConnectorError> {
        let mut events: Vec<RawEvent> = self.connector.get_events(from, to).await?;
        events.retain(|e| e.block_height >= from && e.block_height <= to);
        events.sort_by_key(|e| (e.block_height, e.event_index));
        Ok(events)
    }

    /// Check fetched events against recorded block hashes and decode their
    /// deposits. Malformed events are dropped.
    pub fn decode_events(&mut self, events: &[RawEvent]) -> Result<Vec<DepositRecord>> {
        for event in events {
            match self.header_hashes.get(&event.block_height).copied() {
                Some(known) if known != event.block_hash => {
                    return Err(self.reorg(event.block_height, &known, &event.block_hash));
                }
                Some(_) => {}
                None => {
                    self.header_hashes.insert(event.block_height, event.block_hash);
                }
            }
        }

        let mut records = Vec::new();
        for event in events {
            if !event.is_deposit() {
                continue;
            }
            match codec::decode_deposit_event(self.chain_id, event) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        chain_id = %self.chain_id,
                        block = event.block_height,
                        event_index = event.event_index,
                        tx = %event.tx_ref,
                        error = %e,
                        "Dropping malformed deposit event"
                    );
                    metrics::record_error(self.chain_id, "decoding");
                    self.stats.decode_errors += 1;
                }
            }
        }

        Ok(records)
    }

    /// Drop duplicates and divergent copies, tracking per-resource nonces
    fn accept(&mut self, records: Vec<DepositRecord>) -> Vec<DepositRecord> {
        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            let key = record.proposal_key();
            let hash = record.payload_hash();

            match self.seen.get(&key).copied() {
                Some(previous) if previous == hash => {
                    debug!(
                        chain_id = %self.chain_id,
                        %key,
                        "Duplicate deposit observation suppressed"
                    );
                    continue;
                }
                Some(previous) => {
                    let err = RelayerError::Divergence {
                        key,
                        local: bytes32_to_hex(&previous),
                        observed: bytes32_to_hex(&hash),
                    };
                    error!(
                        chain_id = %self.chain_id,
                        %key,
                        block = record.origin.block_height,
                        tx = %record.origin.tx_ref,
                        error = %err,
                        "Conflicting observations of one deposit; not emitting"
                    );
                    metrics::record_error(self.chain_id, "divergence");
                    self.stats.divergences += 1;
                    continue;
                }
                None => {}
            }
            self.seen.insert(key, hash);

            let last = self.checkpoint.last_nonce(&record.resource_id);
            if !self
                .checkpoint
                .observe_nonce(record.resource_id, record.deposit_nonce)
            {
                warn!(
                    chain_id = %self.chain_id,
                    resource = %record.resource_id,
                    nonce = record.deposit_nonce,
                    last = ?last,
                    "Deposit nonce behind last emitted nonce"
                );
            }
            accepted.push(record);
        }
        accepted
    }

    /// Hand accepted records to the router
    async fn emit(
        &mut self,
        records: Vec<DepositRecord>,
        out: &mpsc::Sender<DepositRecord>,
    ) -> Result<()> {
        for record in records {
            info!(
                chain_id = %self.chain_id,
                dest_chain = %record.destination_chain_id,
                nonce = record.deposit_nonce,
                resource = %record.resource_id,
                block = record.origin.block_height,
                tx = %record.origin.tx_ref,
                "Confirmed deposit"
            );
            metrics::record_deposit_detected(self.chain_id);

            out.send(record).await.map_err(|_| RelayerError::Shutdown)?;
            self.stats.deposits_emitted += 1;
        }
        Ok(())
    }

    /// Advance the cursor past `from..=to`, persisting it with the range's
    /// records as pending deposits
    async fn commit(&mut self, from: u64, to: u64, records: &[DepositRecord]) {
        self.checkpoint.block_height = to;
        self.next_block = Some(to.saturating_add(1));
        metrics::record_blocks_processed(self.chain_id, to - from + 1, to);

        match self.store.save(self.chain_id, &self.checkpoint, records).await {
            Ok(()) => {
                self.stats.checkpoint = Some(to);
                if self.checkpoint_failing {
                    self.checkpoint_failing = false;
                    info!(
                        chain_id = %self.chain_id,
                        height = to,
                        "Checkpoint persistence recovered"
                    );
                    self.health.healthy(Component::Watcher);
                }
            }
            Err(e) => {
                // Nothing emitted is lost; a restart replays from the last saved height
                error!(
                    chain_id = %self.chain_id,
                    height = to,
                    error = %e,
                    "Failed to persist checkpoint"
                );
                metrics::record_error(self.chain_id, "persistence");
                if !self.checkpoint_failing {
                    self.checkpoint_failing = true;
                    self.health
                        .degraded(Component::Watcher, format!("checkpoint save failing: {}", e));
                }
            }
        }

        debug!(chain_id = %self.chain_id, from, to, "Processed block range");
        self.publish_status();
    }

    /// Process one confirmed range, retrying the same range until it succeeds.
    /// Returns false if shutdown was requested while waiting.
    pub async fn process_range(
        &mut self,
        from: u64,
        to: u64,
        out: &mpsc::Sender<DepositRecord>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_events(from, to).await {
                Ok(events) => {
                    self.record_success();
                    let records = self.decode_events(&events)?;
                    let records = self.accept(records);
                    self.commit(from, to, &records).await;
                    self.emit(records, out).await?;
                    return Ok(true);
                }
                Err(ConnectorError::Reorg { height }) => return Err(self.connector_reorg(height)),
                Err(e) => {
                    self.record_failure(&e);
                    let backoff = self.config.retry.backoff_for_attempt(attempt.min(32));
                    attempt = attempt.saturating_add(1);
                    warn!(
                        chain_id = %self.chain_id,
                        from,
                        to,
                        attempt,
                        ?backoff,
                        error = %e,
                        "Failed to fetch events, retrying same range"
                    );
                    if shutdown::sleep_or_shutdown(backoff, shutdown).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn subscribe(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<BlockStream> {
        let mut attempt = 0u32;
        loop {
            match self.connector.subscribe_blocks().await {
                Ok(stream) => {
                    self.record_success();
                    debug!(chain_id = %self.chain_id, "Subscribed to blocks");
                    return Some(stream);
                }
                Err(e) => {
                    self.record_failure(&e);
                    let backoff = self.config.retry.backoff_for_attempt(attempt.min(32));
                    attempt = attempt.saturating_add(1);
                    warn!(
                        chain_id = %self.chain_id,
                        ?backoff,
                        error = %e,
                        "Block subscription failed"
                    );
                    if shutdown::sleep_or_shutdown(backoff, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn watch_loop(
        &mut self,
        out: &mpsc::Sender<DepositRecord>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(mut stream) = self.subscribe(shutdown).await else {
            return Ok(());
        };

        loop {
            while let Some((from, to)) = self.next_range() {
                if shutdown::is_requested(shutdown) {
                    return Ok(());
                }
                if !self.process_range(from, to, out, shutdown).await? {
                    return Ok(());
                }
            }

            let item = tokio::select! {
                biased;
                _ = shutdown::requested(shutdown) => return Ok(()),
                item = stream.next() => item,
            };

            match item {
                Some(Ok(header)) => self.observe_header(header)?,
                Some(Err(ConnectorError::Reorg { height })) => {
                    return Err(self.connector_reorg(height));
                }
                other => {
                    match other {
                        Some(Err(e)) => {
                            warn!(
                                chain_id = %self.chain_id,
                                error = %e,
                                "Block stream error, resubscribing"
                            );
                            self.record_failure(&e);
                        }
                        _ => warn!(chain_id = %self.chain_id, "Block stream ended, resubscribing"),
                    }
                    let backoff = self.config.retry.initial_backoff;
                    if shutdown::sleep_or_shutdown(backoff, shutdown).await {
                        return Ok(());
                    }
                    match self.subscribe(shutdown).await {
                        Some(s) => stream = s,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Run until shutdown or a fatal error (reorg, checkpoint load failure)
    pub async fn run(
        mut self,
        out: mpsc::Sender<DepositRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Err(e) = self.resume().await {
            error!(chain_id = %self.chain_id, error = %e, "Failed to load checkpoint");
            self.health
                .halted(Component::Watcher, format!("checkpoint load failed: {}", e));
            return Err(e);
        }
        self.health.healthy(Component::Watcher);

        info!(
            chain_id = %self.chain_id,
            chain = %self.name,
            confirmation_depth = self.confirmation_depth,
            next_block = ?self.next_block,
            "Event watcher started"
        );

        match self.watch_loop(&out, &mut shutdown).await {
            Ok(()) | Err(RelayerError::Shutdown) => {
                info!(
                    chain_id = %self.chain_id,
                    next_block = ?self.next_block,
                    "Event watcher stopped"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::testing::MockChain;
    use crate::types::ResourceId;
    use std::time::Duration;

    fn fast_config() -> WatcherConfig {
        let mut config = WatcherConfig::default();
        config.retry.initial_backoff = Duration::from_millis(1);
        config.retry.max_backoff = Duration::from_millis(5);
        config.circuit_breaker_threshold = 2;
        config
    }

    fn watcher(chain: &MockChain, depth: u64, store: Arc<MemoryCheckpointStore>) -> EventWatcher {
        let descriptor = chain.descriptor("src", depth);
        EventWatcher::new(
            &descriptor,
            store,
            fast_config(),
            HealthReporter::disconnected(chain.chain_id()),
        )
    }

    fn header(height: u64, hash: u8, parent: u8) -> BlockHeader {
        BlockHeader {
            height,
            hash: [hash; 32],
            parent_hash: [parent; 32],
        }
    }

    #[tokio::test]
    async fn test_range_waits_for_confirmation_depth() {
        let chain = MockChain::new(ChainId(0));
        let mut w = watcher(&chain, 10, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();
        assert_eq!(w.next_block(), Some(0));

        w.observe_header(header(5, 5, 4)).unwrap();
        assert_eq!(w.next_range(), None);

        w.observe_header(header(10, 10, 9)).unwrap();
        assert_eq!(w.next_range(), Some((0, 0)));

        w.observe_header(header(110, 110, 109)).unwrap();
        assert_eq!(w.next_range(), Some((0, 100)));
    }

    #[tokio::test]
    async fn test_range_is_chunked() {
        let chain = MockChain::new(ChainId(0));
        let descriptor = chain.descriptor("src", 0);
        let mut config = fast_config();
        config.max_block_range = 50;
        let mut w = EventWatcher::new(
            &descriptor,
            Arc::new(MemoryCheckpointStore::new()),
            config,
            HealthReporter::disconnected(ChainId(0)),
        );
        w.resume().await.unwrap();
        w.observe_header(header(120, 1, 0)).unwrap();
        assert_eq!(w.next_range(), Some((0, 49)));
    }

    #[tokio::test]
    async fn test_latest_start_mode() {
        let chain = MockChain::new(ChainId(0));
        let mut descriptor = chain.descriptor("src", 3);
        descriptor.start_mode = StartMode::Latest;
        let store = Arc::new(
            MemoryCheckpointStore::new().with_checkpoint(ChainId(0), Checkpoint::at(5)),
        );
        let mut w = EventWatcher::new(
            &descriptor,
            store,
            fast_config(),
            HealthReporter::disconnected(ChainId(0)),
        );
        w.resume().await.unwrap();
        assert_eq!(w.next_block(), None);

        w.observe_header(header(50, 50, 49)).unwrap();
        // Blocks up to 47 are already confirmed and skipped
        assert_eq!(w.next_block(), Some(48));
        assert_eq!(w.next_range(), None);
    }

    #[tokio::test]
    async fn test_reorg_of_processed_block_is_fatal() {
        let chain = MockChain::new(ChainId(0));
        let (tx, _rx) = mpsc::channel(16);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut w = watcher(&chain, 0, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();

        w.observe_header(header(0, 0xa0, 0)).unwrap();
        w.observe_header(header(1, 0xa1, 0xa0)).unwrap();
        let (from, to) = w.next_range().unwrap();
        assert!(w.process_range(from, to, &tx, &mut shutdown).await.unwrap());
        assert_eq!(w.next_block(), Some(2));

        // Same header again is fine
        w.observe_header(header(1, 0xa1, 0xa0)).unwrap();

        let err = w.observe_header(header(1, 0xb1, 0xa0)).unwrap_err();
        assert!(matches!(err, RelayerError::ReorgDetected { height: 1, .. }));

        let err = w.observe_header(header(2, 0xa2, 0xff)).unwrap_err();
        assert!(matches!(err, RelayerError::ReorgDetected { height: 1, .. }));
    }

    #[tokio::test]
    async fn test_unconfirmed_block_may_change() {
        let chain = MockChain::new(ChainId(0));
        let mut w = watcher(&chain, 5, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();
        w.observe_header(header(3, 0xa3, 0xa2)).unwrap();
        w.observe_header(header(3, 0xb3, 0xa2)).unwrap();
        assert_eq!(w.head(), Some(3));
    }

    #[tokio::test]
    async fn test_duplicates_suppressed_and_divergence_flagged() {
        let chain = MockChain::new(ChainId(0));
        let resource = ResourceId([1u8; 32]);
        chain.push_deposit(ChainId(1), resource, 7, b"first".to_vec());
        chain.push_deposit(ChainId(1), resource, 7, b"first".to_vec());
        chain.push_deposit(ChainId(1), resource, 7, b"other".to_vec());
        chain.push_deposit(ChainId(1), resource, 8, b"next".to_vec());
        chain.mine_block();

        let (tx, mut rx) = mpsc::channel(16);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut w = watcher(&chain, 0, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();
        w.observe_header(chain.header(chain.head())).unwrap();
        while let Some((from, to)) = w.next_range() {
            w.process_range(from, to, &tx, &mut shutdown).await.unwrap();
        }
        drop(tx);

        let mut nonces = Vec::new();
        while let Some(record) = rx.recv().await {
            nonces.push((record.deposit_nonce, record.payload));
        }
        assert_eq!(
            nonces,
            vec![(7, b"first".to_vec()), (8, b"next".to_vec())]
        );
        assert_eq!(w.status().borrow().divergences, 1);
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_processing() {
        let chain = MockChain::new(ChainId(0));
        let resource = ResourceId([1u8; 32]);
        chain.push_raw_event(RawEvent::DEPOSIT, vec![1, 2, 3]);
        chain.push_deposit(ChainId(1), resource, 1, b"ok".to_vec());
        chain.mine_block();

        let (tx, mut rx) = mpsc::channel(16);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut w = watcher(&chain, 0, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();
        w.observe_header(chain.header(chain.head())).unwrap();
        while let Some((from, to)) = w.next_range() {
            w.process_range(from, to, &tx, &mut shutdown).await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().deposit_nonce, 1);
        assert_eq!(w.status().borrow().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_advance_cursor() {
        let chain = MockChain::new(ChainId(0));
        chain.push_deposit(ChainId(1), ResourceId([1u8; 32]), 1, b"ok".to_vec());
        chain.mine_block();
        chain.fail_next_event_queries(3);

        let store = Arc::new(MemoryCheckpointStore::new());
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut w = watcher(&chain, 0, store.clone());
        w.resume().await.unwrap();
        w.observe_header(chain.header(chain.head())).unwrap();

        let (from, to) = w.next_range().unwrap();
        assert!(w.process_range(from, to, &tx, &mut shutdown).await.unwrap());
        assert_eq!(rx.recv().await.unwrap().deposit_nonce, 1);
        assert_eq!(chain.event_queries(), 4);
        assert_eq!(store.get(ChainId(0)).unwrap().block_height, to);
        // Saved with the checkpoint until a pipeline finishes it
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_block_change_at_fetch_is_fatal() {
        let chain = MockChain::new(ChainId(0));
        chain.deposit(ChainId(1), ResourceId([1u8; 32]), 1, b"ok".to_vec());
        chain.mine_blocks(2);

        let store = Arc::new(MemoryCheckpointStore::new());
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut w = watcher(&chain, 2, store.clone());
        w.resume().await.unwrap();
        for height in 0..=3 {
            w.observe_header(chain.header(height)).unwrap();
        }
        assert_eq!(w.next_range(), Some((0, 1)));

        chain.reorg_block(1);
        let err = w.process_range(0, 1, &tx, &mut shutdown).await.unwrap_err();
        assert!(matches!(err, RelayerError::ReorgDetected { height: 1, .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get(ChainId(0)), None);
        assert_eq!(w.next_block(), Some(0));

        // The child now links to the replaced block
        let err = w.observe_header(chain.header(2)).unwrap_err();
        assert!(matches!(err, RelayerError::ReorgDetected { height: 1, .. }));
    }

    #[tokio::test]
    async fn test_confirmed_unprocessed_header_change_is_fatal() {
        let chain = MockChain::new(ChainId(0));
        let mut w = watcher(&chain, 2, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();
        w.observe_header(header(1, 0xa1, 0xa0)).unwrap();
        w.observe_header(header(3, 0xa3, 0xa2)).unwrap();

        let err = w.observe_header(header(1, 0xb1, 0xa0)).unwrap_err();
        assert!(matches!(err, RelayerError::ReorgDetected { height: 1, .. }));
    }

    #[tokio::test]
    async fn test_unconfirmed_fork_is_forgotten() {
        let chain = MockChain::new(ChainId(0));
        let mut w = watcher(&chain, 3, Arc::new(MemoryCheckpointStore::new()));
        w.resume().await.unwrap();
        w.observe_header(header(1, 0xa1, 0xa0)).unwrap();
        w.observe_header(header(2, 0xa2, 0xa1)).unwrap();
        // New branch from height 2 on, before either block was confirmed
        w.observe_header(header(3, 0xb3, 0xb2)).unwrap();
        w.observe_header(header(4, 0xb4, 0xb3)).unwrap();

        let event = RawEvent {
            block_height: 2,
            block_hash: [0xb2; 32],
            event_index: 0,
            tx_ref: "0x02".into(),
            kind: "transfer".into(),
            data: vec![],
        };
        assert!(w.decode_events(&[event]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let chain = MockChain::new(ChainId(0));
        let store = Arc::new(
            MemoryCheckpointStore::new().with_checkpoint(ChainId(0), Checkpoint::at(41)),
        );
        let mut w = watcher(&chain, 0, store);
        w.resume().await.unwrap();
        assert_eq!(w.next_block(), Some(42));
    }

    #[tokio::test]
    async fn test_run_survives_refused_subscriptions() {
        let chain = MockChain::new(ChainId(0));
        chain.deposit(ChainId(1), ResourceId([1u8; 32]), 9, b"late".to_vec());
        chain.fail_next_subscriptions(2);

        let (tx, mut rx) = mpsc::channel(16);
        let (stop, shutdown) = watch::channel(false);
        let w = watcher(&chain, 0, Arc::new(MemoryCheckpointStore::new()));
        let handle = tokio::spawn(w.run(tx, shutdown));

        let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.deposit_nonce, 9);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
