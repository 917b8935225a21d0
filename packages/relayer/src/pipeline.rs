//! Per-destination-chain pipeline: build, vote, track, execute
//!
//! Deposits arrive from the router in source order. Each one becomes a
//! tracked proposal; a periodic tick refreshes on-chain state, confirms
//! in-flight transactions and moves every active proposal one step further
//! (vote while Inactive/Active, execute once Passed, forget once terminal).
//!
//! The watcher persists every deposit before routing it. A proposal that
//! reaches a terminal state, diverges or cannot be built is completed in the
//! store; anything left pending is reloaded when the pipeline starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::{BoundedSet, DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL};
use crate::checkpoint::CheckpointStore;
use crate::codec::bytes32_to_hex;
use crate::confirmation::{ConfirmationResult, ConfirmationTracker};
use crate::error::RelayerError;
use crate::health::{Component, HealthReporter};
use crate::metrics;
use crate::proposal::ProposalBuilder;
use crate::shutdown;
use crate::tracker::ProposalStateTracker;
use crate::types::{
    ChainDescriptor, ChainId, DepositRecord, Hash32, ProposalKey, ProposalPayload,
    ProposalStatus, RelayerIdentity, TxKind,
};
use crate::writers::{ExecutionOutcome, Executor, RetryConfig, SubmissionOutcome, VoteSubmitter};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tick period: state refresh, confirmation polling, proposal advancement
    pub refresh_interval: Duration,
    /// Retry budget for each vote, execute and state read
    pub retry: RetryConfig,
    /// Pending transactions older than this are treated as lost
    pub tx_timeout: Duration,
    pub circuit_breaker_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
            tx_timeout: Duration::from_secs(300),
            circuit_breaker_threshold: 10,
        }
    }
}

/// Counters published for `/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub deposits_received: u64,
    pub decode_errors: u64,
    pub divergences: u64,
    pub votes_submitted: u64,
    pub executions_submitted: u64,
    pub finished: u64,
    pub active_proposals: usize,
    pub pending_transactions: usize,
}

pub struct DestinationPipeline {
    chain_id: ChainId,
    name: String,
    identity: RelayerIdentity,
    refresh_interval: Duration,
    builder: ProposalBuilder,
    submitter: VoteSubmitter,
    tracker: ProposalStateTracker,
    executor: Executor,
    confirmations: ConfirmationTracker,
    active: HashMap<ProposalKey, ProposalPayload>,
    finished: BoundedSet<ProposalKey>,
    divergent: BoundedSet<ProposalKey>,
    store: Arc<dyn CheckpointStore>,
    shutdown: Option<watch::Receiver<bool>>,
    health: HealthReporter,
    stats: PipelineStats,
    stats_tx: watch::Sender<PipelineStats>,
}

impl DestinationPipeline {
    pub fn new(
        chain: &ChainDescriptor,
        config: PipelineConfig,
        store: Arc<dyn CheckpointStore>,
        health: HealthReporter,
    ) -> Self {
        let (stats_tx, _) = watch::channel(PipelineStats::default());

        Self {
            chain_id: chain.chain_id,
            name: chain.name.clone(),
            identity: chain.identity,
            refresh_interval: config.refresh_interval,
            builder: ProposalBuilder::new(chain.chain_id, chain.resources.clone()),
            submitter: VoteSubmitter::new(
                chain.chain_id,
                chain.connector.clone(),
                chain.bridge_address.clone(),
                chain.identity,
                config.retry.clone(),
                health.clone(),
            ),
            tracker: ProposalStateTracker::new(
                chain.chain_id,
                chain.connector.clone(),
                chain.bridge_address.clone(),
                chain.vote_threshold,
                config.refresh_interval,
                config.retry.clone(),
                config.circuit_breaker_threshold,
                health.clone(),
            ),
            executor: Executor::new(
                chain.chain_id,
                chain.connector.clone(),
                chain.bridge_address.clone(),
                chain.identity,
                config.retry,
                health.clone(),
            ),
            confirmations: ConfirmationTracker::new(
                chain.chain_id,
                chain.connector.clone(),
                config.tx_timeout,
            ),
            active: HashMap::new(),
            finished: BoundedSet::new(DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL),
            divergent: BoundedSet::new(DEFAULT_CACHE_SIZE, DEFAULT_CACHE_TTL),
            store,
            shutdown: None,
            health,
            stats: PipelineStats::default(),
            stats_tx,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn stats(&self) -> watch::Receiver<PipelineStats> {
        self.stats_tx.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_finished(&self, key: &ProposalKey) -> bool {
        self.finished.contains(key)
    }

    pub fn is_divergent(&self, key: &ProposalKey) -> bool {
        self.divergent.contains(key)
    }

    fn publish_stats(&mut self) {
        self.stats.active_proposals = self.active.len();
        self.stats.pending_transactions = self.confirmations.len();
        self.stats_tx.send_replace(self.stats.clone());
    }

    /// Turn a routed deposit into a tracked proposal and act on it right away
    pub async fn handle_deposit(&mut self, record: DepositRecord) {
        self.stats.deposits_received += 1;

        let (key, payload) = match self.builder.build(&record) {
            Ok(built) => built,
            Err(e) => {
                warn!(
                    chain_id = %self.chain_id,
                    source_chain = %record.source_chain_id,
                    nonce = record.deposit_nonce,
                    tx = %record.origin.tx_ref,
                    error = %e,
                    "Cannot build proposal, skipping deposit"
                );
                metrics::record_error(self.chain_id, "decoding");
                self.stats.decode_errors += 1;
                self.complete(&record.proposal_key()).await;
                self.publish_stats();
                return;
            }
        };

        if self.finished.contains(&key) {
            debug!(chain_id = %self.chain_id, %key, "Proposal already finished");
            self.complete(&key).await;
            return;
        }
        if self.divergent.contains(&key) {
            warn!(chain_id = %self.chain_id, %key, "Ignoring deposit for divergent proposal");
            self.complete(&key).await;
            return;
        }
        if let Some(existing) = self.active.get(&key) {
            if existing.hash != payload.hash {
                let local = existing.hash;
                self.flag_divergence(key, &local, &payload.hash).await;
            }
            return;
        }

        debug!(
            chain_id = %self.chain_id,
            %key,
            payload_hash = %payload.hash_hex(),
            "Tracking new proposal"
        );
        self.active.insert(key, payload);
        self.tracker.track(key);
        self.advance(key).await;
        self.publish_stats();
    }

    /// Take the next step for one active proposal based on its on-chain state
    async fn advance(&mut self, key: ProposalKey) {
        let Some(payload) = self.active.get(&key).cloned() else {
            return;
        };

        let state = match self.tracker.get_state(&key).await {
            Ok(state) => state,
            Err(e) => {
                debug!(
                    chain_id = %self.chain_id,
                    %key,
                    error = %e,
                    "State unavailable, retrying next tick"
                );
                return;
            }
        };

        if let Some(observed) = state.payload_hash {
            if observed != payload.hash {
                self.flag_divergence(key, &payload.hash, &observed).await;
                return;
            }
        }

        match state.status {
            ProposalStatus::Executed | ProposalStatus::Cancelled => {
                self.finish(key, state.status.as_str()).await;
            }
            ProposalStatus::Passed => self.execute(key, &payload).await,
            ProposalStatus::Inactive | ProposalStatus::Active => {
                if !state.has_voted(&self.identity) && !self.submitter.is_submitted(&key) {
                    self.vote(key, &payload).await;
                }
            }
        }
    }

    async fn vote(&mut self, key: ProposalKey, payload: &ProposalPayload) {
        match self.submitter.submit_vote(&key, payload).await {
            Ok(SubmissionOutcome::Submitted(handle)) => {
                self.stats.votes_submitted += 1;
                self.confirmations.watch(handle, TxKind::Vote, key);
                self.tracker.invalidate(&key);
            }
            Ok(SubmissionOutcome::AlreadyFinal(_)) => self.tracker.invalidate(&key),
            Ok(SubmissionOutcome::Duplicate) => {}
            Err(RelayerError::Divergence { .. }) => {
                self.mark_divergent(key).await;
            }
            Err(e) => {
                debug!(
                    chain_id = %self.chain_id,
                    %key,
                    error = %e,
                    "Vote not sent, retrying next tick"
                );
            }
        }
    }

    async fn execute(&mut self, key: ProposalKey, payload: &ProposalPayload) {
        if self.executor.is_executed(&key) {
            return;
        }
        match self.executor.try_execute(&key, payload).await {
            Ok(ExecutionOutcome::Submitted(handle)) => {
                self.stats.executions_submitted += 1;
                self.confirmations.watch(handle, TxKind::Execute, key);
                self.tracker.invalidate(&key);
            }
            Ok(ExecutionOutcome::AlreadyExecuted) => self.finish(key, "executed").await,
            Ok(ExecutionOutcome::Abandoned(reason)) => self.finish(key, reason.as_str()).await,
            Ok(ExecutionOutcome::NotPassed) => self.tracker.invalidate(&key),
            Ok(ExecutionOutcome::LocallyExecuted) => {}
            Err(RelayerError::Divergence { .. }) => {
                self.mark_divergent(key).await;
            }
            Err(e) => {
                debug!(
                    chain_id = %self.chain_id,
                    %key,
                    error = %e,
                    "Execute not sent, retrying next tick"
                );
            }
        }
    }

    async fn finish(&mut self, key: ProposalKey, outcome: &str) {
        if self.active.remove(&key).is_none() {
            return;
        }
        self.tracker.untrack(&key);
        self.finished.insert(key);
        self.stats.finished += 1;
        info!(chain_id = %self.chain_id, %key, outcome, "Proposal finished");
        self.complete(&key).await;
    }

    /// Drop a deposit from the persisted pending set
    async fn complete(&mut self, key: &ProposalKey) {
        if let Err(e) = self.store.complete_deposit(key).await {
            warn!(chain_id = %self.chain_id, %key, error = %e, "Failed to clear pending deposit");
            metrics::record_error(self.chain_id, "persistence");
        }
    }

    /// Re-track deposits that were persisted but never finished
    async fn recover(&mut self) {
        let pending = match self.store.pending_deposits(self.chain_id).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(chain_id = %self.chain_id, error = %e, "Failed to load pending deposits");
                metrics::record_error(self.chain_id, "persistence");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(chain_id = %self.chain_id, count = pending.len(), "Resuming pending deposits");
        for record in pending {
            self.handle_deposit(record).await;
        }
    }

    async fn flag_divergence(&mut self, key: ProposalKey, local: &Hash32, observed: &Hash32) {
        let err = RelayerError::Divergence {
            key,
            local: bytes32_to_hex(local),
            observed: bytes32_to_hex(observed),
        };
        error!(
            chain_id = %self.chain_id,
            %key,
            error = %err,
            "Payload divergence; proposal abandoned"
        );
        metrics::record_error(self.chain_id, "divergence");
        self.mark_divergent(key).await;
    }

    async fn mark_divergent(&mut self, key: ProposalKey) {
        self.active.remove(&key);
        self.tracker.untrack(&key);
        if self.divergent.insert(key) {
            self.stats.divergences += 1;
        }
        self.complete(&key).await;
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// One tick: confirm transactions, refresh state, advance every proposal
    pub async fn poll(&mut self) {
        for done in self.confirmations.poll().await {
            let key = done.tx.key;
            match (done.tx.kind, done.result) {
                (_, ConfirmationResult::Confirmed) => {}
                (TxKind::Vote, _) => {
                    self.submitter.forget(&key);
                }
                (TxKind::Execute, _) => {
                    self.executor.unmark(&key);
                }
            }
            self.tracker.invalidate(&key);
        }

        for change in self.tracker.refresh().await {
            info!(
                chain_id = %self.chain_id,
                key = %change.key,
                from = %change.from,
                to = %change.to,
                "Proposal status changed"
            );
        }

        let keys: Vec<ProposalKey> = self.active.keys().copied().collect();
        for key in keys {
            if self.stopping() {
                break;
            }
            self.advance(key).await;
        }

        self.publish_stats();
    }

    /// Consume routed deposits and tick until shutdown. Closing the deposit
    /// channel does not stop the pipeline; proposals already tracked keep
    /// advancing.
    pub async fn run(
        mut self,
        mut deposits: mpsc::UnboundedReceiver<DepositRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> crate::error::Result<()> {
        info!(
            chain_id = %self.chain_id,
            chain = %self.name,
            identity = %self.identity,
            "Destination pipeline started"
        );
        for component in [Component::Submitter, Component::Tracker, Component::Executor] {
            self.health.healthy(component);
        }
        self.submitter.set_shutdown(shutdown.clone());
        self.tracker.set_shutdown(shutdown.clone());
        self.executor.set_shutdown(shutdown.clone());
        self.shutdown = Some(shutdown.clone());
        self.recover().await;

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown::requested(&mut shutdown) => break,
                record = deposits.recv(), if open => match record {
                    Some(record) => self.handle_deposit(record).await,
                    None => {
                        debug!(chain_id = %self.chain_id, "Deposit channel closed");
                        open = false;
                    }
                },
                _ = ticker.tick() => self.poll().await,
            }
        }

        info!(
            chain_id = %self.chain_id,
            active = self.active.len(),
            pending_transactions = self.confirmations.len(),
            "Destination pipeline stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, MemoryCheckpointStore};
    use crate::proposal::HandlerPayload;
    use crate::testing::MockChain;
    use crate::types::{EventOrigin, HandlerKind, HandlerRef, ResourceId, ResourceRegistry};

    const RESOURCE: ResourceId = ResourceId([1u8; 32]);

    fn pipeline(chain: &MockChain, identity: u8) -> DestinationPipeline {
        pipeline_with_store(chain, identity, Arc::new(MemoryCheckpointStore::new()))
    }

    fn pipeline_with_store(
        chain: &MockChain,
        identity: u8,
        store: Arc<MemoryCheckpointStore>,
    ) -> DestinationPipeline {
        let mut descriptor = chain.descriptor("dst", 0);
        descriptor.identity = RelayerIdentity([identity; 32]);
        descriptor.resources = [(
            RESOURCE,
            HandlerRef {
                kind: HandlerKind::Fungible,
                address: vec![0xaa; 20],
            },
        )]
        .into_iter()
        .collect::<ResourceRegistry>();
        let config = PipelineConfig {
            refresh_interval: Duration::ZERO,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
            tx_timeout: Duration::from_secs(60),
            circuit_breaker_threshold: 3,
        };
        DestinationPipeline::new(
            &descriptor,
            config,
            store,
            HealthReporter::disconnected(chain.chain_id()),
        )
    }

    fn deposit(nonce: u64, amount: u128) -> DepositRecord {
        DepositRecord {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(1),
            resource_id: RESOURCE,
            deposit_nonce: nonce,
            payload: HandlerPayload::fungible(amount, &[0x11; 20]).encode(),
            origin: EventOrigin {
                block_height: 1,
                block_hash: [0u8; 32],
                event_index: 0,
                tx_ref: "0x01".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_deposit_voted_executed_and_finished() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(1);
        let mut p = pipeline(&chain, 1);

        let record = deposit(42, 100);
        let key = record.proposal_key();
        p.handle_deposit(record).await;
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);

        p.poll().await;
        assert_eq!(chain.accepted(TxKind::Execute).len(), 1);
        assert_eq!(chain.proposal(&key).unwrap().status, ProposalStatus::Executed);

        p.poll().await;
        assert!(p.is_finished(&key));
        assert_eq!(p.active_count(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_other_votes() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(2);
        let mut a = pipeline(&chain, 1);
        let mut b = pipeline(&chain, 2);

        a.handle_deposit(deposit(1, 5)).await;
        a.poll().await;
        a.poll().await;
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);
        assert!(chain.accepted(TxKind::Execute).is_empty());

        b.handle_deposit(deposit(1, 5)).await;
        a.poll().await;
        b.poll().await;
        assert_eq!(chain.accepted(TxKind::Vote).len(), 2);
        assert_eq!(chain.accepted(TxKind::Execute).len(), 1);
    }

    #[tokio::test]
    async fn test_divergent_payload_is_not_voted() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(3);
        let mut honest = pipeline(&chain, 1);
        let mut other = pipeline(&chain, 2);

        honest.handle_deposit(deposit(9, 100)).await;
        let record = deposit(9, 999);
        let key = record.proposal_key();
        other.handle_deposit(record).await;

        assert!(other.is_divergent(&key));
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);
        assert_eq!(other.stats().borrow().divergences, 1);
    }

    #[tokio::test]
    async fn test_unregistered_resource_is_skipped() {
        let chain = MockChain::new(ChainId(1));
        let mut p = pipeline(&chain, 1);
        let mut record = deposit(1, 1);
        record.resource_id = ResourceId([2u8; 32]);

        p.handle_deposit(record).await;
        assert_eq!(p.active_count(), 0);
        assert_eq!(p.stats().borrow().decode_errors, 1);
        assert!(chain.accepted(TxKind::Vote).is_empty());
    }

    #[tokio::test]
    async fn test_failed_execution_is_retried() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(1);
        chain.fail_executions(true);
        let mut p = pipeline(&chain, 1);
        let record = deposit(3, 10);
        let key = record.proposal_key();

        p.handle_deposit(record).await;
        p.poll().await;
        assert_eq!(chain.accepted(TxKind::Execute).len(), 1);

        chain.fail_executions(false);
        // Failed receipt un-marks the key, the same tick executes again
        p.poll().await;
        assert_eq!(chain.accepted(TxKind::Execute).len(), 2);
        assert_eq!(chain.proposal(&key).unwrap().status, ProposalStatus::Executed);
    }

    #[tokio::test]
    async fn test_pending_deposits_resumed_until_finished() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(1);
        let store = Arc::new(MemoryCheckpointStore::new());
        let record = deposit(7, 50);
        let key = record.proposal_key();
        store
            .save(ChainId(0), &Checkpoint::at(1), &[record])
            .await
            .unwrap();

        let mut p = pipeline_with_store(&chain, 1, store.clone());
        p.recover().await;
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);
        assert_eq!(store.pending_count(), 1);

        p.poll().await;
        p.poll().await;
        assert!(p.is_finished(&key));
        assert_eq!(store.pending_count(), 0);

        // Nothing left to resume
        let mut restarted = pipeline_with_store(&chain, 1, store.clone());
        restarted.recover().await;
        assert_eq!(restarted.active_count(), 0);
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_pending_deposit_is_cleared() {
        let chain = MockChain::new(ChainId(1));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut record = deposit(2, 1);
        record.resource_id = ResourceId([2u8; 32]);
        store
            .save(ChainId(0), &Checkpoint::at(1), &[record])
            .await
            .unwrap();

        let mut p = pipeline_with_store(&chain, 1, store.clone());
        p.recover().await;
        assert_eq!(p.stats().borrow().decode_errors, 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_deposits_for_other_chains_are_ignored() {
        let chain = MockChain::new(ChainId(1));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut record = deposit(4, 1);
        record.destination_chain_id = ChainId(5);
        store
            .save(ChainId(0), &Checkpoint::at(1), &[record])
            .await
            .unwrap();

        let mut p = pipeline_with_store(&chain, 1, store.clone());
        p.recover().await;
        assert_eq!(p.stats().borrow().deposits_received, 0);
        assert_eq!(store.pending_count(), 1);
    }
}
