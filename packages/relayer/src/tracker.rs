//! Cached, refresh-on-interval view of destination proposal state
//!
//! The destination chain is the source of truth. The cache only saves
//! queries between refreshes and never moves a proposal backward: an
//! observation that contradicts the monotonic lifecycle is logged and
//! ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec;
use crate::connector::ChainConnector;
use crate::error::{RelayerError, Result};
use crate::health::{Component, HealthReporter};
use crate::metrics;
use crate::types::{ChainId, ProposalKey, ProposalState, ProposalStatus};
use crate::writers::retry::{with_retry_until, RetryConfig, RetryFailure};
use crate::writers::{BreakerTransition, CircuitBreaker};

#[derive(Debug, Clone)]
struct CachedState {
    state: ProposalState,
    fetched_at: Instant,
}

/// A status change seen during a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub key: ProposalKey,
    pub from: ProposalStatus,
    pub to: ProposalStatus,
}

pub struct ProposalStateTracker {
    chain_id: ChainId,
    connector: Arc<dyn ChainConnector>,
    bridge_address: Vec<u8>,
    configured_threshold: Option<u32>,
    refresh_interval: Duration,
    retry: RetryConfig,
    cache: HashMap<ProposalKey, CachedState>,
    tracked: BTreeSet<ProposalKey>,
    breaker: CircuitBreaker,
    threshold_warned: bool,
    health: HealthReporter,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ProposalStateTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: ChainId,
        connector: Arc<dyn ChainConnector>,
        bridge_address: Vec<u8>,
        configured_threshold: Option<u32>,
        refresh_interval: Duration,
        retry: RetryConfig,
        circuit_breaker_threshold: u32,
        health: HealthReporter,
    ) -> Self {
        Self {
            chain_id,
            connector,
            bridge_address,
            configured_threshold,
            refresh_interval,
            retry,
            cache: HashMap::new(),
            tracked: BTreeSet::new(),
            breaker: CircuitBreaker::new(circuit_breaker_threshold),
            threshold_warned: false,
            health,
            shutdown: None,
        }
    }

    pub fn set_shutdown(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
    }

    pub fn track(&mut self, key: ProposalKey) -> bool {
        let added = self.tracked.insert(key);
        metrics::set_tracked_proposals(self.chain_id, self.tracked.len());
        added
    }

    pub fn untrack(&mut self, key: &ProposalKey) {
        self.tracked.remove(key);
        self.cache.remove(key);
        metrics::set_tracked_proposals(self.chain_id, self.tracked.len());
    }

    pub fn is_tracked(&self, key: &ProposalKey) -> bool {
        self.tracked.contains(key)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &ProposalKey> {
        self.tracked.iter()
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Drop the cached state so the next read goes to the chain
    pub fn invalidate(&mut self, key: &ProposalKey) {
        self.cache.remove(key);
    }

    /// Last observed state, however old
    pub fn cached(&self, key: &ProposalKey) -> Option<&ProposalState> {
        self.cache.get(key).map(|c| &c.state)
    }

    /// Current state, from cache when younger than the refresh interval
    pub async fn get_state(&mut self, key: &ProposalKey) -> Result<ProposalState> {
        if let Some(cached) = self.cache.get(key) {
            if cached.fetched_at.elapsed() < self.refresh_interval {
                return Ok(cached.state.clone());
            }
        }
        let observed = self.fetch(key).await?;
        let (state, _) = self.merge(*key, observed);
        Ok(state)
    }

    /// Re-read every tracked proposal; returns the status changes observed
    pub async fn refresh(&mut self) -> Vec<StateChange> {
        let keys: Vec<ProposalKey> = self.tracked.iter().copied().collect();
        let mut changes = Vec::new();

        for key in keys {
            match self.fetch(&key).await {
                Ok(observed) => {
                    if let (_, Some(change)) = self.merge(key, observed) {
                        changes.push(change);
                    }
                }
                Err(e) => {
                    debug!(
                        chain_id = %self.chain_id,
                        %key,
                        error = %e,
                        "Proposal state refresh failed"
                    );
                }
            }
        }

        changes
    }

    async fn fetch(&mut self, key: &ProposalKey) -> Result<ProposalState> {
        let storage_key = key.storage_key();
        let connector = self.connector.clone();
        let contract = self.bridge_address.clone();

        let raw = with_retry_until(&self.retry, "query_state", self.shutdown.as_ref(), |_| {
            let connector = connector.clone();
            let contract = contract.clone();
            async move { connector.query_state(&contract, &storage_key).await }
        })
        .await;

        let raw = match raw {
            Ok(raw) => {
                if let Some(BreakerTransition::Recovered) = self.breaker.record_success() {
                    info!(chain_id = %self.chain_id, "Proposal state reads recovered");
                    self.health.healthy(Component::Tracker);
                }
                metrics::set_consecutive_failures(self.chain_id, "tracker", 0);
                raw
            }
            Err(RetryFailure::Interrupted { .. }) => return Err(RelayerError::Shutdown),
            Err(failure) => {
                metrics::record_error(self.chain_id, "state_query");
                let transition = self.breaker.record_failure();
                metrics::set_consecutive_failures(
                    self.chain_id,
                    "tracker",
                    self.breaker.consecutive_failures(),
                );
                let err = match failure {
                    RetryFailure::Exhausted {
                        attempts,
                        last_error,
                    }
                    | RetryFailure::Interrupted {
                        attempts,
                        last_error,
                    } => RelayerError::RetriesExhausted {
                        chain_id: self.chain_id,
                        attempts,
                        last_error,
                    },
                    RetryFailure::Fatal(e) => RelayerError::TransientConnector {
                        chain_id: self.chain_id,
                        message: e.to_string(),
                    },
                };
                if let Some(BreakerTransition::Tripped) = transition {
                    warn!(
                        chain_id = %self.chain_id,
                        failures = self.breaker.consecutive_failures(),
                        error = %err,
                        "Proposal state reads failing"
                    );
                    self.health
                        .degraded(Component::Tracker, format!("state reads failing: {}", err));
                }
                return Err(err);
            }
        };

        let state = codec::decode_proposal_state(&raw, self.configured_threshold.unwrap_or(0))
            .map_err(|e| {
                warn!(chain_id = %self.chain_id, %key, error = %e, "Undecodable proposal state");
                metrics::record_error(self.chain_id, "decoding");
                RelayerError::Decoding(e)
            })?;

        self.check_threshold(&state);
        Ok(state)
    }

    fn check_threshold(&mut self, state: &ProposalState) {
        let Some(configured) = self.configured_threshold else {
            return;
        };
        if state.status == ProposalStatus::Inactive || state.threshold == configured {
            return;
        }
        if !self.threshold_warned {
            self.threshold_warned = true;
            warn!(
                chain_id = %self.chain_id,
                configured,
                on_chain = state.threshold,
                "Configured vote threshold differs from chain; using on-chain value"
            );
        }
    }

    /// Fold an observation into the cache without letting status regress
    fn merge(
        &mut self,
        key: ProposalKey,
        observed: ProposalState,
    ) -> (ProposalState, Option<StateChange>) {
        let now = Instant::now();
        let previous = self.cache.get(&key).map(|c| c.state.status);

        if let Some(from) = previous {
            if !from.can_advance_to(observed.status) {
                warn!(
                    chain_id = %self.chain_id,
                    %key,
                    cached = %from,
                    observed = %observed.status,
                    "Ignoring proposal status regression"
                );
                let Some(cached) = self.cache.get_mut(&key) else {
                    return (observed, None);
                };
                cached.fetched_at = now;
                return (cached.state.clone(), None);
            }
        }

        let change = match previous {
            Some(from) if from == observed.status => None,
            _ => {
                let from = previous.unwrap_or(ProposalStatus::Inactive);
                if from != observed.status {
                    debug!(
                        chain_id = %self.chain_id,
                        %key,
                        from = %from,
                        to = %observed.status,
                        votes = observed.vote_count,
                        threshold = observed.threshold,
                        "Proposal status changed"
                    );
                    metrics::record_proposal_transition(self.chain_id, observed.status.as_str());
                    Some(StateChange {
                        key,
                        from,
                        to: observed.status,
                    })
                } else {
                    None
                }
            }
        };

        self.cache.insert(
            key,
            CachedState {
                state: observed.clone(),
                fetched_at: now,
            },
        );
        (observed, change)
    }
}
