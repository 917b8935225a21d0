//! Vote submission for one destination chain

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::retry::{with_retry_until, RetryConfig, RetryFailure};
use crate::cache::BoundedSet;
use crate::codec::bytes32_to_hex;
use crate::connector::ChainConnector;
use crate::error::{ConnectorError, RejectionReason, RelayerError, Result};
use crate::health::{Component, HealthReporter};
use crate::metrics;
use crate::types::{
    ChainId, ProposalKey, ProposalPayload, RelayerIdentity, TransactionRequest, TxHandle, TxKind,
};

/// Result of a vote attempt that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// One vote transaction was broadcast
    Submitted(TxHandle),
    /// Already submitted or in flight from this process; nothing sent
    Duplicate,
    /// The chain says there is nothing left to vote on
    AlreadyFinal(RejectionReason),
}

/// Submits votes with in-process deduplication and transient-error retry.
///
/// Deduplication across relayer processes is left to the destination chain,
/// which refuses a second vote from the same identity.
pub struct VoteSubmitter {
    chain_id: ChainId,
    connector: Arc<dyn ChainConnector>,
    bridge_address: Vec<u8>,
    identity: RelayerIdentity,
    retry: RetryConfig,
    submitted: BoundedSet<ProposalKey>,
    health: HealthReporter,
    degraded: bool,
    shutdown: Option<watch::Receiver<bool>>,
}

impl VoteSubmitter {
    pub fn new(
        chain_id: ChainId,
        connector: Arc<dyn ChainConnector>,
        bridge_address: Vec<u8>,
        identity: RelayerIdentity,
        retry: RetryConfig,
        health: HealthReporter,
    ) -> Self {
        Self {
            chain_id,
            connector,
            bridge_address,
            identity,
            retry,
            submitted: BoundedSet::default(),
            health,
            degraded: false,
            shutdown: None,
        }
    }

    /// Stop backing off between attempts once shutdown is requested
    pub fn set_shutdown(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
    }

    pub fn is_submitted(&self, key: &ProposalKey) -> bool {
        self.submitted.contains(key)
    }

    /// Release a key so a later call submits again (e.g. its vote tx failed)
    pub fn forget(&mut self, key: &ProposalKey) -> bool {
        self.submitted.remove(key)
    }

    pub fn in_flight(&self) -> usize {
        self.submitted.len()
    }

    pub async fn submit_vote(
        &mut self,
        key: &ProposalKey,
        payload: &ProposalPayload,
    ) -> Result<SubmissionOutcome> {
        if !self.submitted.insert(*key) {
            debug!(chain_id = %self.chain_id, %key, "Vote already submitted, skipping");
            metrics::record_vote(self.chain_id, "duplicate");
            return Ok(SubmissionOutcome::Duplicate);
        }

        let request = TransactionRequest {
            kind: TxKind::Vote,
            sender: self.identity,
            contract: self.bridge_address.clone(),
            key: *key,
            payload: payload.data.clone(),
            payload_hash: payload.hash,
        };

        let connector = self.connector.clone();
        let result = with_retry_until(&self.retry, "vote", self.shutdown.as_ref(), |_| {
            let connector = connector.clone();
            let request = request.clone();
            async move { connector.submit_transaction(request).await }
        })
        .await;

        match result {
            Ok(handle) => {
                info!(
                    chain_id = %self.chain_id,
                    %key,
                    tx = %handle,
                    payload_hash = %payload.hash_hex(),
                    "Vote submitted"
                );
                metrics::record_vote(self.chain_id, "submitted");
                if self.degraded {
                    self.degraded = false;
                    self.health.healthy(Component::Submitter);
                }
                Ok(SubmissionOutcome::Submitted(handle))
            }
            Err(RetryFailure::Fatal(ConnectorError::Rejected(reason))) if reason.is_terminal() => {
                info!(
                    chain_id = %self.chain_id,
                    %key,
                    reason = %reason,
                    "Vote not needed, proposal already settled"
                );
                metrics::record_vote(self.chain_id, "already_final");
                Ok(SubmissionOutcome::AlreadyFinal(reason))
            }
            Err(RetryFailure::Fatal(ConnectorError::Rejected(
                RejectionReason::PayloadMismatch,
            ))) => {
                // Key stays marked: voting again cannot succeed
                let err = RelayerError::Divergence {
                    key: *key,
                    local: bytes32_to_hex(&payload.hash),
                    observed: "destination aggregated a different payload".to_string(),
                };
                error!(
                    chain_id = %self.chain_id,
                    %key,
                    error = %err,
                    "Vote rejected for payload mismatch"
                );
                metrics::record_vote(self.chain_id, "divergent");
                Err(err)
            }
            Err(RetryFailure::Fatal(ConnectorError::Rejected(reason))) => {
                self.submitted.remove(key);
                warn!(chain_id = %self.chain_id, %key, reason = %reason, "Vote rejected");
                metrics::record_vote(self.chain_id, "rejected");
                Err(RelayerError::Rejected {
                    chain_id: self.chain_id,
                    reason,
                })
            }
            Err(RetryFailure::Fatal(e)) => {
                self.submitted.remove(key);
                metrics::record_vote(self.chain_id, "failed");
                Err(RelayerError::TransientConnector {
                    chain_id: self.chain_id,
                    message: e.to_string(),
                })
            }
            Err(RetryFailure::Interrupted { attempts, .. }) => {
                self.submitted.remove(key);
                debug!(chain_id = %self.chain_id, %key, attempts, "Vote abandoned for shutdown");
                Err(RelayerError::Shutdown)
            }
            Err(RetryFailure::Exhausted {
                attempts,
                last_error,
            }) => {
                self.submitted.remove(key);
                warn!(
                    chain_id = %self.chain_id,
                    %key,
                    attempts,
                    error = %last_error,
                    "Vote submission gave up; will retry on a later poll"
                );
                metrics::record_vote(self.chain_id, "failed");
                if !self.degraded {
                    self.degraded = true;
                    self.health.degraded(
                        Component::Submitter,
                        format!("vote submission failing: {}", last_error),
                    );
                }
                Err(RelayerError::RetriesExhausted {
                    chain_id: self.chain_id,
                    attempts,
                    last_error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use crate::types::ResourceId;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    fn key(nonce: u64) -> ProposalKey {
        ProposalKey {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(1),
            deposit_nonce: nonce,
            resource_id: ResourceId([1u8; 32]),
        }
    }

    fn payload() -> ProposalPayload {
        ProposalPayload {
            data: b"data".to_vec(),
            hash: [9u8; 32],
        }
    }

    fn submitter(chain: &MockChain, identity: u8) -> VoteSubmitter {
        VoteSubmitter::new(
            chain.chain_id(),
            chain.connector(),
            MockChain::BRIDGE.to_vec(),
            RelayerIdentity([identity; 32]),
            fast_retry(),
            HealthReporter::disconnected(chain.chain_id()),
        )
    }

    #[tokio::test]
    async fn test_local_dedup() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(2);
        let mut s = submitter(&chain, 1);

        let first = s.submit_vote(&key(1), &payload()).await.unwrap();
        assert!(matches!(first, SubmissionOutcome::Submitted(_)));
        let second = s.submit_vote(&key(1), &payload()).await.unwrap();
        assert_eq!(second, SubmissionOutcome::Duplicate);
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let chain = MockChain::new(ChainId(1));
        chain.fail_next_submissions(3);
        let mut s = submitter(&chain, 1);

        let outcome = s.submit_vote(&key(1), &payload()).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Submitted(_)));
        assert_eq!(chain.submission_attempts(), 4);
        assert_eq!(chain.accepted(TxKind::Vote).len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_releases_key() {
        let chain = MockChain::new(ChainId(1));
        chain.fail_next_submissions(5);
        let mut s = submitter(&chain, 1);

        let err = s.submit_vote(&key(1), &payload()).await.unwrap_err();
        assert!(matches!(err, RelayerError::RetriesExhausted { attempts: 5, .. }));
        assert!(!s.is_submitted(&key(1)));

        let outcome = s.submit_vote(&key(1), &payload()).await.unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Submitted(_)));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_vote_and_releases_key() {
        let chain = MockChain::new(ChainId(1));
        chain.fail_next_submissions(5);
        let mut s = submitter(&chain, 1);
        let (stop, shutdown) = tokio::sync::watch::channel(false);
        s.set_shutdown(shutdown);
        stop.send(true).unwrap();

        let err = s.submit_vote(&key(1), &payload()).await.unwrap_err();
        assert!(matches!(err, RelayerError::Shutdown));
        assert_eq!(chain.submission_attempts(), 1);
        assert!(!s.is_submitted(&key(1)));
    }

    #[tokio::test]
    async fn test_already_voted_is_terminal_success() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(2);
        let mut a = submitter(&chain, 1);
        let mut again = submitter(&chain, 1);

        a.submit_vote(&key(1), &payload()).await.unwrap();
        let outcome = again.submit_vote(&key(1), &payload()).await.unwrap();
        assert_eq!(
            outcome,
            SubmissionOutcome::AlreadyFinal(RejectionReason::AlreadyVoted)
        );
    }

    #[tokio::test]
    async fn test_payload_mismatch_is_divergence() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(2);
        let mut a = submitter(&chain, 1);
        let mut b = submitter(&chain, 2);

        a.submit_vote(&key(1), &payload()).await.unwrap();
        let other = ProposalPayload {
            data: b"evil".to_vec(),
            hash: [8u8; 32],
        };
        let err = b.submit_vote(&key(1), &other).await.unwrap_err();
        assert!(matches!(err, RelayerError::Divergence { .. }));
        assert!(b.is_submitted(&key(1)));
    }

    #[tokio::test]
    async fn test_unauthorized_rejection_releases_key() {
        let chain = MockChain::new(ChainId(1));
        chain.set_authorized([RelayerIdentity([2u8; 32])]);
        let mut s = submitter(&chain, 1);

        let err = s.submit_vote(&key(1), &payload()).await.unwrap_err();
        assert!(matches!(
            err,
            RelayerError::Rejected {
                reason: RejectionReason::Unauthorized,
                ..
            }
        ));
        assert!(!s.is_submitted(&key(1)));
        assert_eq!(s.in_flight(), 0);
        // Rejections are not retried
        assert_eq!(chain.submission_attempts(), 1);
    }
}
