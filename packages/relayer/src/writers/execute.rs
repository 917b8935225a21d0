//! Proposal execution for one destination chain

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

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Execute transaction broadcast
    Submitted(TxHandle),
    /// Another relayer executed it first
    AlreadyExecuted,
    /// This process already submitted an execute for the key
    LocallyExecuted,
    /// The proposal was cancelled or expired; nothing to execute
    Abandoned(RejectionReason),
    /// The chain does not consider the proposal passed yet
    NotPassed,
}

/// Executes passed proposals. Any relayer may execute; the first one wins and
/// the others see `AlreadyExecuted`.
pub struct Executor {
    chain_id: ChainId,
    connector: Arc<dyn ChainConnector>,
    bridge_address: Vec<u8>,
    identity: RelayerIdentity,
    retry: RetryConfig,
    executed: BoundedSet<ProposalKey>,
    health: HealthReporter,
    degraded: bool,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Executor {
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
            executed: BoundedSet::default(),
            health,
            degraded: false,
            shutdown: None,
        }
    }

    pub fn set_shutdown(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
    }

    pub fn is_executed(&self, key: &ProposalKey) -> bool {
        self.executed.contains(key)
    }

    /// Allow another execute attempt, e.g. after the previous tx failed
    pub fn unmark(&mut self, key: &ProposalKey) -> bool {
        self.executed.remove(key)
    }

    pub async fn try_execute(
        &mut self,
        key: &ProposalKey,
        payload: &ProposalPayload,
    ) -> Result<ExecutionOutcome> {
        if self.executed.contains(key) {
            debug!(chain_id = %self.chain_id, %key, "Execution already submitted locally");
            return Ok(ExecutionOutcome::LocallyExecuted);
        }

        let request = TransactionRequest {
            kind: TxKind::Execute,
            sender: self.identity,
            contract: self.bridge_address.clone(),
            key: *key,
            payload: payload.data.clone(),
            payload_hash: payload.hash,
        };

        let connector = self.connector.clone();
        let result = with_retry_until(&self.retry, "execute", self.shutdown.as_ref(), |_| {
            let connector = connector.clone();
            let request = request.clone();
            async move { connector.submit_transaction(request).await }
        })
        .await;

        let rejected = match result {
            Ok(handle) => {
                self.executed.insert(*key);
                info!(chain_id = %self.chain_id, %key, tx = %handle, "Execution submitted");
                metrics::record_execution(self.chain_id, "submitted");
                if self.degraded {
                    self.degraded = false;
                    self.health.healthy(Component::Executor);
                }
                return Ok(ExecutionOutcome::Submitted(handle));
            }
            Err(RetryFailure::Fatal(ConnectorError::Rejected(reason))) => reason,
            Err(RetryFailure::Fatal(e)) => {
                metrics::record_execution(self.chain_id, "failed");
                return Err(RelayerError::TransientConnector {
                    chain_id: self.chain_id,
                    message: e.to_string(),
                });
            }
            Err(RetryFailure::Interrupted { attempts, .. }) => {
                debug!(
                    chain_id = %self.chain_id,
                    %key,
                    attempts,
                    "Execution abandoned for shutdown"
                );
                return Err(RelayerError::Shutdown);
            }
            Err(RetryFailure::Exhausted {
                attempts,
                last_error,
            }) => {
                warn!(
                    chain_id = %self.chain_id,
                    %key,
                    attempts,
                    error = %last_error,
                    "Execution gave up; will retry on a later poll"
                );
                metrics::record_execution(self.chain_id, "failed");
                if !self.degraded {
                    self.degraded = true;
                    self.health.degraded(
                        Component::Executor,
                        format!("execution failing: {}", last_error),
                    );
                }
                return Err(RelayerError::RetriesExhausted {
                    chain_id: self.chain_id,
                    attempts,
                    last_error,
                });
            }
        };

        match rejected {
            RejectionReason::AlreadyExecuted => {
                self.executed.insert(*key);
                info!(
                    chain_id = %self.chain_id,
                    %key,
                    "Proposal already executed by another relayer"
                );
                metrics::record_execution(self.chain_id, "already_executed");
                Ok(ExecutionOutcome::AlreadyExecuted)
            }
            reason @ (RejectionReason::Cancelled | RejectionReason::Expired) => {
                self.executed.insert(*key);
                info!(
                    chain_id = %self.chain_id,
                    %key,
                    reason = %reason,
                    "Proposal no longer executable"
                );
                metrics::record_execution(self.chain_id, "abandoned");
                Ok(ExecutionOutcome::Abandoned(reason))
            }
            RejectionReason::NotPassed => {
                debug!(chain_id = %self.chain_id, %key, "Execute refused, proposal not passed");
                metrics::record_execution(self.chain_id, "not_passed");
                Ok(ExecutionOutcome::NotPassed)
            }
            RejectionReason::PayloadMismatch => {
                self.executed.insert(*key);
                let err = RelayerError::Divergence {
                    key: *key,
                    local: bytes32_to_hex(&payload.hash),
                    observed: "destination passed a different payload".to_string(),
                };
                error!(
                    chain_id = %self.chain_id,
                    %key,
                    error = %err,
                    "Execute rejected for payload mismatch"
                );
                metrics::record_execution(self.chain_id, "divergent");
                Err(err)
            }
            reason => {
                warn!(chain_id = %self.chain_id, %key, reason = %reason, "Execution rejected");
                metrics::record_execution(self.chain_id, "rejected");
                Err(RelayerError::Rejected {
                    chain_id: self.chain_id,
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use crate::types::{ProposalStatus, ResourceId};
    use std::time::Duration;

    fn key() -> ProposalKey {
        ProposalKey {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(1),
            deposit_nonce: 3,
            resource_id: ResourceId([1u8; 32]),
        }
    }

    fn payload() -> ProposalPayload {
        ProposalPayload {
            data: b"data".to_vec(),
            hash: [9u8; 32],
        }
    }

    fn executor(chain: &MockChain, identity: u8) -> Executor {
        Executor::new(
            chain.chain_id(),
            chain.connector(),
            MockChain::BRIDGE.to_vec(),
            RelayerIdentity([identity; 32]),
            RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
            HealthReporter::disconnected(chain.chain_id()),
        )
    }

    async fn pass(chain: &MockChain) {
        chain.set_threshold(1);
        let mut voter = super::super::VoteSubmitter::new(
            chain.chain_id(),
            chain.connector(),
            MockChain::BRIDGE.to_vec(),
            RelayerIdentity([1u8; 32]),
            RetryConfig::default(),
            HealthReporter::disconnected(chain.chain_id()),
        );
        voter.submit_vote(&key(), &payload()).await.unwrap();
        chain.settle();
        assert_eq!(chain.proposal(&key()).unwrap().status, ProposalStatus::Passed);
    }

    #[tokio::test]
    async fn test_execute_passed_proposal_once() {
        let chain = MockChain::new(ChainId(1));
        pass(&chain).await;
        let mut exec = executor(&chain, 1);

        let outcome = exec.try_execute(&key(), &payload()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Submitted(_)));
        assert_eq!(
            exec.try_execute(&key(), &payload()).await.unwrap(),
            ExecutionOutcome::LocallyExecuted
        );
        assert_eq!(chain.accepted(TxKind::Execute).len(), 1);
        assert_eq!(chain.proposal(&key()).unwrap().status, ProposalStatus::Executed);
    }

    #[tokio::test]
    async fn test_second_executor_sees_already_executed() {
        let chain = MockChain::new(ChainId(1));
        pass(&chain).await;
        let mut a = executor(&chain, 1);
        let mut b = executor(&chain, 2);

        a.try_execute(&key(), &payload()).await.unwrap();
        assert_eq!(
            b.try_execute(&key(), &payload()).await.unwrap(),
            ExecutionOutcome::AlreadyExecuted
        );
        assert!(b.is_executed(&key()));
    }

    #[tokio::test]
    async fn test_not_passed_is_not_marked() {
        let chain = MockChain::new(ChainId(1));
        let mut exec = executor(&chain, 1);
        assert_eq!(
            exec.try_execute(&key(), &payload()).await.unwrap(),
            ExecutionOutcome::NotPassed
        );
        assert!(!exec.is_executed(&key()));
    }

    #[tokio::test]
    async fn test_cancelled_is_abandoned() {
        let chain = MockChain::new(ChainId(1));
        pass(&chain).await;
        chain.cancel(&key());
        let mut exec = executor(&chain, 1);
        assert_eq!(
            exec.try_execute(&key(), &payload()).await.unwrap(),
            ExecutionOutcome::Abandoned(RejectionReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_expired_is_abandoned() {
        let chain = MockChain::new(ChainId(1));
        pass(&chain).await;
        chain.expire(&key());
        let mut exec = executor(&chain, 1);
        assert_eq!(
            exec.try_execute(&key(), &payload()).await.unwrap(),
            ExecutionOutcome::Abandoned(RejectionReason::Expired)
        );
        assert!(exec.is_executed(&key()));
        assert!(chain.accepted(TxKind::Execute).is_empty());
    }
}
