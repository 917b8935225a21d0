//! Confirmation tracking for submitted vote and execute transactions
//!
//! Submission returns as soon as a transaction is broadcast. The pipeline
//! registers each handle here and polls; a failed or timed-out transaction
//! hands its proposal key back so the writer can try again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connector::ChainConnector;
use crate::metrics;
use crate::types::{ChainId, ProposalKey, TxHandle, TxKind, TxStatus};

/// A broadcast transaction awaiting inclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub handle: TxHandle,
    pub kind: TxKind,
    pub key: ProposalKey,
    pub submitted_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    Confirmed,
    Failed,
    TimedOut,
}

impl ConfirmationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationResult::Confirmed => "confirmed",
            ConfirmationResult::Failed => "failed",
            ConfirmationResult::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTx {
    pub tx: PendingTx,
    pub result: ConfirmationResult,
}

/// Tracks the transactions one destination pipeline has in flight
pub struct ConfirmationTracker {
    chain_id: ChainId,
    connector: Arc<dyn ChainConnector>,
    timeout: Duration,
    pending: Vec<PendingTx>,
}

impl ConfirmationTracker {
    pub fn new(chain_id: ChainId, connector: Arc<dyn ChainConnector>, timeout: Duration) -> Self {
        Self {
            chain_id,
            connector,
            timeout,
            pending: Vec::new(),
        }
    }

    pub fn watch(&mut self, handle: TxHandle, kind: TxKind, key: ProposalKey) {
        debug!(
            chain_id = %self.chain_id,
            tx = %handle,
            kind = kind.as_str(),
            %key,
            "Tracking transaction"
        );
        self.pending.push(PendingTx {
            handle,
            kind,
            key,
            submitted_at: Instant::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check every pending transaction once and return those that finished
    pub async fn poll(&mut self) -> Vec<FinishedTx> {
        let mut finished = Vec::new();
        let mut still_pending = Vec::with_capacity(self.pending.len());

        for tx in std::mem::take(&mut self.pending) {
            let status = self.connector.get_transaction_status(&tx.handle).await;
            let result = match status {
                Ok(TxStatus::Confirmed) => Some(ConfirmationResult::Confirmed),
                Ok(TxStatus::Failed) => Some(ConfirmationResult::Failed),
                Ok(TxStatus::Pending) => None,
                Err(e) => {
                    warn!(
                        chain_id = %self.chain_id,
                        tx = %tx.handle,
                        error = %e,
                        "Error checking transaction status"
                    );
                    None
                }
            };
            let result = match result {
                None if tx.submitted_at.elapsed() >= self.timeout => {
                    Some(ConfirmationResult::TimedOut)
                }
                other => other,
            };

            match result {
                Some(result) => {
                    match result {
                        ConfirmationResult::Confirmed => {
                            info!(
                                chain_id = %self.chain_id,
                                tx = %tx.handle,
                                kind = tx.kind.as_str(),
                                key = %tx.key,
                                "Transaction confirmed"
                            )
                        }
                        _ => warn!(
                            chain_id = %self.chain_id,
                            tx = %tx.handle,
                            kind = tx.kind.as_str(),
                            key = %tx.key,
                            result = result.as_str(),
                            "Transaction did not confirm"
                        ),
                    }
                    metrics::record_tx_confirmation(
                        self.chain_id,
                        tx.kind.as_str(),
                        result.as_str(),
                    );
                    finished.push(FinishedTx { tx, result });
                }
                None => still_pending.push(tx),
            }
        }

        self.pending = still_pending;
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;
    use crate::types::{RelayerIdentity, ResourceId, TransactionRequest};

    fn key() -> ProposalKey {
        ProposalKey {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(1),
            deposit_nonce: 1,
            resource_id: ResourceId([1u8; 32]),
        }
    }

    async fn submit(chain: &MockChain) -> TxHandle {
        chain
            .submit_transaction(TransactionRequest {
                kind: TxKind::Vote,
                sender: RelayerIdentity([1u8; 32]),
                contract: MockChain::BRIDGE.to_vec(),
                key: key(),
                payload: vec![],
                payload_hash: [1u8; 32],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_confirmed_transaction_finishes() {
        let chain = MockChain::new(ChainId(1));
        let mut tracker =
            ConfirmationTracker::new(chain.chain_id(), chain.connector(), Duration::from_secs(60));
        let handle = submit(&chain).await;
        tracker.watch(handle.clone(), TxKind::Vote, key());

        let finished = tracker.poll().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].tx.handle, handle);
        assert_eq!(finished[0].result, ConfirmationResult::Confirmed);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_pending_transaction_times_out() {
        let chain = MockChain::new(ChainId(1));
        chain.hold_transactions(true);
        let mut tracker = ConfirmationTracker::new(
            chain.chain_id(),
            chain.connector(),
            Duration::from_millis(20),
        );
        tracker.watch(submit(&chain).await, TxKind::Vote, key());

        assert!(tracker.poll().await.is_empty());
        assert_eq!(tracker.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let finished = tracker.poll().await;
        assert_eq!(finished[0].result, ConfirmationResult::TimedOut);
    }
}
