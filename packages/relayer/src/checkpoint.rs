//! Per-source-chain watcher checkpoints and the pending-deposit outbox
//!
//! A checkpoint records the last confirmed block height whose events have
//! been handed on, plus the last emitted deposit nonce per resource. On
//! restart the watcher resumes at `block_height + 1`.
//!
//! Deposits covered by a checkpoint are stored alongside it, in the same
//! write, and stay pending until their destination pipeline finishes the
//! proposal. A pipeline reloads its pending deposits on start, so nothing at
//! or below a saved height is lost when the process stops mid-flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{RelayerError, Result};
use crate::types::{ChainId, DepositNonce, DepositRecord, ProposalKey, ResourceId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last block height fully processed
    pub block_height: u64,
    /// Highest nonce emitted per resource
    pub resource_nonces: BTreeMap<ResourceId, DepositNonce>,
}

impl Checkpoint {
    pub fn at(block_height: u64) -> Self {
        Self {
            block_height,
            resource_nonces: BTreeMap::new(),
        }
    }

    pub fn last_nonce(&self, resource: &ResourceId) -> Option<DepositNonce> {
        self.resource_nonces.get(resource).copied()
    }

    /// Highest nonce emitted across all resources
    pub fn max_nonce(&self) -> Option<DepositNonce> {
        self.resource_nonces.values().copied().max()
    }

    /// Record an emitted nonce; returns false when it is behind the last one
    pub fn observe_nonce(&mut self, resource: ResourceId, nonce: DepositNonce) -> bool {
        match self.resource_nonces.get_mut(&resource) {
            Some(last) if nonce < *last => false,
            Some(last) => {
                *last = nonce;
                true
            }
            None => {
                self.resource_nonces.insert(resource, nonce);
                true
            }
        }
    }
}

/// Order pending deposits the way their watchers emitted them
pub fn sort_pending(deposits: &mut [DepositRecord]) {
    deposits.sort_by_key(|d| {
        (
            d.source_chain_id,
            d.origin.block_height,
            d.origin.event_index,
        )
    });
}

/// Durable storage for watcher checkpoints and unfinished deposits
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>>;

    /// Persist `checkpoint` and record `deposits` as pending, in one write.
    /// Deposits already pending are left as they are.
    async fn save(
        &self,
        chain_id: ChainId,
        checkpoint: &Checkpoint,
        deposits: &[DepositRecord],
    ) -> Result<()>;

    /// Unfinished deposits bound for `destination`, in emission order
    async fn pending_deposits(&self, destination: ChainId) -> Result<Vec<DepositRecord>>;

    /// Drop a deposit whose proposal needs nothing more from this relayer
    async fn complete_deposit(&self, key: &ProposalKey) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    checkpoints: HashMap<ChainId, Checkpoint>,
    pending: HashMap<ProposalKey, DepositRecord>,
}

/// In-process store, used by tests and when persistence is explicitly disabled
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<MemoryState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| RelayerError::Persistence("checkpoint store poisoned".into()))
    }

    /// Pre-seed a checkpoint, as if a previous run had saved it
    pub fn with_checkpoint(self, chain_id: ChainId, checkpoint: Checkpoint) -> Self {
        if let Ok(mut state) = self.lock() {
            state.checkpoints.insert(chain_id, checkpoint);
        }
        self
    }

    pub fn get(&self, chain_id: ChainId) -> Option<Checkpoint> {
        self.lock()
            .ok()
            .and_then(|state| state.checkpoints.get(&chain_id).cloned())
    }

    /// Pending deposits across all destinations
    pub fn pending_count(&self) -> usize {
        self.lock().map(|state| state.pending.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.get(&chain_id).cloned())
    }

    async fn save(
        &self,
        chain_id: ChainId,
        checkpoint: &Checkpoint,
        deposits: &[DepositRecord],
    ) -> Result<()> {
        let mut state = self.lock()?;
        state.checkpoints.insert(chain_id, checkpoint.clone());
        for deposit in deposits {
            state
                .pending
                .entry(deposit.proposal_key())
                .or_insert_with(|| deposit.clone());
        }
        Ok(())
    }

    async fn pending_deposits(&self, destination: ChainId) -> Result<Vec<DepositRecord>> {
        let mut deposits: Vec<DepositRecord> = self
            .lock()?
            .pending
            .values()
            .filter(|d| d.destination_chain_id == destination)
            .cloned()
            .collect();
        sort_pending(&mut deposits);
        Ok(deposits)
    }

    async fn complete_deposit(&self, key: &ProposalKey) -> Result<()> {
        self.lock()?.pending.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventOrigin;

    fn deposit(destination: u64, nonce: u64, height: u64) -> DepositRecord {
        DepositRecord {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(destination),
            resource_id: ResourceId([1u8; 32]),
            deposit_nonce: nonce,
            payload: vec![nonce as u8],
            origin: EventOrigin {
                block_height: height,
                block_hash: [0u8; 32],
                event_index: 0,
                tx_ref: format!("0x{:02x}", nonce),
            },
        }
    }

    #[test]
    fn test_observe_nonce() {
        let r = ResourceId([1u8; 32]);
        let mut cp = Checkpoint::at(10);
        assert!(cp.observe_nonce(r, 5));
        assert!(cp.observe_nonce(r, 6));
        assert!(!cp.observe_nonce(r, 2));
        assert_eq!(cp.last_nonce(&r), Some(6));
        assert_eq!(cp.max_nonce(), Some(6));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load(ChainId(1)).await.unwrap(), None);

        let cp = Checkpoint::at(42);
        store.save(ChainId(1), &cp, &[]).await.unwrap();
        assert_eq!(store.load(ChainId(1)).await.unwrap(), Some(cp));
        assert_eq!(store.load(ChainId(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_deposits_until_completed() {
        let store = MemoryCheckpointStore::new();
        let late = deposit(1, 8, 9);
        let early = deposit(1, 7, 4);
        let elsewhere = deposit(2, 1, 5);
        store
            .save(ChainId(0), &Checkpoint::at(9), &[late.clone(), early.clone(), elsewhere])
            .await
            .unwrap();
        // Saving the same deposit again keeps one copy
        store
            .save(ChainId(0), &Checkpoint::at(9), &[early.clone()])
            .await
            .unwrap();
        assert_eq!(store.pending_count(), 3);

        let pending = store.pending_deposits(ChainId(1)).await.unwrap();
        assert_eq!(pending, vec![early.clone(), late.clone()]);

        store.complete_deposit(&early.proposal_key()).await.unwrap();
        assert_eq!(store.pending_deposits(ChainId(1)).await.unwrap(), vec![late]);
        assert_eq!(store.pending_count(), 2);
    }

    #[test]
    fn test_seeded_store() {
        let store =
            MemoryCheckpointStore::new().with_checkpoint(ChainId(3), Checkpoint::at(7));
        let loaded = tokio_test::block_on(store.load(ChainId(3))).unwrap();
        assert_eq!(loaded.map(|cp| cp.block_height), Some(7));
        assert_eq!(store.get(ChainId(3)), Some(Checkpoint::at(7)));
    }
}
