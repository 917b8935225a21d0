//! In-memory chain implementing [`ChainConnector`]
//!
//! Acts as a source chain (blocks with deposit events, a header broadcast)
//! and as a destination bridge (vote aggregation, execution, proposal state
//! under the canonical storage key). Clones share state.
//!
//! A vote that reaches quorum while creating or activating a proposal leaves
//! it Active; the proposal passes once a state query has observed it Active,
//! or on [`MockChain::settle`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;

use crate::codec;
use crate::connector::{BlockStream, ChainConnector};
use crate::error::{ConnectorError, RejectionReason};
use crate::types::{
    BlockHeader, ChainDescriptor, ChainId, ChainRole, Hash32, ProposalKey, ProposalState,
    ProposalStatus, RawEvent, RelayerIdentity, ResourceId, ResourceRegistry, StartMode,
    TransactionRequest, TxHandle, TxKind, TxStatus,
};

struct Block {
    header: BlockHeader,
    events: Vec<RawEvent>,
}

struct Inner {
    blocks: Vec<Block>,
    pending_events: Vec<(String, Vec<u8>)>,
    reorgs: u8,

    threshold: u32,
    authorized: Option<BTreeSet<RelayerIdentity>>,
    proposals: HashMap<Hash32, ProposalState>,
    passing: HashSet<Hash32>,
    history: HashMap<Hash32, Vec<ProposalStatus>>,
    expired: HashSet<Hash32>,
    fail_executions: bool,
    hold_transactions: bool,

    txs: HashMap<TxHandle, TxStatus>,
    accepted: Vec<TransactionRequest>,
    rejections: Vec<(TxKind, RejectionReason)>,
    next_tx: u64,

    fail_submissions: u32,
    fail_event_queries: u32,
    fail_state_queries: u32,
    fail_subscriptions: u32,
    submission_attempts: usize,
    event_queries: usize,
    state_queries: usize,
}

#[derive(Clone)]
pub struct MockChain {
    chain_id: ChainId,
    inner: Arc<Mutex<Inner>>,
    headers: broadcast::Sender<BlockHeader>,
}

fn block_hash(chain_id: ChainId, height: u64, salt: u8) -> Hash32 {
    codec::keccak256_concat(&[
        &chain_id.0.to_be_bytes(),
        &height.to_be_bytes(),
        &[salt],
    ])
}

impl MockChain {
    /// Bridge contract address every descriptor built here points at
    pub const BRIDGE: [u8; 20] = [0xb7; 20];

    pub fn new(chain_id: ChainId) -> Self {
        let genesis = BlockHeader {
            height: 0,
            hash: block_hash(chain_id, 0, 0),
            parent_hash: [0u8; 32],
        };
        let (headers, _) = broadcast::channel(256);
        let inner = Inner {
            blocks: vec![Block {
                header: genesis,
                events: Vec::new(),
            }],
            pending_events: Vec::new(),
            reorgs: 0,
            threshold: 1,
            authorized: None,
            proposals: HashMap::new(),
            passing: HashSet::new(),
            history: HashMap::new(),
            expired: HashSet::new(),
            fail_executions: false,
            hold_transactions: false,
            txs: HashMap::new(),
            accepted: Vec::new(),
            rejections: Vec::new(),
            next_tx: 0,
            fail_submissions: 0,
            fail_event_queries: 0,
            fail_state_queries: 0,
            fail_subscriptions: 0,
            submission_attempts: 0,
            event_queries: 0,
            state_queries: 0,
        };

        Self {
            chain_id,
            inner: Arc::new(Mutex::new(inner)),
            headers,
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn connector(&self) -> Arc<dyn ChainConnector> {
        Arc::new(self.clone())
    }

    /// Descriptor with no resources, default identity and checkpoint start
    pub fn descriptor(&self, name: &str, confirmation_depth: u64) -> ChainDescriptor {
        ChainDescriptor {
            chain_id: self.chain_id,
            name: name.to_string(),
            connector: self.connector(),
            bridge_address: Self::BRIDGE.to_vec(),
            confirmation_depth,
            resources: ResourceRegistry::default(),
            identity: RelayerIdentity::default(),
            vote_threshold: None,
            role: ChainRole::Both,
            start_mode: StartMode::Checkpoint,
            start_block: 0,
        }
    }

    // ---- source side ----

    /// Queue a deposit event for the next mined block
    pub fn push_deposit(
        &self,
        destination: ChainId,
        resource: ResourceId,
        nonce: u64,
        payload: Vec<u8>,
    ) {
        let data = codec::encode_deposit_event(destination, &resource, nonce, &payload);
        self.push_raw_event(RawEvent::DEPOSIT, data);
    }

    pub fn push_raw_event(&self, kind: &str, data: Vec<u8>) {
        self.state().pending_events.push((kind.to_string(), data));
    }

    /// Seal queued events into a new block and broadcast its header
    pub fn mine_block(&self) -> u64 {
        let header = {
            let mut state = self.state();
            let parent = state.blocks[state.blocks.len() - 1].header;
            let height = parent.height + 1;
            let header = BlockHeader {
                height,
                hash: block_hash(self.chain_id, height, state.reorgs),
                parent_hash: parent.hash,
            };
            let events = std::mem::take(&mut state.pending_events)
                .into_iter()
                .enumerate()
                .map(|(index, (kind, data))| RawEvent {
                    block_height: height,
                    block_hash: header.hash,
                    event_index: index as u32,
                    tx_ref: format!("0x{:04x}{:04x}", height, index),
                    kind,
                    data,
                })
                .collect();
            state.blocks.push(Block { header, events });
            header
        };
        let _ = self.headers.send(header);
        header.height
    }

    pub fn mine_blocks(&self, count: u64) -> u64 {
        let mut height = self.head();
        for _ in 0..count {
            height = self.mine_block();
        }
        height
    }

    /// Push a deposit and mine it; returns the block height
    pub fn deposit(
        &self,
        destination: ChainId,
        resource: ResourceId,
        nonce: u64,
        payload: Vec<u8>,
    ) -> u64 {
        self.push_deposit(destination, resource, nonce, payload);
        self.mine_block()
    }

    pub fn head(&self) -> u64 {
        let state = self.state();
        state.blocks[state.blocks.len() - 1].header.height
    }

    /// Header at `height`; the head header when `height` is past the tip
    pub fn header(&self, height: u64) -> BlockHeader {
        let state = self.state();
        let index = (height as usize).min(state.blocks.len() - 1);
        state.blocks[index].header
    }

    /// Replace the block at `height` with a different hash and rebroadcast it
    pub fn reorg_block(&self, height: u64) {
        let header = {
            let mut state = self.state();
            state.reorgs = state.reorgs.wrapping_add(1);
            let salt = state.reorgs;
            let index = (height as usize).min(state.blocks.len() - 1);
            let hash = block_hash(self.chain_id, state.blocks[index].header.height, salt);
            state.blocks[index].header.hash = hash;
            for event in &mut state.blocks[index].events {
                event.block_hash = hash;
            }
            if let Some(child) = state.blocks.get_mut(index + 1) {
                child.header.parent_hash = hash;
            }
            state.blocks[index].header
        };
        let _ = self.headers.send(header);
    }

    pub fn fail_next_event_queries(&self, count: u32) {
        self.state().fail_event_queries = count;
    }

    pub fn fail_next_subscriptions(&self, count: u32) {
        self.state().fail_subscriptions = count;
    }

    /// Calls to `get_events`, failed ones included
    pub fn event_queries(&self) -> usize {
        self.state().event_queries
    }

    // ---- destination side ----

    /// Quorum applied to proposals created from now on
    pub fn set_threshold(&self, threshold: u32) {
        self.state().threshold = threshold;
    }

    pub fn set_authorized(&self, relayers: impl IntoIterator<Item = RelayerIdentity>) {
        self.state().authorized = Some(relayers.into_iter().collect());
    }

    /// Make execute transactions land but fail on chain
    pub fn fail_executions(&self, fail: bool) {
        self.state().fail_executions = fail;
    }

    /// Report new transactions as pending forever (effects still apply)
    pub fn hold_transactions(&self, hold: bool) {
        self.state().hold_transactions = hold;
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.state().fail_submissions = count;
    }

    pub fn fail_next_state_queries(&self, count: u32) {
        self.state().fail_state_queries = count;
    }

    pub fn proposal(&self, key: &ProposalKey) -> Option<ProposalState> {
        self.state().proposals.get(&key.storage_key()).cloned()
    }

    /// Every status the proposal has held, in order
    pub fn history(&self, key: &ProposalKey) -> Vec<ProposalStatus> {
        self.state()
            .history
            .get(&key.storage_key())
            .cloned()
            .unwrap_or_default()
    }

    /// Pass every proposal whose quorum was reached while it became Active
    pub fn settle(&self) {
        let mut state = self.state();
        let parked: Vec<Hash32> = state.passing.drain().collect();
        for storage_key in parked {
            state.transition(storage_key, ProposalStatus::Passed);
        }
    }

    pub fn cancel(&self, key: &ProposalKey) {
        let mut state = self.state();
        let storage_key = key.storage_key();
        state.proposal_entry(storage_key);
        state.passing.remove(&storage_key);
        state.transition(storage_key, ProposalStatus::Cancelled);
    }

    pub fn expire(&self, key: &ProposalKey) {
        self.state().expired.insert(key.storage_key());
    }

    /// Transactions the chain accepted, of one kind
    pub fn accepted(&self, kind: TxKind) -> Vec<TransactionRequest> {
        self.state()
            .accepted
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn rejections(&self) -> Vec<(TxKind, RejectionReason)> {
        self.state().rejections.clone()
    }

    pub fn submission_attempts(&self) -> usize {
        self.state().submission_attempts
    }

    pub fn state_queries(&self) -> usize {
        self.state().state_queries
    }
}

impl Inner {
    fn proposal_entry(&mut self, storage_key: Hash32) -> &mut ProposalState {
        let threshold = self.threshold;
        if !self.proposals.contains_key(&storage_key) {
            self.history.insert(storage_key, vec![ProposalStatus::Inactive]);
        }
        self.proposals
            .entry(storage_key)
            .or_insert_with(|| ProposalState::inactive(threshold))
    }

    fn transition(&mut self, storage_key: Hash32, status: ProposalStatus) {
        let Some(proposal) = self.proposals.get_mut(&storage_key) else {
            return;
        };
        if proposal.status == status {
            return;
        }
        proposal.status = status;
        self.history.entry(storage_key).or_default().push(status);
    }

    fn apply_vote(&mut self, request: &TransactionRequest) -> Result<(), RejectionReason> {
        let storage_key = request.key.storage_key();
        if self.expired.contains(&storage_key) {
            return Err(RejectionReason::Expired);
        }
        let proposal = self.proposal_entry(storage_key);

        match proposal.status {
            ProposalStatus::Executed => return Err(RejectionReason::AlreadyExecuted),
            ProposalStatus::Cancelled => return Err(RejectionReason::Cancelled),
            ProposalStatus::Passed => return Err(RejectionReason::AlreadyPassed),
            ProposalStatus::Inactive | ProposalStatus::Active => {}
        }
        if proposal
            .payload_hash
            .is_some_and(|hash| hash != request.payload_hash)
        {
            return Err(RejectionReason::PayloadMismatch);
        }
        if proposal.voters.contains(&request.sender) {
            return Err(RejectionReason::AlreadyVoted);
        }

        proposal.voters.insert(request.sender);
        proposal.vote_count += 1;
        proposal.payload_hash = Some(request.payload_hash);
        let was_active = proposal.status == ProposalStatus::Active;
        let quorum = proposal.quorum_reached();

        if was_active && quorum {
            self.passing.remove(&storage_key);
            self.transition(storage_key, ProposalStatus::Passed);
        } else {
            self.transition(storage_key, ProposalStatus::Active);
            if quorum {
                self.passing.insert(storage_key);
            }
        }
        Ok(())
    }

    /// Returns whether the execution succeeded on chain
    fn apply_execute(&mut self, request: &TransactionRequest) -> Result<bool, RejectionReason> {
        let storage_key = request.key.storage_key();
        if self.expired.contains(&storage_key) {
            return Err(RejectionReason::Expired);
        }
        let fail = self.fail_executions;
        let Some(proposal) = self.proposals.get_mut(&storage_key) else {
            return Err(RejectionReason::NotPassed);
        };

        match proposal.status {
            ProposalStatus::Executed => return Err(RejectionReason::AlreadyExecuted),
            ProposalStatus::Cancelled => return Err(RejectionReason::Cancelled),
            ProposalStatus::Passed => {}
            ProposalStatus::Inactive | ProposalStatus::Active => {
                return Err(RejectionReason::NotPassed)
            }
        }
        if proposal.payload_hash != Some(request.payload_hash) {
            return Err(RejectionReason::PayloadMismatch);
        }
        if fail {
            return Ok(false);
        }
        self.transition(storage_key, ProposalStatus::Executed);
        Ok(true)
    }
}

#[async_trait]
impl ChainConnector for MockChain {
    async fn subscribe_blocks(&self) -> Result<BlockStream, ConnectorError> {
        let rx = self.headers.subscribe();
        let head = {
            let mut state = self.state();
            if state.fail_subscriptions > 0 {
                state.fail_subscriptions -= 1;
                return Err(ConnectorError::Transient("subscription refused".into()));
            }
            state.blocks[state.blocks.len() - 1].header
        };

        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(header) => return Some((Ok(header), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::once(async move { Ok::<_, ConnectorError>(head) })
            .chain(live)
            .boxed())
    }

    async fn get_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>, ConnectorError> {
        let mut state = self.state();
        state.event_queries += 1;
        if state.fail_event_queries > 0 {
            state.fail_event_queries -= 1;
            return Err(ConnectorError::Transient("event query timed out".into()));
        }
        Ok(state
            .blocks
            .iter()
            .filter(|b| b.header.height >= from && b.header.height <= to)
            .flat_map(|b| b.events.iter().cloned())
            .collect())
    }

    async fn submit_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<TxHandle, ConnectorError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.submission_attempts += 1;
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(ConnectorError::Transient("node unavailable".into()));
        }
        if let Some(authorized) = &state.authorized {
            if !authorized.contains(&request.sender) {
                state.rejections.push((request.kind, RejectionReason::Unauthorized));
                return Err(ConnectorError::Rejected(RejectionReason::Unauthorized));
            }
        }

        let applied = match request.kind {
            TxKind::Vote => state.apply_vote(&request).map(|()| true),
            TxKind::Execute => state.apply_execute(&request),
        };
        let succeeded = match applied {
            Ok(succeeded) => succeeded,
            Err(reason) => {
                state.rejections.push((request.kind, reason.clone()));
                return Err(ConnectorError::Rejected(reason));
            }
        };

        state.next_tx += 1;
        let handle = TxHandle(format!(
            "{}-{}-{}",
            self.chain_id,
            request.kind.as_str(),
            state.next_tx
        ));
        let status = if state.hold_transactions {
            TxStatus::Pending
        } else if succeeded {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        };
        state.txs.insert(handle.clone(), status);
        state.accepted.push(request);
        Ok(handle)
    }

    async fn get_transaction_status(&self, handle: &TxHandle) -> Result<TxStatus, ConnectorError> {
        self.state()
            .txs
            .get(handle)
            .copied()
            .ok_or_else(|| ConnectorError::Transient(format!("unknown transaction {}", handle)))
    }

    async fn query_state(
        &self,
        _contract: &[u8],
        key: &[u8; 32],
    ) -> Result<Vec<u8>, ConnectorError> {
        let mut state = self.state();
        state.state_queries += 1;
        if state.fail_state_queries > 0 {
            state.fail_state_queries -= 1;
            return Err(ConnectorError::Transient("state query timed out".into()));
        }
        let raw = state
            .proposals
            .get(key)
            .map(codec::encode_proposal_state)
            .unwrap_or_default();
        if state.passing.remove(key) {
            state.transition(*key, ProposalStatus::Passed);
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ProposalKey {
        ProposalKey {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(1),
            deposit_nonce: 1,
            resource_id: ResourceId([1u8; 32]),
        }
    }

    fn vote(sender: u8, hash: u8) -> TransactionRequest {
        TransactionRequest {
            kind: TxKind::Vote,
            sender: RelayerIdentity([sender; 32]),
            contract: MockChain::BRIDGE.to_vec(),
            key: key(),
            payload: vec![],
            payload_hash: [hash; 32],
        }
    }

    #[tokio::test]
    async fn test_blocks_link_and_events_carry_hash() {
        let chain = MockChain::new(ChainId(0));
        let height = chain.deposit(ChainId(1), ResourceId([1u8; 32]), 1, vec![]);
        assert_eq!(height, 1);
        assert_eq!(chain.header(1).parent_hash, chain.header(0).hash);

        let events = chain.get_events(0, 5).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_hash, chain.header(1).hash);
    }

    #[tokio::test]
    async fn test_vote_aggregation() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(2);

        chain.submit_transaction(vote(1, 7)).await.unwrap();
        assert_eq!(chain.proposal(&key()).unwrap().status, ProposalStatus::Active);

        let err = chain.submit_transaction(vote(1, 7)).await.unwrap_err();
        assert_eq!(err, ConnectorError::Rejected(RejectionReason::AlreadyVoted));

        chain.submit_transaction(vote(2, 7)).await.unwrap();
        let state = chain.proposal(&key()).unwrap();
        assert_eq!(state.status, ProposalStatus::Passed);
        assert_eq!(state.vote_count, 2);

        let raw = chain
            .query_state(&MockChain::BRIDGE, &key().storage_key())
            .await
            .unwrap();
        assert_eq!(codec::decode_proposal_state(&raw, 0).unwrap(), state);
    }

    #[tokio::test]
    async fn test_subscription_starts_at_head() {
        let chain = MockChain::new(ChainId(0));
        chain.mine_blocks(3);
        let mut stream = chain.subscribe_blocks().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().height, 3);
        chain.mine_block();
        assert_eq!(stream.next().await.unwrap().unwrap().height, 4);
    }

    #[tokio::test]
    async fn test_quorum_on_first_vote_passes_after_active_is_seen() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(1);

        chain.submit_transaction(vote(1, 7)).await.unwrap();
        assert_eq!(chain.proposal(&key()).unwrap().status, ProposalStatus::Active);

        let raw = chain
            .query_state(&MockChain::BRIDGE, &key().storage_key())
            .await
            .unwrap();
        let seen = codec::decode_proposal_state(&raw, 0).unwrap();
        assert_eq!(seen.status, ProposalStatus::Active);
        assert_eq!(chain.proposal(&key()).unwrap().status, ProposalStatus::Passed);
        assert_eq!(
            chain.history(&key()),
            vec![
                ProposalStatus::Inactive,
                ProposalStatus::Active,
                ProposalStatus::Passed
            ]
        );
    }

    #[tokio::test]
    async fn test_settle_passes_parked_proposals() {
        let chain = MockChain::new(ChainId(1));
        chain.set_threshold(1);
        chain.submit_transaction(vote(1, 7)).await.unwrap();

        let mut execute = vote(1, 7);
        execute.kind = TxKind::Execute;
        let err = chain.submit_transaction(execute.clone()).await.unwrap_err();
        assert_eq!(err, ConnectorError::Rejected(RejectionReason::NotPassed));

        chain.settle();
        chain.submit_transaction(execute).await.unwrap();
        assert_eq!(
            chain.history(&key()),
            vec![
                ProposalStatus::Inactive,
                ProposalStatus::Active,
                ProposalStatus::Passed,
                ProposalStatus::Executed
            ]
        );
    }
}
