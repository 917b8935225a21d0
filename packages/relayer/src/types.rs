//! Core data model shared by every pipeline stage
//!
//! Deposits, proposal keys and proposal state are plain values; the only
//! type holding a live handle is [`ChainDescriptor`], which pairs a chain's
//! static configuration with its connector.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::connector::ChainConnector;
use crate::error::DecodingError;

/// 32-byte hash (block hashes, payload hashes, storage keys)
pub type Hash32 = [u8; 32];

/// Deposit nonce assigned by the source chain per (chain, resource)
pub type DepositNonce = u64;

/// Bridge-level chain identifier, unique per configured chain
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        ChainId(id)
    }
}

fn decode_hex_bytes(what: &'static str, value: &str) -> Result<Vec<u8>, DecodingError> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(stripped).map_err(|e| DecodingError::Invalid {
        what,
        reason: e.to_string(),
    })
}

/// Left-pad up to 32 bytes into a word
fn left_pad_32(what: &'static str, bytes: &[u8]) -> Result<Hash32, DecodingError> {
    if bytes.is_empty() || bytes.len() > 32 {
        return Err(DecodingError::Length {
            what,
            expected: 32,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

/// Logical asset identifier shared by every chain bridging it
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(pub [u8; 32]);

impl ResourceId {
    /// Parse from hex (with or without 0x); shorter values are left-padded
    pub fn from_hex(value: &str) -> Result<Self, DecodingError> {
        let bytes = decode_hex_bytes("resource id", value)?;
        Ok(ResourceId(left_pad_32("resource id", &bytes)?))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.to_hex())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for ResourceId {
    type Error = DecodingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ResourceId::from_hex(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_hex()
    }
}

/// Signing identity of a relayer on a destination chain (left-padded address)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayerIdentity(pub [u8; 32]);

impl RelayerIdentity {
    /// Accepts 20-byte addresses as well as full 32-byte identities
    pub fn from_hex(value: &str) -> Result<Self, DecodingError> {
        let bytes = decode_hex_bytes("relayer identity", value)?;
        Ok(RelayerIdentity(left_pad_32("relayer identity", &bytes)?))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RelayerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayerIdentity({})", self.to_hex())
    }
}

impl fmt::Display for RelayerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for RelayerIdentity {
    type Error = DecodingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RelayerIdentity::from_hex(&value)
    }
}

impl From<RelayerIdentity> for String {
    fn from(id: RelayerIdentity) -> Self {
        id.to_hex()
    }
}

/// Header delivered by a chain's block subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: Hash32,
    pub parent_hash: Hash32,
}

/// Event as reported by a connector, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub block_height: u64,
    pub block_hash: Hash32,
    /// Position of the event within its block
    pub event_index: u32,
    /// Transaction reference, opaque to the core
    pub tx_ref: String,
    /// Event name, e.g. `Deposit`
    pub kind: String,
    pub data: Vec<u8>,
}

impl RawEvent {
    pub const DEPOSIT: &'static str = "Deposit";

    pub fn is_deposit(&self) -> bool {
        self.kind == Self::DEPOSIT
    }
}

/// Where a deposit was observed. Logging only, never part of a key or hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrigin {
    pub block_height: u64,
    pub block_hash: Hash32,
    pub event_index: u32,
    pub tx_ref: String,
}

/// A confirmed deposit on a source chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub resource_id: ResourceId,
    pub deposit_nonce: DepositNonce,
    pub payload: Vec<u8>,
    pub origin: EventOrigin,
}

impl DepositRecord {
    pub fn proposal_key(&self) -> ProposalKey {
        ProposalKey {
            source_chain_id: self.source_chain_id,
            destination_chain_id: self.destination_chain_id,
            deposit_nonce: self.deposit_nonce,
            resource_id: self.resource_id,
        }
    }

    /// keccak256 of the raw payload, used for duplicate/divergence checks
    pub fn payload_hash(&self) -> Hash32 {
        codec::keccak256(&self.payload)
    }
}

/// Identifies one cross-chain transfer intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProposalKey {
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
}

impl ProposalKey {
    /// Key under which the destination bridge stores this proposal
    pub fn storage_key(&self) -> Hash32 {
        codec::proposal_storage_key(self)
    }
}

impl fmt::Display for ProposalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}#{}@{}",
            self.source_chain_id, self.destination_chain_id, self.deposit_nonce, self.resource_id
        )
    }
}

/// Canonical proposal data and its hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalPayload {
    pub data: Vec<u8>,
    /// keccak256(handler address || data)
    pub hash: Hash32,
}

impl ProposalPayload {
    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }
}

/// Proposal lifecycle on the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Inactive,
    Active,
    Passed,
    Executed,
    Cancelled,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Inactive => "inactive",
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Cancelled => "cancelled",
        }
    }

    /// Wire code used in encoded proposal state
    pub fn code(&self) -> u8 {
        match self {
            ProposalStatus::Inactive => 0,
            ProposalStatus::Active => 1,
            ProposalStatus::Passed => 2,
            ProposalStatus::Executed => 3,
            ProposalStatus::Cancelled => 4,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ProposalStatus::Inactive),
            1 => Some(ProposalStatus::Active),
            2 => Some(ProposalStatus::Passed),
            3 => Some(ProposalStatus::Executed),
            4 => Some(ProposalStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalStatus::Executed | ProposalStatus::Cancelled)
    }

    /// Whether an observer may move from `self` to `next`.
    ///
    /// Observations can skip states between polls (Active straight to
    /// Executed), but never move backward or between terminal states.
    pub fn can_advance_to(&self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Executed, _) | (Cancelled, _) => false,
            (Passed, Executed) | (Passed, Cancelled) => true,
            (Passed, _) => false,
            (Active, Inactive) => false,
            (Active, _) => true,
            (Inactive, _) => true,
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached view of a proposal's on-chain state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalState {
    pub status: ProposalStatus,
    pub vote_count: u32,
    pub threshold: u32,
    pub voters: BTreeSet<RelayerIdentity>,
    /// Payload hash the chain aggregated votes for, if any vote exists
    pub payload_hash: Option<Hash32>,
}

impl ProposalState {
    pub fn inactive(threshold: u32) -> Self {
        Self {
            status: ProposalStatus::Inactive,
            vote_count: 0,
            threshold,
            voters: BTreeSet::new(),
            payload_hash: None,
        }
    }

    pub fn has_voted(&self, identity: &RelayerIdentity) -> bool {
        self.voters.contains(identity)
    }

    pub fn quorum_reached(&self) -> bool {
        self.threshold > 0 && self.vote_count >= self.threshold
    }
}

/// Opaque transaction reference returned by a connector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TxHandle(pub String);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Vote,
    Execute,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Vote => "vote",
            TxKind::Execute => "execute",
        }
    }
}

/// Unsigned transaction intent handed to a destination connector.
///
/// Signing and fee handling live behind the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub kind: TxKind,
    pub sender: RelayerIdentity,
    pub contract: Vec<u8>,
    pub key: ProposalKey,
    pub payload: Vec<u8>,
    pub payload_hash: Hash32,
}

/// Payload layout a handler expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Fungible,
    NonFungible,
    Generic,
}

/// Handler registered for a resource on one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRef {
    pub kind: HandlerKind,
    pub address: Vec<u8>,
}

/// resourceId → handler, immutable after startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRegistry {
    handlers: BTreeMap<ResourceId, HandlerRef>,
}

impl ResourceRegistry {
    pub fn new(handlers: BTreeMap<ResourceId, HandlerRef>) -> Self {
        Self { handlers }
    }

    pub fn get(&self, resource: &ResourceId) -> Option<&HandlerRef> {
        self.handlers.get(resource)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl FromIterator<(ResourceId, HandlerRef)> for ResourceRegistry {
    fn from_iter<I: IntoIterator<Item = (ResourceId, HandlerRef)>>(iter: I) -> Self {
        Self {
            handlers: iter.into_iter().collect(),
        }
    }
}

/// Where a watcher starts when the process boots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Resume after the persisted checkpoint, or at `start_block` if none
    #[default]
    Checkpoint,
    /// Ignore checkpoints and start at the first unconfirmed block
    Latest,
}

/// Which pipelines a chain takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    Source,
    Destination,
    #[default]
    Both,
}

impl ChainRole {
    pub fn is_source(&self) -> bool {
        matches!(self, ChainRole::Source | ChainRole::Both)
    }

    pub fn is_destination(&self) -> bool {
        matches!(self, ChainRole::Destination | ChainRole::Both)
    }
}

/// Static description of a configured chain plus its connector
#[derive(Clone)]
pub struct ChainDescriptor {
    pub chain_id: ChainId,
    pub name: String,
    pub connector: Arc<dyn ChainConnector>,
    pub bridge_address: Vec<u8>,
    pub confirmation_depth: u64,
    pub resources: ResourceRegistry,
    pub identity: RelayerIdentity,
    /// Configured quorum; the on-chain value wins when they differ
    pub vote_threshold: Option<u32>,
    pub role: ChainRole,
    pub start_mode: StartMode,
    pub start_block: u64,
}

impl fmt::Debug for ChainDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDescriptor")
            .field("chain_id", &self.chain_id)
            .field("name", &self.name)
            .field("bridge_address", &hex::encode(&self.bridge_address))
            .field("confirmation_depth", &self.confirmation_depth)
            .field("resources", &self.resources.len())
            .field("identity", &self.identity)
            .field("vote_threshold", &self.vote_threshold)
            .field("role", &self.role)
            .field("start_mode", &self.start_mode)
            .field("start_block", &self.start_block)
            .finish()
    }
}
