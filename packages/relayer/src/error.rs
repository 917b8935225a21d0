//! Error taxonomy for the relayer core
//!
//! Transient connector failures are absorbed by retry loops. Decoding and
//! divergence errors are scoped to a single record or proposal key. Reorgs
//! halt the affected watcher. Chain rejections that mean "nothing left to do"
//! are not errors at all: they surface as tagged outcomes
//! (`SubmissionOutcome::AlreadyFinal`, `ExecutionOutcome::AlreadyExecuted`).

use std::fmt;

use thiserror::Error;

use crate::types::{ChainId, ProposalKey, ResourceId};

/// Crate-wide result alias
pub type Result<T, E = RelayerError> = std::result::Result<T, E>;

/// Errors reported by a [`ChainConnector`](crate::connector::ChainConnector)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Network, timeout or node-unavailable failure; always safe to retry
    #[error("transient connector error: {0}")]
    Transient(String),
    /// The chain refused the transaction
    #[error("transaction rejected: {0}")]
    Rejected(RejectionReason),
    /// The connector itself observed that a block it reported has changed
    #[error("connector reported reorg at height {height}")]
    Reorg { height: u64 },
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

/// Why the destination chain rejected a vote or execute transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    AlreadyVoted,
    AlreadyPassed,
    AlreadyExecuted,
    Cancelled,
    Expired,
    /// Execute attempted before quorum
    NotPassed,
    /// The chain aggregated votes for a different payload hash
    PayloadMismatch,
    /// The sender is not an authorized relayer on this chain
    Unauthorized,
    Other(String),
}

impl RejectionReason {
    /// Rejections meaning the proposal needs nothing more from this relayer
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RejectionReason::AlreadyVoted
                | RejectionReason::AlreadyPassed
                | RejectionReason::AlreadyExecuted
                | RejectionReason::Cancelled
                | RejectionReason::Expired
        )
    }

    /// Map a gateway/node error message onto a rejection reason
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("already voted") || lower.contains("relayer already voted") {
            RejectionReason::AlreadyVoted
        } else if lower.contains("already executed") || lower.contains("proposal executed") {
            RejectionReason::AlreadyExecuted
        } else if lower.contains("already passed") || lower.contains("proposal passed") {
            RejectionReason::AlreadyPassed
        } else if lower.contains("expired") {
            RejectionReason::Expired
        } else if lower.contains("cancelled") || lower.contains("canceled") {
            RejectionReason::Cancelled
        } else if lower.contains("not passed") || lower.contains("not been passed") {
            RejectionReason::NotPassed
        } else if lower.contains("data hash mismatch") || lower.contains("payload mismatch") {
            RejectionReason::PayloadMismatch
        } else if lower.contains("unauthorized") || lower.contains("not a relayer") {
            RejectionReason::Unauthorized
        } else {
            RejectionReason::Other(message.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RejectionReason::AlreadyVoted => "already_voted",
            RejectionReason::AlreadyPassed => "already_passed",
            RejectionReason::AlreadyExecuted => "already_executed",
            RejectionReason::Cancelled => "cancelled",
            RejectionReason::Expired => "expired",
            RejectionReason::NotPassed => "not_passed",
            RejectionReason::PayloadMismatch => "payload_mismatch",
            RejectionReason::Unauthorized => "unauthorized",
            RejectionReason::Other(message) => message,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed event, payload or state blob
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodingError {
    #[error("{what}: expected {expected} bytes, got {actual}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what}: value does not fit in {target}")]
    Overflow {
        what: &'static str,
        target: &'static str,
    },
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("resource {resource} is not registered on chain {chain_id}")]
    UnknownResource {
        resource: ResourceId,
        chain_id: ChainId,
    },
}

/// Errors surfaced by relayer components
#[derive(Debug, Error)]
pub enum RelayerError {
    #[error("transient connector failure on chain {chain_id}: {message}")]
    TransientConnector { chain_id: ChainId, message: String },

    #[error("retry budget exhausted on chain {chain_id} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        chain_id: ChainId,
        attempts: u32,
        last_error: String,
    },

    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),

    #[error("payload divergence for proposal {key}: local hash {local}, observed {observed}")]
    Divergence {
        key: ProposalKey,
        local: String,
        observed: String,
    },

    #[error(
        "reorg detected on chain {chain_id} at height {height}: \
         confirmed hash {expected}, now {observed}"
    )]
    ReorgDetected {
        chain_id: ChainId,
        height: u64,
        expected: String,
        observed: String,
    },

    #[error("chain {chain_id} rejected transaction: {reason}")]
    Rejected {
        chain_id: ChainId,
        reason: RejectionReason,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    Shutdown,

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl RelayerError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::TransientConnector { .. } => "transient",
            RelayerError::RetriesExhausted { .. } => "retries_exhausted",
            RelayerError::Decoding(_) => "decoding",
            RelayerError::Divergence { .. } => "divergence",
            RelayerError::ReorgDetected { .. } => "reorg",
            RelayerError::Rejected { .. } => "rejected",
            RelayerError::Persistence(_) => "persistence",
            RelayerError::Config(_) => "config",
            RelayerError::Shutdown => "shutdown",
            RelayerError::TaskFailed(_) => "task_failed",
        }
    }
}

impl From<sqlx::Error> for RelayerError {
    fn from(e: sqlx::Error) -> Self {
        RelayerError::Persistence(e.to_string())
    }
}
