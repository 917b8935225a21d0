//! Chain connector capability
//!
//! Everything chain-specific (RPC transport, signing, fee handling, event
//! filtering by contract) lives behind this trait. The core only sees block
//! headers, raw events, transaction handles and opaque state blobs.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ConnectorError;
use crate::types::{BlockHeader, RawEvent, TransactionRequest, TxHandle, TxStatus};

pub mod gateway;

pub use gateway::GatewayConnector;

/// Lazy, infinite stream of new block headers
pub type BlockStream = BoxStream<'static, Result<BlockHeader, ConnectorError>>;

#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Subscribe to new block headers. The stream may skip heights; the
    /// watcher backfills gaps through [`get_events`](Self::get_events).
    async fn subscribe_blocks(&self) -> Result<BlockStream, ConnectorError>;

    /// Bridge events emitted in blocks `from..=to`, in block then event order
    async fn get_events(&self, from: u64, to: u64) -> Result<Vec<RawEvent>, ConnectorError>;

    /// Sign and broadcast a transaction; returns without waiting for inclusion
    async fn submit_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<TxHandle, ConnectorError>;

    async fn get_transaction_status(&self, handle: &TxHandle) -> Result<TxStatus, ConnectorError>;

    /// Read a contract storage value; empty when the key is unset
    async fn query_state(&self, contract: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, ConnectorError>;
}
