use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

// Heights and nonces are u64 on chain but BIGINT in Postgres. Values above
// i64::MAX are rejected on write rather than wrapped.

/// Row of `watcher_checkpoints`
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WatcherCheckpointRow {
    pub chain_id: i64,
    pub block_height: i64,
    pub updated_at: DateTime<Utc>,
}

/// Row of `resource_nonces`
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ResourceNonceRow {
    pub chain_id: i64,
    pub resource_id: Vec<u8>,
    pub last_nonce: i64,
}

/// Row of `pending_deposits`
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PendingDepositRow {
    pub source_chain_id: i64,
    pub destination_chain_id: i64,
    pub resource_id: Vec<u8>,
    pub deposit_nonce: i64,
    pub payload: Vec<u8>,
    pub block_height: i64,
    pub block_hash: Vec<u8>,
    pub event_index: i64,
    pub tx_ref: String,
    pub created_at: DateTime<Utc>,
}
