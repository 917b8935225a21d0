use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error};

use crate::checkpoint::{sort_pending, Checkpoint, CheckpointStore};
use crate::error::{RelayerError, Result};
use crate::types::{ChainId, DepositRecord, EventOrigin, ProposalKey, ResourceId};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> EyreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> EyreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

fn to_db(what: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| RelayerError::Persistence(format!("{} {} exceeds BIGINT", what, value)))
}

fn from_db(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| RelayerError::Persistence(format!("negative {} {} in database", what, value)))
}

fn fixed32(what: &str, bytes: &[u8]) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| {
        RelayerError::Persistence(format!("{} of {} bytes in database", what, bytes.len()))
    })
}

impl TryFrom<PendingDepositRow> for DepositRecord {
    type Error = RelayerError;

    fn try_from(row: PendingDepositRow) -> Result<Self> {
        let event_index = u32::try_from(row.event_index).map_err(|_| {
            RelayerError::Persistence(format!("event index {} out of range", row.event_index))
        })?;
        Ok(DepositRecord {
            source_chain_id: ChainId(from_db("chain id", row.source_chain_id)?),
            destination_chain_id: ChainId(from_db("chain id", row.destination_chain_id)?),
            resource_id: ResourceId(fixed32("resource id", &row.resource_id)?),
            deposit_nonce: from_db("nonce", row.deposit_nonce)?,
            payload: row.payload,
            origin: EventOrigin {
                block_height: from_db("block height", row.block_height)?,
                block_hash: fixed32("block hash", &row.block_hash)?,
                event_index,
                tx_ref: row.tx_ref,
            },
        })
    }
}

/// Get the checkpoint row for a chain
pub async fn get_watcher_checkpoint(
    pool: &PgPool,
    chain_id: i64,
) -> Result<Option<WatcherCheckpointRow>> {
    let row = sqlx::query_as::<_, WatcherCheckpointRow>(
        r#"SELECT chain_id, block_height, updated_at FROM watcher_checkpoints WHERE chain_id = $1"#,
    )
    .bind(chain_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        error!("SQL error getting watcher checkpoint: {:?}", e);
        e
    })?;

    Ok(row)
}

/// Get the per-resource nonces recorded for a chain
pub async fn get_resource_nonces(pool: &PgPool, chain_id: i64) -> Result<Vec<ResourceNonceRow>> {
    let rows = sqlx::query_as::<_, ResourceNonceRow>(
        r#"SELECT chain_id, resource_id, last_nonce FROM resource_nonces WHERE chain_id = $1"#,
    )
    .bind(chain_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Postgres-backed [`CheckpointStore`]
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>> {
        let id = to_db("chain id", chain_id.0)?;
        let Some(row) = get_watcher_checkpoint(&self.pool, id).await? else {
            return Ok(None);
        };

        let mut checkpoint = Checkpoint::at(from_db("block height", row.block_height)?);
        for nonce in get_resource_nonces(&self.pool, id).await? {
            let resource = fixed32("resource id", &nonce.resource_id)?;
            checkpoint
                .resource_nonces
                .insert(ResourceId(resource), from_db("nonce", nonce.last_nonce)?);
        }

        Ok(Some(checkpoint))
    }

    async fn save(
        &self,
        chain_id: ChainId,
        checkpoint: &Checkpoint,
        deposits: &[DepositRecord],
    ) -> Result<()> {
        let id = to_db("chain id", chain_id.0)?;
        let height = to_db("block height", checkpoint.block_height)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO watcher_checkpoints (chain_id, block_height)
            VALUES ($1, $2)
            ON CONFLICT (chain_id) DO UPDATE SET block_height = $2, updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(height)
        .execute(&mut *tx)
        .await?;

        for (resource, nonce) in &checkpoint.resource_nonces {
            sqlx::query(
                r#"
                INSERT INTO resource_nonces (chain_id, resource_id, last_nonce)
                VALUES ($1, $2, $3)
                ON CONFLICT (chain_id, resource_id)
                DO UPDATE SET last_nonce = $3, updated_at = NOW()
                "#,
            )
            .bind(id)
            .bind(resource.as_bytes().to_vec())
            .bind(to_db("nonce", *nonce)?)
            .execute(&mut *tx)
            .await?;
        }

        for deposit in deposits {
            sqlx::query(
                r#"
                INSERT INTO pending_deposits (
                    source_chain_id, destination_chain_id, resource_id, deposit_nonce,
                    payload, block_height, block_hash, event_index, tx_ref
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(to_db("chain id", deposit.source_chain_id.0)?)
            .bind(to_db("chain id", deposit.destination_chain_id.0)?)
            .bind(deposit.resource_id.as_bytes().to_vec())
            .bind(to_db("nonce", deposit.deposit_nonce)?)
            .bind(deposit.payload.clone())
            .bind(to_db("block height", deposit.origin.block_height)?)
            .bind(deposit.origin.block_hash.to_vec())
            .bind(i64::from(deposit.origin.event_index))
            .bind(deposit.origin.tx_ref.clone())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            chain_id = %chain_id,
            height = checkpoint.block_height,
            deposits = deposits.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn pending_deposits(&self, destination: ChainId) -> Result<Vec<DepositRecord>> {
        let rows = sqlx::query_as::<_, PendingDepositRow>(
            r#"
            SELECT source_chain_id, destination_chain_id, resource_id, deposit_nonce, payload,
                   block_height, block_hash, event_index, tx_ref, created_at
            FROM pending_deposits
            WHERE destination_chain_id = $1
            "#,
        )
        .bind(to_db("chain id", destination.0)?)
        .fetch_all(&self.pool)
        .await?;

        let mut deposits = rows
            .into_iter()
            .map(DepositRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        sort_pending(&mut deposits);
        Ok(deposits)
    }

    async fn complete_deposit(&self, key: &ProposalKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM pending_deposits
            WHERE source_chain_id = $1 AND destination_chain_id = $2
              AND resource_id = $3 AND deposit_nonce = $4
            "#,
        )
        .bind(to_db("chain id", key.source_chain_id.0)?)
        .bind(to_db("chain id", key.destination_chain_id.0)?)
        .bind(key.resource_id.as_bytes().to_vec())
        .bind(to_db("nonce", key.deposit_nonce)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigint_conversion() {
        assert_eq!(to_db("x", 5).unwrap(), 5);
        assert!(to_db("x", u64::MAX).is_err());
        assert!(from_db("x", -1).is_err());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn test_pg_checkpoint_store() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = PgCheckpointStore::new(pool);

        let mut cp = Checkpoint::at(1234);
        cp.observe_nonce(ResourceId([3u8; 32]), 77);
        store.save(ChainId(900_001), &cp, &[]).await.unwrap();
        assert_eq!(store.load(ChainId(900_001)).await.unwrap(), Some(cp));
    }

    #[test]
    fn test_pending_row_conversion() {
        let row = PendingDepositRow {
            source_chain_id: 1,
            destination_chain_id: 2,
            resource_id: vec![3u8; 32],
            deposit_nonce: 4,
            payload: vec![5, 6],
            block_height: 7,
            block_hash: vec![8u8; 32],
            event_index: 9,
            tx_ref: "0x0a".to_string(),
            created_at: chrono::Utc::now(),
        };
        let record = DepositRecord::try_from(row.clone()).unwrap();
        assert_eq!(record.destination_chain_id, ChainId(2));
        assert_eq!(record.resource_id, ResourceId([3u8; 32]));
        assert_eq!(record.origin.event_index, 9);

        let short = PendingDepositRow {
            block_hash: vec![8u8; 31],
            ..row
        };
        assert!(DepositRecord::try_from(short).is_err());
    }
}
