//! Anchor Ledger
//!
//! Durable local record of batches, their ordered event hashes and the
//! anchoring state of each batch. Append-only: batches are never updated
//! and confirmed anchor records are never overwritten.

pub mod memory;
pub mod models;
pub mod queries;
pub mod schema;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::anchor::record::{AnchorRecord, SubmissionState};
use crate::audit::batch::Batch;
use crate::audit::hash::Digest;
use crate::error::{AnchorError, AnchorResult};
use queries::{CountedTable, Queries};

pub use memory::MemoryStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub batches: u64,
    pub events: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait AnchorLedger: Send + Sync {
    async fn save_batch(&self, batch: &Batch) -> AnchorResult<()>;

    async fn get_batch(&self, batch_id: &Uuid) -> AnchorResult<Option<Batch>>;

    async fn find_batch_by_event_id(&self, event_id: &Uuid) -> AnchorResult<Option<Batch>>;

    async fn find_batch_by_event_hash(&self, event_hash: &Digest) -> AnchorResult<Option<Batch>>;

    /// Sequence number the next batch should carry
    async fn next_sequence_number(&self) -> AnchorResult<u64>;

    async fn known_event_ids(&self) -> AnchorResult<Vec<Uuid>>;

    /// Fails if a record already exists for the batch
    async fn insert_record(&self, record: &AnchorRecord) -> AnchorResult<()>;

    /// Fails with `RootImmutable` for confirmed records or a changed root
    async fn update_record(&self, record: &AnchorRecord) -> AnchorResult<()>;

    async fn get_record(&self, batch_id: &Uuid) -> AnchorResult<Option<AnchorRecord>>;

    async fn list_records(&self, state: SubmissionState) -> AnchorResult<Vec<AnchorRecord>>;

    async fn stats(&self) -> AnchorResult<LedgerStats>;
}

/// SQLite-backed anchor ledger
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> AnchorResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to :memory: is a separate database
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        info!("Connected to anchor database: {}", database_url);
        Ok(Database { pool })
    }

    pub async fn new_in_memory() -> AnchorResult<Self> {
        let database = Self::new("sqlite::memory:").await?;
        database.run_migrations().await?;
        Ok(database)
    }

    pub async fn run_migrations(&self) -> AnchorResult<()> {
        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Applied {} schema statements", schema::MIGRATIONS.len());
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_batch(&self, batch_id: &str) -> AnchorResult<Option<Batch>> {
        match Queries::get_batch(&self.pool, batch_id).await? {
            Some((row, events)) => Ok(Some(row.into_batch(events)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AnchorLedger for Database {
    async fn save_batch(&self, batch: &Batch) -> AnchorResult<()> {
        Queries::insert_batch(&self.pool, batch)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AnchorError::ValidationError(format!(
                        "Batch {} overlaps an existing batch: {}",
                        batch.batch_id, db
                    ))
                }
                _ => AnchorError::from(e),
            })?;
        debug!("Stored {}", batch.summary());
        Ok(())
    }

    async fn get_batch(&self, batch_id: &Uuid) -> AnchorResult<Option<Batch>> {
        self.load_batch(&batch_id.to_string()).await
    }

    async fn find_batch_by_event_id(&self, event_id: &Uuid) -> AnchorResult<Option<Batch>> {
        match Queries::batch_id_for_event(&self.pool, &event_id.to_string()).await? {
            Some(batch_id) => self.load_batch(&batch_id).await,
            None => Ok(None),
        }
    }

    async fn find_batch_by_event_hash(&self, event_hash: &Digest) -> AnchorResult<Option<Batch>> {
        match Queries::batch_id_for_event_hash(&self.pool, &event_hash.to_string()).await? {
            Some(batch_id) => self.load_batch(&batch_id).await,
            None => Ok(None),
        }
    }

    async fn next_sequence_number(&self) -> AnchorResult<u64> {
        Ok(Queries::max_sequence_number(&self.pool)
            .await?
            .map(|max| max as u64 + 1)
            .unwrap_or(0))
    }

    async fn known_event_ids(&self) -> AnchorResult<Vec<Uuid>> {
        Queries::all_event_ids(&self.pool)
            .await?
            .iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|e| AnchorError::DatabaseError(format!("Corrupt event id '{}': {}", id, e)))
            })
            .collect()
    }

    async fn insert_record(&self, record: &AnchorRecord) -> AnchorResult<()> {
        Queries::insert_record(&self.pool, record)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => AnchorError::ValidationError(
                    format!("Anchor record for batch {} already exists", record.batch_id),
                ),
                _ => AnchorError::from(e),
            })
    }

    async fn update_record(&self, record: &AnchorRecord) -> AnchorResult<()> {
        if Queries::update_record(&self.pool, record).await? == 1 {
            return Ok(());
        }

        match self.get_record(&record.batch_id).await? {
            None => Err(AnchorError::not_found(format!(
                "anchor record for batch {}",
                record.batch_id
            ))),
            Some(_) => Err(AnchorError::RootImmutable(record.batch_id)),
        }
    }

    async fn get_record(&self, batch_id: &Uuid) -> AnchorResult<Option<AnchorRecord>> {
        Queries::get_record(&self.pool, &batch_id.to_string())
            .await?
            .map(AnchorRecord::try_from)
            .transpose()
    }

    async fn list_records(&self, state: SubmissionState) -> AnchorResult<Vec<AnchorRecord>> {
        Queries::list_records(&self.pool, state)
            .await?
            .into_iter()
            .map(AnchorRecord::try_from)
            .collect()
    }

    async fn stats(&self) -> AnchorResult<LedgerStats> {
        Ok(LedgerStats {
            batches: Queries::count(&self.pool, CountedTable::Batches).await? as u64,
            events: Queries::count(&self.pool, CountedTable::Events).await? as u64,
            pending: Queries::count_records(&self.pool, SubmissionState::Pending).await? as u64,
            confirmed: Queries::count_records(&self.pool, SubmissionState::Confirmed).await? as u64,
            failed: Queries::count_records(&self.pool, SubmissionState::Failed).await? as u64,
        })
    }
}
