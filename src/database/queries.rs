use sqlx::SqlitePool;

use crate::anchor::record::{AnchorRecord, SubmissionState};
use crate::audit::batch::Batch;
use crate::database::models::*;

pub struct Queries;

impl Queries {
    pub async fn insert_batch(pool: &SqlitePool, batch: &Batch) -> Result<(), sqlx::Error> {
        let batch_id = batch.batch_id.to_string();
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO batches (batch_id, sequence_number, closed_at, merkle_root, event_count)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&batch_id)
        .bind(batch.sequence_number as i64)
        .bind(batch.closed_at)
        .bind(batch.merkle_root.to_string())
        .bind(batch.event_count() as i64)
        .execute(&mut *tx)
        .await?;

        for (position, (event_id, event_hash)) in batch
            .event_ids
            .iter()
            .zip(batch.event_hashes.iter())
            .enumerate()
        {
            sqlx::query(
                r#"
                INSERT INTO batch_events (batch_id, position, event_id, event_hash)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(&batch_id)
            .bind(position as i64)
            .bind(event_id.to_string())
            .bind(event_hash.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn get_batch(
        pool: &SqlitePool,
        batch_id: &str,
    ) -> Result<Option<(BatchRow, Vec<BatchEventRow>)>, sqlx::Error> {
        let row: Option<BatchRow> = sqlx::query_as(
            r#"
            SELECT batch_id, sequence_number, closed_at, merkle_root, event_count
            FROM batches
            WHERE batch_id = ?1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let events: Vec<BatchEventRow> = sqlx::query_as(
            r#"
            SELECT position, event_id, event_hash
            FROM batch_events
            WHERE batch_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(batch_id)
        .fetch_all(pool)
        .await?;

        Ok(Some((row, events)))
    }

    pub async fn batch_id_for_event(
        pool: &SqlitePool,
        event_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT batch_id FROM batch_events WHERE event_id = ?1")
            .bind(event_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn batch_id_for_event_hash(
        pool: &SqlitePool,
        event_hash: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT batch_id FROM batch_events WHERE event_hash = ?1 ORDER BY rowid ASC LIMIT 1",
        )
        .bind(event_hash)
        .fetch_optional(pool)
        .await
    }

    pub async fn max_sequence_number(pool: &SqlitePool) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT MAX(sequence_number) FROM batches")
            .fetch_one(pool)
            .await
    }

    pub async fn all_event_ids(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT event_id FROM batch_events")
            .fetch_all(pool)
            .await
    }

    pub async fn insert_record(pool: &SqlitePool, record: &AnchorRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO anchor_records (
                batch_id, merkle_root, submission_state, ledger_tx_ref, submitted_at,
                confirmed_at, retry_count, next_attempt_at, last_error, block_height,
                rejected_tx_ref
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(record.batch_id.to_string())
        .bind(record.merkle_root.to_string())
        .bind(record.submission_state.to_string())
        .bind(&record.ledger_tx_ref)
        .bind(record.submitted_at)
        .bind(record.confirmed_at)
        .bind(record.retry_count as i64)
        .bind(record.next_attempt_at)
        .bind(&record.last_error)
        .bind(record.block_height.map(|h| h as i64))
        .bind(&record.rejected_tx_ref)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Update a record unless it is Confirmed or its root differs; returns rows changed
    pub async fn update_record(pool: &SqlitePool, record: &AnchorRecord) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE anchor_records SET
                submission_state = ?2,
                ledger_tx_ref = ?3,
                confirmed_at = ?4,
                retry_count = ?5,
                next_attempt_at = ?6,
                last_error = ?7,
                block_height = ?8,
                rejected_tx_ref = ?10
            WHERE batch_id = ?1
              AND merkle_root = ?9
              AND submission_state != 'Confirmed'
            "#,
        )
        .bind(record.batch_id.to_string())
        .bind(record.submission_state.to_string())
        .bind(&record.ledger_tx_ref)
        .bind(record.confirmed_at)
        .bind(record.retry_count as i64)
        .bind(record.next_attempt_at)
        .bind(&record.last_error)
        .bind(record.block_height.map(|h| h as i64))
        .bind(record.merkle_root.to_string())
        .bind(&record.rejected_tx_ref)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_record(
        pool: &SqlitePool,
        batch_id: &str,
    ) -> Result<Option<AnchorRecordRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT batch_id, merkle_root, submission_state, ledger_tx_ref, submitted_at,
                   confirmed_at, retry_count, next_attempt_at, last_error, block_height,
                   rejected_tx_ref
            FROM anchor_records
            WHERE batch_id = ?1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list_records(
        pool: &SqlitePool,
        state: SubmissionState,
    ) -> Result<Vec<AnchorRecordRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT batch_id, merkle_root, submission_state, ledger_tx_ref, submitted_at,
                   confirmed_at, retry_count, next_attempt_at, last_error, block_height,
                   rejected_tx_ref
            FROM anchor_records
            WHERE submission_state = ?1
            ORDER BY submitted_at ASC
            "#,
        )
        .bind(state.to_string())
        .fetch_all(pool)
        .await
    }

    pub async fn count(pool: &SqlitePool, table: CountedTable) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(table.sql()).fetch_one(pool).await
    }

    pub async fn count_records(pool: &SqlitePool, state: SubmissionState) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM anchor_records WHERE submission_state = ?1")
            .bind(state.to_string())
            .fetch_one(pool)
            .await
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CountedTable {
    Batches,
    Events,
}

impl CountedTable {
    fn sql(self) -> &'static str {
        match self {
            CountedTable::Batches => "SELECT COUNT(*) FROM batches",
            CountedTable::Events => "SELECT COUNT(*) FROM batch_events",
        }
    }
}
