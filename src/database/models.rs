use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::anchor::record::AnchorRecord;
use crate::audit::batch::Batch;
use crate::audit::hash::Digest;
use crate::error::AnchorError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchRow {
    pub batch_id: String,
    pub sequence_number: i64,
    pub closed_at: DateTime<Utc>,
    pub merkle_root: String,
    pub event_count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchEventRow {
    pub position: i64,
    pub event_id: String,
    pub event_hash: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnchorRecordRow {
    pub batch_id: String,
    pub merkle_root: String,
    pub submission_state: String,
    pub ledger_tx_ref: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub block_height: Option<i64>,
    pub rejected_tx_ref: Option<String>,
}

fn parse_uuid(text: &str) -> Result<Uuid, AnchorError> {
    Uuid::parse_str(text)
        .map_err(|e| AnchorError::DatabaseError(format!("Corrupt UUID '{}': {}", text, e)))
}

fn parse_digest(text: &str) -> Result<Digest, AnchorError> {
    text.parse()
        .map_err(|e| AnchorError::DatabaseError(format!("Corrupt digest '{}': {}", text, e)))
}

impl BatchRow {
    /// Assemble a batch from its row and its event rows (ordered by position)
    pub fn into_batch(self, events: Vec<BatchEventRow>) -> Result<Batch, AnchorError> {
        if events.len() as i64 != self.event_count {
            return Err(AnchorError::DatabaseError(format!(
                "Batch {} lists {} events but {} are stored",
                self.batch_id,
                self.event_count,
                events.len()
            )));
        }

        let mut event_ids = Vec::with_capacity(events.len());
        let mut event_hashes = Vec::with_capacity(events.len());
        for (expected, row) in events.into_iter().enumerate() {
            if row.position != expected as i64 {
                return Err(AnchorError::DatabaseError(format!(
                    "Batch {} has a gap at position {}",
                    self.batch_id, expected
                )));
            }
            event_ids.push(parse_uuid(&row.event_id)?);
            event_hashes.push(parse_digest(&row.event_hash)?);
        }

        Ok(Batch {
            batch_id: parse_uuid(&self.batch_id)?,
            sequence_number: self.sequence_number as u64,
            event_ids,
            event_hashes,
            closed_at: self.closed_at,
            merkle_root: parse_digest(&self.merkle_root)?,
        })
    }
}

impl TryFrom<AnchorRecordRow> for AnchorRecord {
    type Error = AnchorError;

    fn try_from(row: AnchorRecordRow) -> Result<Self, Self::Error> {
        Ok(AnchorRecord {
            batch_id: parse_uuid(&row.batch_id)?,
            merkle_root: parse_digest(&row.merkle_root)?,
            submission_state: row.submission_state.parse()?,
            ledger_tx_ref: row.ledger_tx_ref,
            submitted_at: row.submitted_at,
            confirmed_at: row.confirmed_at,
            retry_count: row.retry_count as u32,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            block_height: row.block_height.map(|h| h as u64),
            rejected_tx_ref: row.rejected_tx_ref,
        })
    }
}
