use thiserror::Error;
use uuid::Uuid;

use crate::audit::hash::Digest;

impl From<serde_json::Error> for AnchorError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AnchorError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("Cannot build a Merkle tree from an empty batch")]
    EmptyBatch,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Batch {batch_id} is no longer accepting events")]
    AccumulatorClosed { batch_id: Uuid },

    #[error("Event {event_id} has already been batched")]
    DuplicateEvent { event_id: Uuid },

    #[error("Ledger submission timed out: {0}")]
    SubmissionTimeout(String),

    #[error("Ledger rejected submission: {0}")]
    SubmissionRejected(String),

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Verification mismatch for batch {batch_id}: expected root {expected}, recomputed {actual}")]
    VerificationMismatch {
        batch_id: Uuid,
        expected: Digest,
        actual: Digest,
    },

    #[error("Event {event_id} does not match its committed record: committed hash {committed}, presented {presented}")]
    EventMismatch {
        event_id: Uuid,
        committed: Digest,
        presented: Digest,
    },

    #[error("Invalid anchor state transition for batch {batch_id}: {from} -> {to}")]
    InvalidTransition {
        batch_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Anchor record for batch {0} is confirmed and cannot be modified")]
    RootImmutable(Uuid),

    #[error("Cannot cancel submission for batch {batch_id}: {reason}")]
    CancellationRefused { batch_id: Uuid, reason: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl AnchorError {
    /// Errors the submitter retries with backoff instead of surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SubmissionTimeout(_) | Self::LedgerUnavailable(_)
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_transition(batch_id: Uuid, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            batch_id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type AnchorResult<T> = Result<T, AnchorError>;
