//! Anchor Record
//!
//! Durable state of one batch's anchoring attempt. Transitions only move
//! forward: Pending -> Confirmed, Pending -> Failed, and Failed -> Pending
//! when an operator retries. Confirmed is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::batch::Batch;
use crate::audit::hash::Digest;
use crate::error::AnchorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionState {
    Pending,
    Confirmed,
    Failed,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Confirmed => "Confirmed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl FromStr for SubmissionState {
    type Err = AnchorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Confirmed" => Ok(Self::Confirmed),
            "Failed" => Ok(Self::Failed),
            other => Err(AnchorError::ValidationError(format!(
                "Unknown submission state: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub batch_id: Uuid,
    pub merkle_root: Digest,
    pub submission_state: SubmissionState,
    pub ledger_tx_ref: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub block_height: Option<u64>,
    /// Last transaction the ledger rejected; never reused on resubmission
    pub rejected_tx_ref: Option<String>,
}

impl AnchorRecord {
    /// Write-ahead record created before the ledger is contacted
    pub fn pending(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            merkle_root: batch.merkle_root,
            submission_state: SubmissionState::Pending,
            ledger_tx_ref: None,
            submitted_at: Utc::now(),
            confirmed_at: None,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            block_height: None,
            rejected_tx_ref: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.submission_state == SubmissionState::Pending
    }

    /// Pending with no scheduled attempt in the future
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }

    pub fn mark_submitted(&mut self, tx_ref: String) -> Result<(), AnchorError> {
        self.require(SubmissionState::Pending, SubmissionState::Pending)?;
        self.ledger_tx_ref = Some(tx_ref);
        self.next_attempt_at = None;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_confirmed(
        &mut self,
        confirmed_at: DateTime<Utc>,
        block_height: Option<u64>,
    ) -> Result<(), AnchorError> {
        self.require(SubmissionState::Pending, SubmissionState::Confirmed)?;
        if self.ledger_tx_ref.is_none() {
            return Err(AnchorError::ValidationError(format!(
                "Batch {} cannot be confirmed without a ledger transaction",
                self.batch_id
            )));
        }
        self.submission_state = SubmissionState::Confirmed;
        self.confirmed_at = Some(confirmed_at);
        self.block_height = block_height;
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), AnchorError> {
        self.require(SubmissionState::Pending, SubmissionState::Failed)?;
        self.submission_state = SubmissionState::Failed;
        self.last_error = Some(reason.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// The ledger rejected the acknowledged transaction. The ref is moved
    /// aside so a reopened record submits the root again.
    pub fn mark_rejected(&mut self, reason: impl Into<String>) -> Result<(), AnchorError> {
        self.mark_failed(reason)?;
        self.rejected_tx_ref = self.ledger_tx_ref.take();
        Ok(())
    }

    /// Idempotency key for the next submission; changes after a rejection
    /// so the ledger cannot hand back the rejected transaction
    pub fn idempotency_key(&self) -> String {
        match &self.rejected_tx_ref {
            Some(rejected) => format!("{}/after/{}", self.batch_id, rejected),
            None => self.batch_id.to_string(),
        }
    }

    /// Count a transient failure and schedule the next attempt
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AnchorError> {
        self.require(SubmissionState::Pending, SubmissionState::Pending)?;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        Ok(())
    }

    /// Operator retry of a failed anchoring
    pub fn reopen(&mut self) -> Result<(), AnchorError> {
        self.require(SubmissionState::Failed, SubmissionState::Pending)?;
        self.submission_state = SubmissionState::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
        Ok(())
    }

    fn require(&self, expected: SubmissionState, to: SubmissionState) -> Result<(), AnchorError> {
        if self.submission_state != expected {
            return Err(AnchorError::invalid_transition(
                self.batch_id,
                self.submission_state,
                to,
            ));
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "Anchor {} [{}] root {} tx {} retries {}",
            self.batch_id,
            self.submission_state,
            self.merkle_root,
            self.ledger_tx_ref.as_deref().unwrap_or("-"),
            self.retry_count
        )
    }
}
