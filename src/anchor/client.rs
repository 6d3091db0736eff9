//! Ledger Client Contract
//!
//! The only interface the external append-only ledger has to satisfy.
//! Any ledger meeting it is pluggable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audit::hash::Digest;
use crate::error::AnchorError;

/// Status of a submitted root on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerStatus {
    /// Accepted but not yet final
    Pending,
    /// Final, optionally at a block height
    Confirmed { block_height: Option<u64> },
    /// Definitively refused
    Rejected { reason: String },
}

impl LedgerStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, LedgerStatus::Confirmed { .. })
    }

    pub fn block_height(&self) -> Option<u64> {
        match self {
            LedgerStatus::Confirmed { block_height } => *block_height,
            _ => None,
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a root and return the ledger's transaction reference.
    ///
    /// Errors: `SubmissionTimeout` and `LedgerUnavailable` are transient,
    /// `SubmissionRejected` is terminal.
    async fn submit_root(
        &self,
        root: &Digest,
        idempotency_key: Option<&str>,
    ) -> Result<String, AnchorError>;

    async fn get_status(&self, tx_ref: &str) -> Result<LedgerStatus, AnchorError>;

    /// Look up an earlier submission of `root`, used to recover from a crash
    /// between the write-ahead record and the ledger acknowledgement.
    async fn find_submission(&self, _root: &Digest) -> Result<Option<String>, AnchorError> {
        Ok(None)
    }

    /// Whether `submit_root` honours idempotency keys
    fn supports_idempotency_keys(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}
