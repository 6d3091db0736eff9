//! Ledger Anchoring
//!
//! Submission of batch roots to an external append-only ledger, the
//! durable record of each attempt, and reconciliation until the ledger
//! confirms or the retry budget runs out.

pub mod client;
pub mod http;
pub mod memory;
pub mod record;
pub mod retry;
pub mod submitter;

pub use client::{LedgerClient, LedgerStatus};
pub use http::HttpLedgerClient;
pub use memory::{InMemoryLedger, LedgerBehavior};
pub use record::{AnchorRecord, SubmissionState};
pub use retry::RetryPolicy;
pub use submitter::{AnchorSubmitter, ReconcileReport};
