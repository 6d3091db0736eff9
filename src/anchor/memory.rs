//! In-process ledger used by tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::anchor::client::{LedgerClient, LedgerStatus};
use crate::audit::hash::Digest;
use crate::error::AnchorError;

/// How the ledger answers `submit_root`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBehavior {
    Accept,
    Timeout,
    Unavailable,
    Reject,
    /// Records the submission but loses the acknowledgement
    AcceptThenTimeout,
}

#[derive(Debug, Default)]
struct LedgerState {
    transactions: HashMap<String, (Digest, LedgerStatus)>,
    by_key: HashMap<String, String>,
    by_root: HashMap<Digest, String>,
    next_height: u64,
}

pub struct InMemoryLedger {
    behavior: Mutex<LedgerBehavior>,
    state: Mutex<LedgerState>,
    submit_calls: AtomicUsize,
    idempotency_keys: bool,
    auto_confirm: bool,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(LedgerBehavior::Accept),
            state: Mutex::new(LedgerState {
                next_height: 1,
                ..LedgerState::default()
            }),
            submit_calls: AtomicUsize::new(0),
            idempotency_keys: true,
            auto_confirm: false,
        }
    }

    pub fn with_behavior(behavior: LedgerBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Self::new()
        }
    }

    pub fn without_idempotency_keys(mut self) -> Self {
        self.idempotency_keys = false;
        self
    }

    /// Confirm every submission immediately
    pub fn auto_confirming(mut self) -> Self {
        self.auto_confirm = true;
        self
    }

    pub async fn set_behavior(&self, behavior: LedgerBehavior) {
        *self.behavior.lock().await = behavior;
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn confirm(&self, tx_ref: &str) -> Result<(), AnchorError> {
        let mut state = self.state.lock().await;
        let height = state.next_height;
        let (_, status) = state
            .transactions
            .get_mut(tx_ref)
            .ok_or_else(|| AnchorError::not_found(format!("ledger transaction {}", tx_ref)))?;
        *status = LedgerStatus::Confirmed {
            block_height: Some(height),
        };
        state.next_height += 1;
        Ok(())
    }

    /// Confirm all pending transactions, returning how many changed
    pub async fn confirm_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let height = state.next_height;
        let mut confirmed = 0;
        for (_, status) in state.transactions.values_mut() {
            if *status == LedgerStatus::Pending {
                *status = LedgerStatus::Confirmed {
                    block_height: Some(height),
                };
                confirmed += 1;
            }
        }
        state.next_height += 1;
        confirmed
    }

    pub async fn reject(&self, tx_ref: &str, reason: &str) -> Result<(), AnchorError> {
        let mut state = self.state.lock().await;
        let (_, status) = state
            .transactions
            .get_mut(tx_ref)
            .ok_or_else(|| AnchorError::not_found(format!("ledger transaction {}", tx_ref)))?;
        *status = LedgerStatus::Rejected {
            reason: reason.to_string(),
        };
        Ok(())
    }

    async fn record(&self, root: &Digest, idempotency_key: Option<&str>) -> String {
        let mut state = self.state.lock().await;

        if let Some(existing) = idempotency_key
            .filter(|_| self.idempotency_keys)
            .and_then(|key| state.by_key.get(key))
        {
            return existing.clone();
        }

        let tx_ref = format!("memtx-{}", state.transactions.len() + 1);
        let status = if self.auto_confirm {
            let height = state.next_height;
            state.next_height += 1;
            LedgerStatus::Confirmed {
                block_height: Some(height),
            }
        } else {
            LedgerStatus::Pending
        };
        state.transactions.insert(tx_ref.clone(), (*root, status));
        state.by_root.insert(*root, tx_ref.clone());
        if let Some(key) = idempotency_key.filter(|_| self.idempotency_keys) {
            state.by_key.insert(key.to_string(), tx_ref.clone());
        }
        tx_ref
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit_root(
        &self,
        root: &Digest,
        idempotency_key: Option<&str>,
    ) -> Result<String, AnchorError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().await;
        debug!("In-memory ledger submit {} ({:?})", root, behavior);

        match behavior {
            LedgerBehavior::Accept => Ok(self.record(root, idempotency_key).await),
            LedgerBehavior::Timeout => Err(AnchorError::SubmissionTimeout(
                "in-memory ledger timed out".to_string(),
            )),
            LedgerBehavior::Unavailable => Err(AnchorError::LedgerUnavailable(
                "in-memory ledger unavailable".to_string(),
            )),
            LedgerBehavior::Reject => Err(AnchorError::SubmissionRejected(
                "in-memory ledger rejected root".to_string(),
            )),
            LedgerBehavior::AcceptThenTimeout => {
                self.record(root, idempotency_key).await;
                Err(AnchorError::SubmissionTimeout(
                    "acknowledgement lost".to_string(),
                ))
            }
        }
    }

    /// Unknown transactions read as rejected, like a gateway 404
    async fn get_status(&self, tx_ref: &str) -> Result<LedgerStatus, AnchorError> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .get(tx_ref)
            .map(|(_, status)| status.clone())
            .unwrap_or_else(|| LedgerStatus::Rejected {
                reason: format!("transaction {} not found on ledger", tx_ref),
            }))
    }

    async fn find_submission(&self, root: &Digest) -> Result<Option<String>, AnchorError> {
        Ok(self.state.lock().await.by_root.get(root).cloned())
    }

    fn supports_idempotency_keys(&self) -> bool {
        self.idempotency_keys
    }

    fn name(&self) -> &str {
        "memory"
    }
}
