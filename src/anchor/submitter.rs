//! Anchor Submitter
//!
//! Submits batch roots to the external ledger and reconciles their state.
//! A Pending record is written before the ledger is contacted and updated
//! right after, so a crash mid-submission is recovered by checking the
//! ledger instead of resubmitting blindly.
//!
//! Operations on one batch are serialized by a per-batch lock; different
//! batches proceed independently.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anchor::client::{LedgerClient, LedgerStatus};
use crate::anchor::record::{AnchorRecord, SubmissionState};
use crate::anchor::retry::RetryPolicy;
use crate::audit::batch::Batch;
use crate::database::AnchorLedger;
use crate::error::{AnchorError, AnchorResult};

/// What happened to one record during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Submitted,
    Recovered,
    Confirmed,
    Failed,
    Retrying,
    StillPending,
    Skipped,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub failed: usize,
    pub retried: usize,
    pub resubmitted: usize,
    pub recovered: usize,
    pub still_pending: usize,
    pub deferred: usize,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Submitted => self.resubmitted += 1,
            Outcome::Recovered => self.recovered += 1,
            Outcome::Confirmed => self.confirmed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Retrying => self.retried += 1,
            Outcome::StillPending => self.still_pending += 1,
            Outcome::Skipped => self.deferred += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "confirmed {}, failed {}, retrying {}, resubmitted {}, recovered {}, pending {}, deferred {}, errors {}",
            self.confirmed,
            self.failed,
            self.retried,
            self.resubmitted,
            self.recovered,
            self.still_pending,
            self.deferred,
            self.errors.len()
        )
    }
}

pub struct AnchorSubmitter {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn AnchorLedger>,
    retry: RetryPolicy,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl AnchorSubmitter {
    pub fn new(ledger: Arc<dyn LedgerClient>, store: Arc<dyn AnchorLedger>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            store,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Submit a sealed batch's root; returns the Pending record.
    ///
    /// Submitting a batch that already has a record returns that record
    /// without contacting the ledger.
    pub async fn submit(&self, batch: &Batch) -> AnchorResult<AnchorRecord> {
        let _guard = self.lock_batch(batch.batch_id).await;

        if let Some(existing) = self.store.get_record(&batch.batch_id).await? {
            debug!("Batch {} already has an anchor record", batch.batch_id);
            return Ok(existing);
        }

        let mut record = AnchorRecord::pending(batch);
        self.store.insert_record(&record).await?;
        info!(
            "Submitting batch #{} root {} to {} ledger",
            batch.sequence_number,
            batch.merkle_root,
            self.ledger.name()
        );

        match self.attempt_submission(&mut record).await? {
            Outcome::Failed => Err(AnchorError::SubmissionRejected(format!(
                "batch {}: {}",
                record.batch_id,
                record.last_error.as_deref().unwrap_or("rejected")
            ))),
            _ => Ok(record),
        }
    }

    /// Drive every due Pending record toward Confirmed or Failed
    pub async fn reconcile(&self) -> AnchorResult<ReconcileReport> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for record in self.store.list_records(SubmissionState::Pending).await? {
            if !record.is_due(now) {
                report.deferred += 1;
                continue;
            }

            match self.reconcile_record(record.batch_id).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("Reconciliation of batch {} failed: {}", record.batch_id, e);
                    report.errors.push(format!("{}: {}", record.batch_id, e));
                }
            }
        }

        if report != ReconcileReport::default() {
            info!("Reconciliation pass: {}", report.summary());
        }
        Ok(report)
    }

    /// Operator retry: Failed -> Pending with a fresh retry budget
    pub async fn retry_failed(&self, batch_id: Uuid) -> AnchorResult<AnchorRecord> {
        let _guard = self.lock_batch(batch_id).await;
        let mut record = self.load_record(batch_id).await?;
        record.reopen()?;
        self.store.update_record(&record).await?;
        info!("Batch {} reopened for anchoring", batch_id);
        Ok(record)
    }

    /// Cancel a submission the ledger has not acknowledged yet
    pub async fn cancel(&self, batch_id: Uuid) -> AnchorResult<AnchorRecord> {
        let _guard = self.lock_batch(batch_id).await;
        let mut record = self.load_record(batch_id).await?;

        if !record.is_pending() {
            return Err(AnchorError::CancellationRefused {
                batch_id,
                reason: format!("record is {}", record.submission_state),
            });
        }
        if let Some(tx_ref) = &record.ledger_tx_ref {
            return Err(AnchorError::CancellationRefused {
                batch_id,
                reason: format!("ledger already acknowledged transaction {}", tx_ref),
            });
        }

        record.mark_failed("canceled by operator before ledger acknowledgement")?;
        self.store.update_record(&record).await?;
        warn!("Anchoring of batch {} canceled", batch_id);
        Ok(record)
    }

    /// Records that exhausted retries or were rejected
    pub async fn failed_records(&self) -> AnchorResult<Vec<AnchorRecord>> {
        self.store.list_records(SubmissionState::Failed).await
    }

    async fn reconcile_record(&self, batch_id: Uuid) -> AnchorResult<Outcome> {
        let guard = self.lock_batch(batch_id).await;

        // Re-read under the lock; a concurrent submit may have moved it on
        let mut record = self.load_record(batch_id).await?;
        if !record.is_due(Utc::now()) {
            return Ok(Outcome::Skipped);
        }

        let outcome = match record.ledger_tx_ref.clone() {
            Some(tx_ref) => self.poll_status(&mut record, &tx_ref).await,
            None => self.resume_submission(&mut record).await,
        };

        drop(guard);
        self.release_lock(batch_id).await;
        outcome
    }

    async fn poll_status(&self, record: &mut AnchorRecord, tx_ref: &str) -> AnchorResult<Outcome> {
        match self.ledger.get_status(tx_ref).await {
            Ok(LedgerStatus::Pending) => {
                debug!("Batch {} still pending as {}", record.batch_id, tx_ref);
                Ok(Outcome::StillPending)
            }
            Ok(LedgerStatus::Confirmed { block_height }) => {
                record.mark_confirmed(Utc::now(), block_height)?;
                self.store.update_record(record).await?;
                info!(
                    "Batch {} anchored: tx {} at height {:?}",
                    record.batch_id, tx_ref, block_height
                );
                Ok(Outcome::Confirmed)
            }
            Ok(LedgerStatus::Rejected { reason }) => {
                record.mark_rejected(format!("ledger rejected {}: {}", tx_ref, reason))?;
                self.store.update_record(record).await?;
                error!(
                    "ANCHORING FAILED for batch {}: ledger rejected {}: {}",
                    record.batch_id, tx_ref, reason
                );
                Ok(Outcome::Failed)
            }
            Err(e) if e.is_transient() => {
                record.retry_count += 1;
                self.handle_transient(record, e).await
            }
            // The tx ref is kept; a reopened record polls it again
            Err(e) => self.fail_terminal(record, format!("status check of {} failed", tx_ref), e).await,
        }
    }

    async fn resume_submission(&self, record: &mut AnchorRecord) -> AnchorResult<Outcome> {
        // Without idempotency keys a lost acknowledgement must be found, not resent
        if !self.ledger.supports_idempotency_keys() {
            match self.ledger.find_submission(&record.merkle_root).await {
                Ok(Some(tx_ref)) if record.rejected_tx_ref.as_deref() == Some(tx_ref.as_str()) => {
                    debug!(
                        "Ledger still lists rejected {} for batch {}",
                        tx_ref, record.batch_id
                    );
                }
                Ok(Some(tx_ref)) => {
                    info!(
                        "Recovered earlier submission of batch {} as {}",
                        record.batch_id, tx_ref
                    );
                    record.mark_submitted(tx_ref)?;
                    self.store.update_record(record).await?;
                    return Ok(Outcome::Recovered);
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    record.retry_count += 1;
                    return self.handle_transient(record, e).await;
                }
                Err(e) => {
                    return self
                        .fail_terminal(record, "submission lookup failed".to_string(), e)
                        .await
                }
            }
        }

        record.retry_count += 1;
        debug!(
            "Resubmitting batch {} (retry {} of {})",
            record.batch_id, record.retry_count, self.retry.max_retries
        );
        self.attempt_submission(record).await
    }

    async fn attempt_submission(&self, record: &mut AnchorRecord) -> AnchorResult<Outcome> {
        let key = record.idempotency_key();
        let idempotency_key = self
            .ledger
            .supports_idempotency_keys()
            .then_some(key.as_str());

        match self.ledger.submit_root(&record.merkle_root, idempotency_key).await {
            Ok(tx_ref) => {
                debug!("Batch {} submitted as {}", record.batch_id, tx_ref);
                record.mark_submitted(tx_ref)?;
                self.store.update_record(record).await?;
                Ok(Outcome::Submitted)
            }
            Err(e) if e.is_transient() => self.handle_transient(record, e).await,
            Err(e) => {
                record.mark_failed(e.to_string())?;
                self.store.update_record(record).await?;
                error!("ANCHORING FAILED for batch {}: {}", record.batch_id, e);
                Ok(Outcome::Failed)
            }
        }
    }

    async fn handle_transient(&self, record: &mut AnchorRecord, err: AnchorError) -> AnchorResult<Outcome> {
        if self.retry.is_exhausted(record.retry_count) {
            record.mark_failed(format!(
                "gave up after {} retries: {}",
                record.retry_count, err
            ))?;
            self.store.update_record(record).await?;
            error!(
                "ANCHORING FAILED for batch {} after {} retries, manual intervention required: {}",
                record.batch_id, record.retry_count, err
            );
            return Ok(Outcome::Failed);
        }

        let delay = self.retry.delay_for_attempt(record.retry_count + 1);
        let next_attempt_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        record.schedule_retry(err.to_string(), next_attempt_at)?;
        self.store.update_record(record).await?;
        warn!(
            "Transient ledger error for batch {} (retry {} of {}), next attempt in {:?}: {}",
            record.batch_id, record.retry_count, self.retry.max_retries, delay, err
        );
        Ok(Outcome::Retrying)
    }

    async fn fail_terminal(
        &self,
        record: &mut AnchorRecord,
        context: String,
        err: AnchorError,
    ) -> AnchorResult<Outcome> {
        record.mark_failed(format!("{}: {}", context, err))?;
        self.store.update_record(record).await?;
        error!(
            "ANCHORING FAILED for batch {}, manual intervention required: {}: {}",
            record.batch_id, context, err
        );
        Ok(Outcome::Failed)
    }

    async fn load_record(&self, batch_id: Uuid) -> AnchorResult<AnchorRecord> {
        self.store
            .get_record(&batch_id)
            .await?
            .ok_or_else(|| AnchorError::not_found(format!("anchor record for batch {}", batch_id)))
    }

    async fn lock_batch(&self, batch_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(batch_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the batch's lock entry once nobody holds or awaits it
    async fn release_lock(&self, batch_id: Uuid) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(&batch_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&batch_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::memory::{InMemoryLedger, LedgerBehavior};
    use crate::audit::hash::Digest;
    use crate::audit::merkle::merkle_root;
    use crate::database::MemoryStore;

    async fn stored_batch(store: &MemoryStore, sequence_number: u64) -> Batch {
        let event_ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let event_hashes: Vec<Digest> = event_ids.iter().map(|id| Digest::hash(id.as_bytes())).collect();
        let batch = Batch {
            batch_id: Uuid::new_v4(),
            sequence_number,
            merkle_root: merkle_root(&event_hashes).unwrap(),
            event_ids,
            event_hashes,
            closed_at: Utc::now(),
        };
        store.save_batch(&batch).await.unwrap();
        batch
    }

    fn submitter(ledger: Arc<InMemoryLedger>, store: Arc<MemoryStore>) -> AnchorSubmitter {
        AnchorSubmitter::new(ledger, store, RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_submit_then_confirm() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;

        let record = submitter.submit(&batch).await.unwrap();
        assert_eq!(record.submission_state, SubmissionState::Pending);
        let tx_ref = record.ledger_tx_ref.clone().unwrap();

        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.still_pending, 1);

        ledger.confirm(&tx_ref).await.unwrap();
        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.confirmed, 1);

        let stored = store.get_record(&batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.submission_state, SubmissionState::Confirmed);
        assert!(stored.confirmed_at.is_some());
        assert_eq!(stored.ledger_tx_ref, Some(tx_ref));
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_deduplicated() {
        let ledger = Arc::new(InMemoryLedger::new().without_idempotency_keys());
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;

        let first = submitter.submit(&batch).await.unwrap();
        let second = submitter.submit(&batch).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.submit_calls(), 1);
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal_and_visible() {
        let ledger = Arc::new(InMemoryLedger::with_behavior(LedgerBehavior::Reject));
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;

        assert!(matches!(
            submitter.submit(&batch).await,
            Err(AnchorError::SubmissionRejected(_))
        ));
        let failed = submitter.failed_records().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].batch_id, batch.batch_id);

        submitter.reconcile().await.unwrap();
        assert_eq!(ledger.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_then_recovers() {
        let ledger = Arc::new(InMemoryLedger::with_behavior(LedgerBehavior::Unavailable));
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;

        let record = submitter.submit(&batch).await.unwrap();
        assert!(record.ledger_tx_ref.is_none());
        assert!(record.last_error.is_some());

        ledger.set_behavior(LedgerBehavior::Accept).await;
        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.resubmitted, 1);

        let stored = store.get_record(&batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.ledger_tx_ref.is_some());
    }

    #[tokio::test]
    async fn test_lost_ack_recovered_without_resubmission() {
        let ledger = Arc::new(
            InMemoryLedger::with_behavior(LedgerBehavior::AcceptThenTimeout).without_idempotency_keys(),
        );
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;

        submitter.submit(&batch).await.unwrap();
        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(ledger.submit_calls(), 1);
        assert_eq!(ledger.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let ledger = Arc::new(InMemoryLedger::with_behavior(LedgerBehavior::Timeout));
        let store = Arc::new(MemoryStore::new());
        let policy = RetryPolicy {
            initial_backoff: std::time::Duration::from_secs(600),
            max_backoff: std::time::Duration::from_secs(600),
            jitter: false,
            ..RetryPolicy::default()
        };
        let submitter = AnchorSubmitter::new(ledger.clone(), store.clone(), policy);
        let batch = stored_batch(&store, 0).await;

        submitter.submit(&batch).await.unwrap();
        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(ledger.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_before_acknowledgement() {
        let ledger = Arc::new(InMemoryLedger::with_behavior(LedgerBehavior::Timeout));
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());

        let unacknowledged = stored_batch(&store, 0).await;
        submitter.submit(&unacknowledged).await.unwrap();
        let canceled = submitter.cancel(unacknowledged.batch_id).await.unwrap();
        assert_eq!(canceled.submission_state, SubmissionState::Failed);

        ledger.set_behavior(LedgerBehavior::Accept).await;
        let acknowledged = stored_batch(&store, 1).await;
        submitter.submit(&acknowledged).await.unwrap();
        assert!(matches!(
            submitter.cancel(acknowledged.batch_id).await,
            Err(AnchorError::CancellationRefused { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_failed_reopens() {
        let ledger = Arc::new(InMemoryLedger::with_behavior(LedgerBehavior::Reject));
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;
        assert!(submitter.submit(&batch).await.is_err());

        ledger.set_behavior(LedgerBehavior::Accept).await;
        let reopened = submitter.retry_failed(batch.batch_id).await.unwrap();
        assert_eq!(reopened.submission_state, SubmissionState::Pending);

        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.resubmitted, 1);
    }

    #[tokio::test]
    async fn test_retry_after_ledger_rejection_resubmits() {
        for ledger in [InMemoryLedger::new(), InMemoryLedger::new().without_idempotency_keys()] {
            let ledger = Arc::new(ledger);
            let store = Arc::new(MemoryStore::new());
            let submitter = submitter(ledger.clone(), store.clone());
            let batch = stored_batch(&store, 0).await;

            let rejected_tx = submitter.submit(&batch).await.unwrap().ledger_tx_ref.unwrap();
            ledger.reject(&rejected_tx, "double spend").await.unwrap();
            assert_eq!(submitter.reconcile().await.unwrap().failed, 1);

            let failed = store.get_record(&batch.batch_id).await.unwrap().unwrap();
            assert_eq!(failed.submission_state, SubmissionState::Failed);
            assert!(failed.ledger_tx_ref.is_none());
            assert_eq!(failed.rejected_tx_ref.as_deref(), Some(rejected_tx.as_str()));

            let reopened = submitter.retry_failed(batch.batch_id).await.unwrap();
            assert!(reopened.ledger_tx_ref.is_none());
            assert_eq!(submitter.reconcile().await.unwrap().resubmitted, 1);
            assert_eq!(ledger.submit_calls(), 2);

            let resubmitted = store.get_record(&batch.batch_id).await.unwrap().unwrap();
            let new_tx = resubmitted.ledger_tx_ref.unwrap();
            assert_ne!(new_tx, rejected_tx);

            ledger.confirm(&new_tx).await.unwrap();
            assert_eq!(submitter.reconcile().await.unwrap().confirmed, 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_transaction_reads_as_rejected() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger.clone(), store.clone());
        let batch = stored_batch(&store, 0).await;

        let mut record = AnchorRecord::pending(&batch);
        record.mark_submitted("memtx-404".to_string()).unwrap();
        store.insert_record(&record).await.unwrap();

        let report = submitter.reconcile().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.errors.is_empty());
        assert_eq!(submitter.failed_records().await.unwrap().len(), 1);

        // Nothing left to poll
        assert_eq!(submitter.reconcile().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_lock_entry_kept_while_held() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let submitter = submitter(ledger, store);
        let batch_id = Uuid::new_v4();

        let guard = submitter.lock_batch(batch_id).await;
        submitter.release_lock(batch_id).await;
        assert!(submitter.locks.lock().await.contains_key(&batch_id));

        drop(guard);
        submitter.release_lock(batch_id).await;
        assert!(!submitter.locks.lock().await.contains_key(&batch_id));
    }
}
