//! Anchoring Pipeline
//!
//! Wires the accumulator, tree builder, anchor ledger and submitter
//! together. Ingestion only appends; tree building and persistence run in
//! the batch worker and ledger calls in spawned tasks or the reconciler.

pub mod query;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anchor::client::LedgerClient;
use crate::anchor::record::AnchorRecord;
use crate::anchor::retry::RetryPolicy;
use crate::anchor::submitter::{AnchorSubmitter, ReconcileReport};
use crate::audit::batch::{AppendOutcome, Batch, BatchAccumulator, BatchPolicy, ClosedBatch};
use crate::audit::event::AuditEvent;
use crate::database::{AnchorLedger, LedgerStats};
use crate::error::{AnchorError, AnchorResult};

pub use query::{AnchoredProof, AuditQuery};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub ledger: String,
    pub open_batch_id: Uuid,
    pub open_batch_events: usize,
    pub max_events: usize,
    pub max_age_secs: u64,
    pub stored: LedgerStats,
}

pub struct AnchorPipeline {
    accumulator: BatchAccumulator,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<ClosedBatch>>>,
    store: Arc<dyn AnchorLedger>,
    ledger: Arc<dyn LedgerClient>,
    submitter: Arc<AnchorSubmitter>,
    query: AuditQuery,
    shutdown_tx: watch::Sender<bool>,
}

impl AnchorPipeline {
    pub fn new(
        policy: BatchPolicy,
        retry: RetryPolicy,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn AnchorLedger>,
    ) -> Self {
        let (accumulator, closed_rx) = BatchAccumulator::new(policy);
        let submitter = Arc::new(AnchorSubmitter::new(ledger.clone(), store.clone(), retry));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            accumulator,
            closed_rx: Mutex::new(Some(closed_rx)),
            query: AuditQuery::new(store.clone()),
            store,
            ledger,
            submitter,
            shutdown_tx,
        }
    }

    /// Continue sequence numbering and duplicate detection from the store
    pub async fn resume(&self) -> AnchorResult<()> {
        let next_sequence = self.store.next_sequence_number().await?;
        let known_ids = self.store.known_event_ids().await?;
        self.accumulator.resume_from(next_sequence, known_ids).await
    }

    /// Accept one event into the open batch
    pub async fn ingest(&self, event: &AuditEvent) -> AnchorResult<AppendOutcome> {
        event.validate()?;
        if self.store.find_batch_by_event_id(&event.id).await?.is_some() {
            warn!("Rejected redelivered event {}", event.id);
            return Err(AnchorError::DuplicateEvent { event_id: event.id });
        }
        self.accumulator.append(event).await
    }

    /// Seal a closed batch and persist it
    pub async fn commit(&self, closed: ClosedBatch) -> AnchorResult<Batch> {
        let reason = closed.reason;
        let (batch, tree) = closed.seal()?;
        self.store.save_batch(&batch).await?;
        info!(
            "Committed {} ({:?} close, depth {})",
            batch.summary(),
            reason,
            tree.depth()
        );
        Ok(batch)
    }

    /// Commit with the retry policy's backoff. A batch that still cannot be
    /// persisted has its events released so redelivery re-ingests them.
    pub async fn commit_with_retry(&self, closed: ClosedBatch) -> AnchorResult<Batch> {
        let retry = self.submitter.retry_policy();
        let mut attempt = 0;
        loop {
            match self.commit(closed.clone()).await {
                Ok(batch) => return Ok(batch),
                Err(e) if !retry.is_exhausted(attempt) => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        "Commit of batch #{} failed (attempt {}), retrying in {:?}: {}",
                        closed.sequence_number, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "BATCH COMMIT FAILED for batch #{} after {} retries, releasing {} events: {}",
                        closed.sequence_number,
                        attempt,
                        closed.event_ids.len(),
                        e
                    );
                    self.accumulator.release(&closed.event_ids).await;
                    return Err(e);
                }
            }
        }
    }

    /// Commit and submit every batch closed so far, in the caller's task.
    ///
    /// Only available while the background batch worker is not running.
    pub async fn process_closed_batches(&self) -> AnchorResult<Vec<AnchorRecord>> {
        let mut guard = self.closed_rx.lock().await;
        let closed_rx = guard.as_mut().ok_or_else(|| {
            AnchorError::ValidationError("Closed batches are consumed by the batch worker".to_string())
        })?;

        let mut records = Vec::new();
        while let Ok(closed) = closed_rx.try_recv() {
            let batch = self.commit_with_retry(closed).await?;
            records.push(self.submitter.submit(&batch).await?);
        }
        Ok(records)
    }

    /// Close the open batch if it has outlived the age policy
    pub async fn tick(&self) -> AnchorResult<Option<u64>> {
        self.accumulator.poll_age(Utc::now()).await
    }

    /// Force-close the open batch
    pub async fn flush(&self) -> AnchorResult<Option<u64>> {
        self.accumulator.flush().await
    }

    pub async fn reconcile(&self) -> AnchorResult<ReconcileReport> {
        self.submitter.reconcile().await
    }

    pub async fn retry_failed(&self, batch_id: Uuid) -> AnchorResult<AnchorRecord> {
        self.submitter.retry_failed(batch_id).await
    }

    pub async fn cancel(&self, batch_id: Uuid) -> AnchorResult<AnchorRecord> {
        self.submitter.cancel(batch_id).await
    }

    pub fn query(&self) -> &AuditQuery {
        &self.query
    }

    pub fn submitter(&self) -> &AnchorSubmitter {
        &self.submitter
    }

    pub async fn status(&self) -> AnchorResult<PipelineStatus> {
        let policy = self.accumulator.policy();
        Ok(PipelineStatus {
            ledger: self.ledger.name().to_string(),
            open_batch_id: self.accumulator.current_batch_id().await,
            open_batch_events: self.accumulator.pending_events().await,
            max_events: policy.max_events,
            max_age_secs: policy.max_age.as_secs(),
            stored: self.store.stats().await?,
        })
    }

    /// Consume closed batches in the background; each submission runs in
    /// its own task.
    pub async fn spawn_batch_worker(self: &Arc<Self>) -> AnchorResult<JoinHandle<()>> {
        let mut closed_rx = self.closed_rx.lock().await.take().ok_or_else(|| {
            AnchorError::ValidationError("Batch worker already started".to_string())
        })?;
        let mut shutdown = self.shutdown_tx.subscribe();
        let pipeline = Arc::clone(self);

        Ok(tokio::spawn(async move {
            info!("Batch worker started");
            let mut submissions = JoinSet::new();
            loop {
                tokio::select! {
                    received = closed_rx.recv() => match received {
                        Some(closed) => pipeline.dispatch(closed, &mut submissions).await,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        // Anything flushed before shutdown is still queued
                        while let Ok(closed) = closed_rx.try_recv() {
                            pipeline.dispatch(closed, &mut submissions).await;
                        }
                        break;
                    }
                    Some(_) = submissions.join_next(), if !submissions.is_empty() => {}
                }
            }
            while submissions.join_next().await.is_some() {}
            info!("Batch worker stopped");
        }))
    }

    /// Drive the age policy on a fixed interval
    pub fn spawn_age_ticker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pipeline.tick().await {
                            error!("Age check failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn spawn_reconciler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pipeline.reconcile().await {
                            error!("Reconciliation failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Flush the open batch and stop the background tasks
    pub async fn shutdown(&self) -> AnchorResult<()> {
        if let Some(sequence) = self.flush().await? {
            info!("Flushed batch #{} on shutdown", sequence);
        }
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    async fn dispatch(&self, closed: ClosedBatch, submissions: &mut JoinSet<()>) {
        // Failures are logged and the events released by commit_with_retry
        let Ok(batch) = self.commit_with_retry(closed).await else {
            return;
        };

        let submitter = Arc::clone(&self.submitter);
        submissions.spawn(async move {
            match submitter.submit(&batch).await {
                Ok(record) => debug!("{}", record.summary()),
                Err(e) => error!("Submission of batch #{} failed: {}", batch.sequence_number, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::memory::InMemoryLedger;
    use crate::anchor::record::SubmissionState;
    use crate::audit::hash::Digest;
    use crate::database::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose first `failures` batch writes fail
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl AnchorLedger for FlakyStore {
        async fn save_batch(&self, batch: &Batch) -> AnchorResult<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AnchorError::DatabaseError("database is locked".to_string()));
            }
            self.inner.save_batch(batch).await
        }

        async fn get_batch(&self, batch_id: &Uuid) -> AnchorResult<Option<Batch>> {
            self.inner.get_batch(batch_id).await
        }

        async fn find_batch_by_event_id(&self, event_id: &Uuid) -> AnchorResult<Option<Batch>> {
            self.inner.find_batch_by_event_id(event_id).await
        }

        async fn find_batch_by_event_hash(&self, event_hash: &Digest) -> AnchorResult<Option<Batch>> {
            self.inner.find_batch_by_event_hash(event_hash).await
        }

        async fn next_sequence_number(&self) -> AnchorResult<u64> {
            self.inner.next_sequence_number().await
        }

        async fn known_event_ids(&self) -> AnchorResult<Vec<Uuid>> {
            self.inner.known_event_ids().await
        }

        async fn insert_record(&self, record: &AnchorRecord) -> AnchorResult<()> {
            self.inner.insert_record(record).await
        }

        async fn update_record(&self, record: &AnchorRecord) -> AnchorResult<()> {
            self.inner.update_record(record).await
        }

        async fn get_record(&self, batch_id: &Uuid) -> AnchorResult<Option<AnchorRecord>> {
            self.inner.get_record(batch_id).await
        }

        async fn list_records(&self, state: SubmissionState) -> AnchorResult<Vec<AnchorRecord>> {
            self.inner.list_records(state).await
        }

        async fn stats(&self) -> AnchorResult<LedgerStats> {
            self.inner.stats().await
        }
    }

    fn event(n: usize) -> AuditEvent {
        AuditEvent::new("service", format!("svc-{}", n), "core.orders.create", vec![n as u8])
    }

    fn pipeline(max_events: usize, ledger: Arc<InMemoryLedger>, store: Arc<MemoryStore>) -> AnchorPipeline {
        AnchorPipeline::new(
            BatchPolicy {
                max_events,
                max_age: Duration::from_secs(60),
            },
            RetryPolicy::immediate(3),
            ledger,
            store,
        )
    }

    #[tokio::test]
    async fn test_ingest_commit_submit() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(2, ledger.clone(), store.clone());

        pipeline.ingest(&event(1)).await.unwrap();
        let outcome = pipeline.ingest(&event(2)).await.unwrap();
        assert!(outcome.closed);

        let records = pipeline.process_closed_batches().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].submission_state, SubmissionState::Pending);
        assert_eq!(ledger.submit_calls(), 1);

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.stored.batches, 1);
        assert_eq!(status.stored.events, 2);
        assert_eq!(status.open_batch_events, 0);
    }

    #[tokio::test]
    async fn test_redelivered_event_rejected_after_restart() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let first = pipeline(1, ledger.clone(), store.clone());
        let e = event(1);
        first.ingest(&e).await.unwrap();
        first.process_closed_batches().await.unwrap();

        let restarted = pipeline(1, ledger.clone(), store.clone());
        restarted.resume().await.unwrap();
        assert!(matches!(
            restarted.ingest(&e).await,
            Err(AnchorError::DuplicateEvent { .. })
        ));

        let outcome = restarted.ingest(&event(2)).await.unwrap();
        assert_eq!(outcome.sequence_number, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_through_worker() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(pipeline(10, ledger.clone(), store.clone()));
        let worker = pipeline.spawn_batch_worker().await.unwrap();

        pipeline.ingest(&event(1)).await.unwrap();
        pipeline.shutdown().await.unwrap();
        worker.await.unwrap();

        assert_eq!(store.stats().await.unwrap().batches, 1);
        assert_eq!(ledger.submit_calls(), 1);
        assert!(pipeline.process_closed_batches().await.is_err());
    }

    #[tokio::test]
    async fn test_worker_retries_failed_commit() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(FlakyStore::failing(1));
        let pipeline = Arc::new(AnchorPipeline::new(
            BatchPolicy {
                max_events: 2,
                max_age: Duration::from_secs(60),
            },
            RetryPolicy::immediate(3),
            ledger.clone(),
            store.clone(),
        ));
        let worker = pipeline.spawn_batch_worker().await.unwrap();

        let events = [event(1), event(2)];
        for e in &events {
            pipeline.ingest(e).await.unwrap();
        }
        pipeline.shutdown().await.unwrap();
        worker.await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(ledger.submit_calls(), 1);
        assert!(pipeline.query().get_proof(events[1].id).await.is_ok());
    }

    #[tokio::test]
    async fn test_uncommittable_batch_releases_events() {
        let ledger = Arc::new(InMemoryLedger::new());
        // One initial attempt plus three retries all fail
        let store = Arc::new(FlakyStore::failing(4));
        let pipeline = AnchorPipeline::new(
            BatchPolicy {
                max_events: 2,
                max_age: Duration::from_secs(60),
            },
            RetryPolicy::immediate(3),
            ledger.clone(),
            store.clone(),
        );

        let events = [event(1), event(2)];
        for e in &events {
            pipeline.ingest(e).await.unwrap();
        }
        assert!(matches!(
            pipeline.process_closed_batches().await,
            Err(AnchorError::DatabaseError(_))
        ));
        assert_eq!(store.stats().await.unwrap().batches, 0);
        assert_eq!(ledger.submit_calls(), 0);

        // Redelivery is accepted and the store has recovered
        for e in &events {
            pipeline.ingest(e).await.unwrap();
        }
        let records = pipeline.process_closed_batches().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(store.stats().await.unwrap().events, 2);
        assert!(pipeline.query().get_proof(events[0].id).await.is_ok());
    }
}
