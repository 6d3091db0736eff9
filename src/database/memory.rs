//! In-memory anchor ledger for tests and ephemeral pipelines.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AnchorLedger, LedgerStats};
use crate::anchor::record::{AnchorRecord, SubmissionState};
use crate::audit::batch::Batch;
use crate::audit::hash::Digest;
use crate::error::{AnchorError, AnchorResult};

#[derive(Debug, Default)]
struct StoreState {
    batches: HashMap<Uuid, Batch>,
    event_index: HashMap<Uuid, Uuid>,
    hash_index: HashMap<Digest, Uuid>,
    records: HashMap<Uuid, AnchorRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnchorLedger for MemoryStore {
    async fn save_batch(&self, batch: &Batch) -> AnchorResult<()> {
        let mut state = self.state.write().await;

        if state.batches.contains_key(&batch.batch_id)
            || state
                .batches
                .values()
                .any(|b| b.sequence_number == batch.sequence_number)
        {
            return Err(AnchorError::ValidationError(format!(
                "Batch {} (sequence {}) already stored",
                batch.batch_id, batch.sequence_number
            )));
        }
        if let Some(event_id) = batch
            .event_ids
            .iter()
            .find(|id| state.event_index.contains_key(*id))
        {
            return Err(AnchorError::DuplicateEvent { event_id: *event_id });
        }

        for event_id in &batch.event_ids {
            state.event_index.insert(*event_id, batch.batch_id);
        }
        for hash in &batch.event_hashes {
            state.hash_index.entry(*hash).or_insert(batch.batch_id);
        }
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: &Uuid) -> AnchorResult<Option<Batch>> {
        Ok(self.state.read().await.batches.get(batch_id).cloned())
    }

    async fn find_batch_by_event_id(&self, event_id: &Uuid) -> AnchorResult<Option<Batch>> {
        let state = self.state.read().await;
        Ok(state
            .event_index
            .get(event_id)
            .and_then(|batch_id| state.batches.get(batch_id))
            .cloned())
    }

    async fn find_batch_by_event_hash(&self, event_hash: &Digest) -> AnchorResult<Option<Batch>> {
        let state = self.state.read().await;
        Ok(state
            .hash_index
            .get(event_hash)
            .and_then(|batch_id| state.batches.get(batch_id))
            .cloned())
    }

    async fn next_sequence_number(&self) -> AnchorResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .batches
            .values()
            .map(|b| b.sequence_number + 1)
            .max()
            .unwrap_or(0))
    }

    async fn known_event_ids(&self) -> AnchorResult<Vec<Uuid>> {
        Ok(self.state.read().await.event_index.keys().copied().collect())
    }

    async fn insert_record(&self, record: &AnchorRecord) -> AnchorResult<()> {
        let mut state = self.state.write().await;
        if !state.batches.contains_key(&record.batch_id) {
            return Err(AnchorError::not_found(format!("batch {}", record.batch_id)));
        }
        if state.records.contains_key(&record.batch_id) {
            return Err(AnchorError::ValidationError(format!(
                "Anchor record for batch {} already exists",
                record.batch_id
            )));
        }
        state.records.insert(record.batch_id, record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &AnchorRecord) -> AnchorResult<()> {
        let mut state = self.state.write().await;
        let existing = state
            .records
            .get_mut(&record.batch_id)
            .ok_or_else(|| AnchorError::not_found(format!("anchor record for batch {}", record.batch_id)))?;

        if existing.submission_state == SubmissionState::Confirmed
            || existing.merkle_root != record.merkle_root
        {
            return Err(AnchorError::RootImmutable(record.batch_id));
        }
        *existing = record.clone();
        Ok(())
    }

    async fn get_record(&self, batch_id: &Uuid) -> AnchorResult<Option<AnchorRecord>> {
        Ok(self.state.read().await.records.get(batch_id).cloned())
    }

    async fn list_records(&self, submission_state: SubmissionState) -> AnchorResult<Vec<AnchorRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<AnchorRecord> = state
            .records
            .values()
            .filter(|r| r.submission_state == submission_state)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.submitted_at);
        Ok(records)
    }

    async fn stats(&self) -> AnchorResult<LedgerStats> {
        let state = self.state.read().await;
        let count = |s: SubmissionState| {
            state
                .records
                .values()
                .filter(|r| r.submission_state == s)
                .count() as u64
        };
        Ok(LedgerStats {
            batches: state.batches.len() as u64,
            events: state.event_index.len() as u64,
            pending: count(SubmissionState::Pending),
            confirmed: count(SubmissionState::Confirmed),
            failed: count(SubmissionState::Failed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn batch(sequence_number: u64) -> Batch {
        let event_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let event_hashes: Vec<Digest> = event_ids
            .iter()
            .map(|id| Digest::hash(id.as_bytes()))
            .collect();
        Batch {
            batch_id: Uuid::new_v4(),
            sequence_number,
            merkle_root: crate::audit::merkle::merkle_root(&event_hashes).unwrap(),
            event_ids,
            event_hashes,
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_batch_lookup_by_event() {
        let store = MemoryStore::new();
        let b = batch(0);
        store.save_batch(&b).await.unwrap();

        let by_id = store.find_batch_by_event_id(&b.event_ids[1]).await.unwrap();
        assert_eq!(by_id, Some(b.clone()));
        let by_hash = store.find_batch_by_event_hash(&b.event_hashes[0]).await.unwrap();
        assert_eq!(by_hash, Some(b.clone()));
        assert_eq!(store.next_sequence_number().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_event_cannot_join_two_batches() {
        let store = MemoryStore::new();
        let first = batch(0);
        store.save_batch(&first).await.unwrap();

        let mut second = batch(1);
        second.event_ids[0] = first.event_ids[0];
        assert!(matches!(
            store.save_batch(&second).await,
            Err(AnchorError::DuplicateEvent { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirmed_record_is_immutable() {
        let store = MemoryStore::new();
        let b = batch(0);
        store.save_batch(&b).await.unwrap();

        let mut record = AnchorRecord::pending(&b);
        store.insert_record(&record).await.unwrap();
        record.mark_submitted("tx-1".to_string()).unwrap();
        record.mark_confirmed(Utc::now(), Some(1)).unwrap();
        store.update_record(&record).await.unwrap();

        record.merkle_root = Digest::hash(b"forged");
        assert!(matches!(
            store.update_record(&record).await,
            Err(AnchorError::RootImmutable(_))
        ));
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.confirmed, 1);
    }
}
