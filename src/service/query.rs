//! Auditor-facing queries: inclusion proofs and anchored verification.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::anchor::record::{AnchorRecord, SubmissionState};
use crate::audit::batch::Batch;
use crate::audit::event::AuditEvent;
use crate::audit::hash::Digest;
use crate::audit::merkle::{InclusionProof, MerkleTree};
use crate::audit::verify::{ensure_root, verify_inclusion};
use crate::database::AnchorLedger;
use crate::error::{AnchorError, AnchorResult};

/// Inclusion proof together with what it was anchored as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredProof {
    pub event_id: Uuid,
    pub batch_id: Uuid,
    pub sequence_number: u64,
    pub proof: InclusionProof,
    pub merkle_root: Digest,
    pub ledger_tx_ref: Option<String>,
    pub submission_state: Option<SubmissionState>,
    pub block_height: Option<u64>,
}

impl AnchoredProof {
    /// Check the proof against its own root, without the store
    pub fn verify(&self) -> bool {
        verify_inclusion(&self.proof.event_hash, &self.proof, &self.merkle_root)
    }

    pub fn is_confirmed(&self) -> bool {
        self.submission_state == Some(SubmissionState::Confirmed)
    }
}

#[derive(Clone)]
pub struct AuditQuery {
    store: Arc<dyn AnchorLedger>,
}

impl AuditQuery {
    pub fn new(store: Arc<dyn AnchorLedger>) -> Self {
        Self { store }
    }

    /// Inclusion proof for an event, with its batch root and ledger reference
    pub async fn get_proof(&self, event_id: Uuid) -> AnchorResult<AnchoredProof> {
        let batch = self.batch_for(event_id).await?;
        let record = self.store.get_record(&batch.batch_id).await?;
        let merkle_root = anchored_root(&batch, record.as_ref());

        let tree = MerkleTree::build(&batch.event_hashes)?;
        if tree.root() != merkle_root {
            error!(
                "VERIFICATION MISMATCH for batch {}: stored hashes no longer produce root {}",
                batch.batch_id, merkle_root
            );
            return Err(AnchorError::VerificationMismatch {
                batch_id: batch.batch_id,
                expected: merkle_root,
                actual: tree.root(),
            });
        }

        let proof = tree.prove_inclusion(&event_hash_at(&batch, event_id)?)?;
        debug!("{}", proof.summary());

        Ok(AnchoredProof {
            event_id,
            batch_id: batch.batch_id,
            sequence_number: batch.sequence_number,
            proof,
            merkle_root,
            ledger_tx_ref: record.as_ref().and_then(|r| r.ledger_tx_ref.clone()),
            submission_state: record.as_ref().map(|r| r.submission_state),
            block_height: record.as_ref().and_then(|r| r.block_height),
        })
    }

    /// `Ok(true)` when the event's batch is confirmed and its stored hashes
    /// still reproduce the anchored root; `Ok(false)` when not yet anchored.
    pub async fn verify(&self, event_id: Uuid) -> AnchorResult<bool> {
        let batch = self.batch_for(event_id).await?;
        let record = match self.store.get_record(&batch.batch_id).await? {
            Some(record) if record.submission_state == SubmissionState::Confirmed => record,
            other => {
                debug!(
                    "Event {} is in batch {} which is not anchored yet ({:?})",
                    event_id,
                    batch.batch_id,
                    other.map(|r| r.submission_state)
                );
                return Ok(false);
            }
        };

        if batch.merkle_root != record.merkle_root {
            error!(
                "VERIFICATION MISMATCH for batch {}: stored root {} differs from anchored root {}",
                batch.batch_id, batch.merkle_root, record.merkle_root
            );
            return Err(AnchorError::VerificationMismatch {
                batch_id: batch.batch_id,
                expected: record.merkle_root,
                actual: batch.merkle_root,
            });
        }
        ensure_root(batch.batch_id, &batch.event_hashes, &record.merkle_root)?;

        let event_hash = event_hash_at(&batch, event_id)?;
        let proof = MerkleTree::build(&batch.event_hashes)?.prove_inclusion(&event_hash)?;
        let valid = verify_inclusion(&event_hash, &proof, &record.merkle_root);
        info!(
            "Event {} verified against root {} (tx {}): {}",
            event_id,
            record.merkle_root,
            record.ledger_tx_ref.as_deref().unwrap_or("-"),
            valid
        );
        Ok(valid)
    }

    /// Verify a presented original record rather than only its id.
    ///
    /// The payload is rehashed, so a rewritten payload carrying its old
    /// payload hash is caught too. A record that no longer hashes to what
    /// was batched fails with `EventMismatch`.
    pub async fn verify_event(&self, event: &AuditEvent) -> AnchorResult<bool> {
        let batch = self.batch_for(event.id).await?;
        let committed = event_hash_at(&batch, event.id)?;

        let mut presented = event.clone();
        presented.payload_hash = Digest::hash(&event.payload);
        let presented = presented.event_hash();

        if committed != presented {
            error!(
                "VERIFICATION MISMATCH for event {} in batch {}: committed hash {}, presented record hashes to {}",
                event.id, batch.batch_id, committed, presented
            );
            return Err(AnchorError::EventMismatch {
                event_id: event.id,
                committed,
                presented,
            });
        }

        self.verify(event.id).await
    }

    pub async fn failed_anchors(&self) -> AnchorResult<Vec<AnchorRecord>> {
        self.store.list_records(SubmissionState::Failed).await
    }

    async fn batch_for(&self, event_id: Uuid) -> AnchorResult<Batch> {
        self.store
            .find_batch_by_event_id(&event_id)
            .await?
            .ok_or_else(|| AnchorError::not_found(format!("event {}", event_id)))
    }
}

fn anchored_root(batch: &Batch, record: Option<&AnchorRecord>) -> Digest {
    record.map(|r| r.merkle_root).unwrap_or(batch.merkle_root)
}

fn event_hash_at(batch: &Batch, event_id: Uuid) -> AnchorResult<Digest> {
    batch
        .position_of(&event_id)
        .map(|position| batch.event_hashes[position])
        .ok_or_else(|| AnchorError::not_found(format!("event {} in batch {}", event_id, batch.batch_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::batch::{BatchAccumulator, BatchPolicy};
    use crate::database::MemoryStore;
    use std::time::Duration;

    async fn committed_batch(store: &MemoryStore, events: &[AuditEvent]) -> Batch {
        let (accumulator, mut closed_rx) = BatchAccumulator::new(BatchPolicy {
            max_events: events.len(),
            max_age: Duration::from_secs(60),
        });
        for event in events {
            accumulator.append(event).await.unwrap();
        }
        let (batch, _) = closed_rx.recv().await.unwrap().seal().unwrap();
        store.save_batch(&batch).await.unwrap();
        batch
    }

    fn events(count: usize) -> Vec<AuditEvent> {
        (0..count)
            .map(|i| AuditEvent::new("user", format!("u{}", i), "core.records.update", vec![i as u8; 4]))
            .collect()
    }

    #[tokio::test]
    async fn test_proof_before_anchoring() {
        let store = Arc::new(MemoryStore::new());
        let events = events(3);
        let batch = committed_batch(&store, &events).await;
        let query = AuditQuery::new(store.clone());

        let anchored = query.get_proof(events[1].id).await.unwrap();
        assert_eq!(anchored.batch_id, batch.batch_id);
        assert_eq!(anchored.merkle_root, batch.merkle_root);
        assert_eq!(anchored.proof.leaf_index, 1);
        assert!(anchored.ledger_tx_ref.is_none());
        assert!(anchored.verify());

        assert!(!query.verify(events[1].id).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_confirmed_event() {
        let store = Arc::new(MemoryStore::new());
        let events = events(5);
        let batch = committed_batch(&store, &events).await;

        let mut record = AnchorRecord::pending(&batch);
        store.insert_record(&record).await.unwrap();
        record.mark_submitted("tx-9".to_string()).unwrap();
        record.mark_confirmed(chrono::Utc::now(), Some(12)).unwrap();
        store.update_record(&record).await.unwrap();

        let query = AuditQuery::new(store.clone());
        assert!(query.verify(events[4].id).await.unwrap());
        assert!(query.verify_event(&events[4]).await.unwrap());

        let proof = query.get_proof(events[4].id).await.unwrap();
        assert!(proof.is_confirmed());
        assert_eq!(proof.ledger_tx_ref.as_deref(), Some("tx-9"));
        assert_eq!(proof.block_height, Some(12));
    }

    #[tokio::test]
    async fn test_altered_original_record_fails() {
        let store = Arc::new(MemoryStore::new());
        let events = events(2);
        committed_batch(&store, &events).await;
        let query = AuditQuery::new(store.clone());

        let mut altered = events[0].clone();
        altered.actor_id = "someone-else".to_string();
        assert!(matches!(
            query.verify_event(&altered).await,
            Err(AnchorError::EventMismatch { event_id, committed, .. })
                if event_id == events[0].id && committed == events[0].event_hash()
        ));

        let mut bad_payload = events[0].clone();
        bad_payload.payload = b"rewritten".to_vec();
        assert!(matches!(
            query.verify_event(&bad_payload).await,
            Err(AnchorError::EventMismatch { .. })
        ));

        // Rehashing a rewritten payload does not help either
        bad_payload.payload_hash = Digest::hash(&bad_payload.payload);
        assert!(matches!(
            query.verify_event(&bad_payload).await,
            Err(AnchorError::EventMismatch { .. })
        ));
        // An untouched record of an unanchored batch is just not verified yet
        assert!(!query.verify_event(&events[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_event_not_found() {
        let query = AuditQuery::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            query.get_proof(Uuid::new_v4()).await,
            Err(AnchorError::NotFound(_))
        ));
        assert!(matches!(
            query.verify(Uuid::new_v4()).await,
            Err(AnchorError::NotFound(_))
        ));
    }
}
