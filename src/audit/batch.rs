//! Batch Accumulator
//!
//! Buffers audit events and cuts them into batches on a size/age policy.
//! Appends and the close decision share one lock, so an event lands in
//! exactly one batch. Closed batches are handed off on an mpsc channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::audit::event::AuditEvent;
use crate::audit::hash::Digest;
use crate::audit::merkle::MerkleTree;
use crate::error::AnchorError;

/// When an open batch is cut
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_events: usize,
    pub max_age: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_events: 256,
            max_age: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Size,
    Age,
    Flush,
}

/// Batch cut by the accumulator, not yet committed to a tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedBatch {
    pub batch_id: Uuid,
    pub sequence_number: u64,
    pub event_ids: Vec<Uuid>,
    pub event_hashes: Vec<Digest>,
    pub closed_at: DateTime<Utc>,
    pub reason: CloseReason,
}

impl ClosedBatch {
    /// Commit the batch to a Merkle tree
    pub fn seal(self) -> Result<(Batch, MerkleTree), AnchorError> {
        let tree = MerkleTree::build(&self.event_hashes)?;
        let batch = Batch {
            batch_id: self.batch_id,
            sequence_number: self.sequence_number,
            event_ids: self.event_ids,
            event_hashes: self.event_hashes,
            closed_at: self.closed_at,
            merkle_root: tree.root(),
        };
        Ok((batch, tree))
    }
}

/// Sealed batch; immutable once the root is computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub sequence_number: u64,
    pub event_ids: Vec<Uuid>,
    pub event_hashes: Vec<Digest>,
    pub closed_at: DateTime<Utc>,
    pub merkle_root: Digest,
}

impl Batch {
    pub fn event_count(&self) -> usize {
        self.event_hashes.len()
    }

    pub fn position_of(&self, event_id: &Uuid) -> Option<usize> {
        self.event_ids.iter().position(|id| id == event_id)
    }

    pub fn summary(&self) -> String {
        format!(
            "Batch #{} ({}): {} events, root {}",
            self.sequence_number,
            self.batch_id,
            self.event_count(),
            self.merkle_root
        )
    }
}

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub batch_id: Uuid,
    pub sequence_number: u64,
    pub position: usize,
    /// The append filled the batch and triggered the cut
    pub closed: bool,
}

#[derive(Debug)]
struct OpenBatch {
    batch_id: Uuid,
    sequence_number: u64,
    state: BatchState,
    event_ids: Vec<Uuid>,
    event_hashes: Vec<Digest>,
    first_event_at: Option<DateTime<Utc>>,
}

impl OpenBatch {
    fn new(sequence_number: u64) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            sequence_number,
            state: BatchState::Open,
            event_ids: Vec::new(),
            event_hashes: Vec::new(),
            first_event_at: None,
        }
    }

    fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.first_event_at
            .and_then(|first| (now - first).to_std().ok())
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct AccumulatorState {
    current: OpenBatch,
    seen: HashSet<Uuid>,
}

/// Serializing accumulator for one anchoring pipeline
pub struct BatchAccumulator {
    policy: BatchPolicy,
    state: Mutex<AccumulatorState>,
    closed_tx: mpsc::UnboundedSender<ClosedBatch>,
}

impl BatchAccumulator {
    /// Create an accumulator and the receiver for its closed batches
    pub fn new(policy: BatchPolicy) -> (Self, mpsc::UnboundedReceiver<ClosedBatch>) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let accumulator = Self {
            policy,
            state: Mutex::new(AccumulatorState {
                current: OpenBatch::new(0),
                seen: HashSet::new(),
            }),
            closed_tx,
        };
        (accumulator, closed_rx)
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Seed sequence numbering and duplicate detection after a restart
    pub async fn resume_from(
        &self,
        next_sequence: u64,
        known_ids: impl IntoIterator<Item = Uuid>,
    ) -> Result<(), AnchorError> {
        let mut state = self.state.lock().await;
        if !state.current.event_ids.is_empty() {
            return Err(AnchorError::ValidationError(
                "Cannot resume an accumulator holding events".to_string(),
            ));
        }
        state.current = OpenBatch::new(next_sequence);
        state.seen.extend(known_ids);
        info!(
            "Accumulator resumed at sequence {} with {} known events",
            next_sequence,
            state.seen.len()
        );
        Ok(())
    }

    /// Append to whichever batch is currently open
    pub async fn append(&self, event: &AuditEvent) -> Result<AppendOutcome, AnchorError> {
        self.append_at(event, Utc::now()).await
    }

    pub async fn append_at(
        &self,
        event: &AuditEvent,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, AnchorError> {
        let mut state = self.state.lock().await;
        self.append_locked(&mut state, event, now)
    }

    /// Append only if `batch_id` is still the open batch
    pub async fn append_to(
        &self,
        batch_id: Uuid,
        event: &AuditEvent,
    ) -> Result<AppendOutcome, AnchorError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.current.batch_id != batch_id
            || state.current.is_expired(self.policy.max_age, now)
        {
            return Err(AnchorError::AccumulatorClosed { batch_id });
        }
        self.append_locked(&mut state, event, now)
    }

    /// Close the open batch if its first event is older than the max age
    pub async fn poll_age(&self, now: DateTime<Utc>) -> Result<Option<u64>, AnchorError> {
        let mut state = self.state.lock().await;
        if state.current.state == BatchState::Open
            && state.current.is_expired(self.policy.max_age, now)
        {
            let sequence = state.current.sequence_number;
            self.close_locked(&mut state, CloseReason::Age, now)?;
            return Ok(Some(sequence));
        }
        Ok(None)
    }

    /// Force-close a non-empty batch
    pub async fn flush(&self) -> Result<Option<u64>, AnchorError> {
        let mut state = self.state.lock().await;
        if state.current.event_ids.is_empty() {
            return Ok(None);
        }
        let sequence = state.current.sequence_number;
        self.close_locked(&mut state, CloseReason::Flush, Utc::now())?;
        Ok(Some(sequence))
    }

    /// Forget event ids of a batch that could not be committed so the
    /// events can be delivered again
    pub async fn release(&self, event_ids: &[Uuid]) {
        let mut state = self.state.lock().await;
        for id in event_ids {
            state.seen.remove(id);
        }
        info!("Released {} events for redelivery", event_ids.len());
    }

    pub async fn current_batch_id(&self) -> Uuid {
        self.state.lock().await.current.batch_id
    }

    pub async fn current_state(&self) -> BatchState {
        self.state.lock().await.current.state
    }

    pub async fn pending_events(&self) -> usize {
        self.state.lock().await.current.event_ids.len()
    }

    fn append_locked(
        &self,
        state: &mut AccumulatorState,
        event: &AuditEvent,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, AnchorError> {
        if state.seen.contains(&event.id) {
            return Err(AnchorError::DuplicateEvent { event_id: event.id });
        }
        if state.current.state != BatchState::Open {
            return Err(AnchorError::AccumulatorClosed {
                batch_id: state.current.batch_id,
            });
        }
        event.validate()?;

        if state.current.is_expired(self.policy.max_age, now) {
            self.close_locked(state, CloseReason::Age, now)?;
        }

        let current = &mut state.current;
        current.event_ids.push(event.id);
        current.event_hashes.push(event.event_hash());
        current.first_event_at.get_or_insert(now);
        state.seen.insert(event.id);

        let mut outcome = AppendOutcome {
            batch_id: state.current.batch_id,
            sequence_number: state.current.sequence_number,
            position: state.current.event_ids.len() - 1,
            closed: false,
        };
        debug!(
            "Appended {} to batch #{} at {}",
            event.summary(),
            outcome.sequence_number,
            outcome.position
        );

        // The event is held either way; a failed hand-off leaves it in the
        // Closing batch
        if state.current.event_ids.len() >= self.policy.max_events {
            outcome.closed = self.close_locked(state, CloseReason::Size, now).is_ok();
        }

        Ok(outcome)
    }

    fn close_locked(
        &self,
        state: &mut AccumulatorState,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<(), AnchorError> {
        let current = &mut state.current;
        current.state = BatchState::Closing;

        let closed = ClosedBatch {
            batch_id: current.batch_id,
            sequence_number: current.sequence_number,
            event_ids: std::mem::take(&mut current.event_ids),
            event_hashes: std::mem::take(&mut current.event_hashes),
            closed_at: now,
            reason,
        };

        if let Err(mpsc::error::SendError(returned)) = self.closed_tx.send(closed) {
            // Keep the events in the Closing batch rather than lose them
            current.event_ids = returned.event_ids;
            current.event_hashes = returned.event_hashes;
            error!(
                "Batch #{} could not be handed off: receiver dropped",
                current.sequence_number
            );
            return Err(AnchorError::AccumulatorClosed {
                batch_id: current.batch_id,
            });
        }

        current.state = BatchState::Closed;
        let next_sequence = current.sequence_number + 1;
        info!(
            "Closed batch #{} ({:?})",
            current.sequence_number, reason
        );
        state.current = OpenBatch::new(next_sequence);
        Ok(())
    }
}
