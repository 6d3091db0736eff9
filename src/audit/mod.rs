//! Audit Batching
//!
//! Hashing, batching and Merkle commitment of audit events, and the
//! verification rules an independent auditor needs.

pub mod batch;
pub mod event;
pub mod hash;
pub mod merkle;
pub mod verify;

pub use batch::{AppendOutcome, Batch, BatchAccumulator, BatchPolicy, BatchState, ClosedBatch};
pub use event::AuditEvent;
pub use hash::Digest;
pub use merkle::{merkle_root, InclusionProof, MerkleTree, ProofStep, Side};
pub use verify::{compute_root, ensure_root, verify_inclusion};
