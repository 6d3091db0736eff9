//! Proof Verification
//!
//! Recomputes roots from inclusion proofs and from stored batch hashes.
//! Needs nothing beyond the published hashing rule in `audit::hash`.

use tracing::{debug, error};
use uuid::Uuid;

use crate::audit::hash::{leaf_hash, node_hash, Digest};
use crate::audit::merkle::{merkle_root, InclusionProof, Side};
use crate::error::AnchorError;

/// Root implied by an event hash and its sibling path
pub fn compute_root(event_hash: &Digest, proof: &InclusionProof) -> Digest {
    proof
        .sibling_path
        .iter()
        .fold(leaf_hash(event_hash), |current, step| match step.side {
            Side::Left => node_hash(&step.digest, &current),
            Side::Right => node_hash(&current, &step.digest),
        })
}

/// Verify an inclusion proof against an expected root
pub fn verify_inclusion(event_hash: &Digest, proof: &InclusionProof, expected_root: &Digest) -> bool {
    if proof.event_hash != *event_hash {
        debug!(
            "Proof is for {} but {} was presented",
            proof.event_hash, event_hash
        );
        return false;
    }
    compute_root(event_hash, proof) == *expected_root
}

/// Recompute a batch root from stored hashes and require it to match
pub fn ensure_root(
    batch_id: Uuid,
    event_hashes: &[Digest],
    expected_root: &Digest,
) -> Result<(), AnchorError> {
    let actual = merkle_root(event_hashes)?;
    if actual != *expected_root {
        error!(
            "VERIFICATION MISMATCH for batch {}: anchored root {}, recomputed {}",
            batch_id, expected_root, actual
        );
        return Err(AnchorError::VerificationMismatch {
            batch_id,
            expected: *expected_root,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::merkle::MerkleTree;

    fn hashes(count: usize) -> Vec<Digest> {
        (0..count)
            .map(|i| Digest::hash(format!("entry-{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_every_leaf_verifies() {
        for count in [1, 2, 3, 4, 5, 8, 13] {
            let batch = hashes(count);
            let tree = MerkleTree::build(&batch).unwrap();
            for hash in &batch {
                let proof = tree.prove_inclusion(hash).unwrap();
                assert!(verify_inclusion(hash, &proof, &tree.root()), "count {}", count);
            }
        }
    }

    #[test]
    fn test_wrong_root_fails() {
        let batch = hashes(4);
        let tree = MerkleTree::build(&batch).unwrap();
        let proof = tree.prove_inclusion(&batch[1]).unwrap();
        assert!(!verify_inclusion(&batch[1], &proof, &Digest::hash(b"other root")));
    }

    #[test]
    fn test_flipped_side_fails() {
        let batch = hashes(4);
        let tree = MerkleTree::build(&batch).unwrap();
        let mut proof = tree.prove_inclusion(&batch[0]).unwrap();
        proof.sibling_path[0].side = Side::Left;
        assert!(!verify_inclusion(&batch[0], &proof, &tree.root()));
    }

    #[test]
    fn test_proof_for_other_event_fails() {
        let batch = hashes(4);
        let tree = MerkleTree::build(&batch).unwrap();
        let proof = tree.prove_inclusion(&batch[0]).unwrap();
        assert!(!verify_inclusion(&batch[1], &proof, &tree.root()));
    }

    #[test]
    fn test_ensure_root_detects_tampering() {
        let mut batch = hashes(5);
        let root = merkle_root(&batch).unwrap();
        assert!(ensure_root(Uuid::nil(), &batch, &root).is_ok());

        batch[3] = Digest::hash(b"tampered");
        match ensure_root(Uuid::nil(), &batch, &root) {
            Err(AnchorError::VerificationMismatch { expected, actual, .. }) => {
                assert_eq!(expected, root);
                assert_ne!(actual, root);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }
}
