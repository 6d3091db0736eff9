//! Merkle commitment properties an auditor relies on

use audit_anchor::audit::hash::{leaf_hash, node_hash};
use audit_anchor::audit::{compute_root, merkle_root, verify_inclusion, AuditEvent, Digest, MerkleTree};
use audit_anchor::AnchorError;

mod common;
use common::*;

#[test]
fn test_every_leaf_proves_inclusion() {
    for count in [1, 2, 3, 4, 5, 7, 8, 9, 16, 33] {
        let hashes = test_hashes(count);
        let tree = MerkleTree::build(&hashes).unwrap();

        for (index, hash) in hashes.iter().enumerate() {
            let proof = tree.prove_inclusion(hash).unwrap();
            assert_eq!(proof.leaf_index, index);
            assert!(
                verify_inclusion(hash, &proof, &tree.root()),
                "leaf {} of {}",
                index,
                count
            );
        }
    }
}

#[test]
fn test_absent_hash_not_found() {
    let tree = MerkleTree::build(&test_hashes(5)).unwrap();
    assert!(matches!(
        tree.prove_inclusion(&Digest::hash(b"never batched")),
        Err(AnchorError::NotFound(_))
    ));
}

#[test]
fn test_empty_batch_rejected() {
    assert!(matches!(MerkleTree::build(&[]), Err(AnchorError::EmptyBatch)));
}

#[test]
fn test_single_leaf_root_is_leaf_hash() {
    let hashes = test_hashes(1);
    assert_eq!(merkle_root(&hashes).unwrap(), leaf_hash(&hashes[0]));
}

#[test]
fn test_odd_levels_duplicate_last_node() {
    let h = test_hashes(5);
    let l: Vec<Digest> = h.iter().map(leaf_hash).collect();

    let three = node_hash(&node_hash(&l[0], &l[1]), &node_hash(&l[2], &l[2]));
    assert_eq!(merkle_root(&h[..3]).unwrap(), three);

    let left = node_hash(&node_hash(&l[0], &l[1]), &node_hash(&l[2], &l[3]));
    let right_pair = node_hash(&l[4], &l[4]);
    let right = node_hash(&right_pair, &right_pair);
    assert_eq!(merkle_root(&h).unwrap(), node_hash(&left, &right));
}

#[test]
fn test_order_matters() {
    let hashes = test_hashes(4);
    let mut swapped = hashes.clone();
    swapped.swap(1, 2);
    assert_ne!(merkle_root(&hashes).unwrap(), merkle_root(&swapped).unwrap());
}

#[test]
fn test_build_is_deterministic() {
    let hashes = test_hashes(6);
    assert_eq!(merkle_root(&hashes).unwrap(), merkle_root(&hashes).unwrap());
}

#[test]
fn test_payload_change_changes_root() {
    let events = create_test_events(4);
    let hashes: Vec<Digest> = events.iter().map(AuditEvent::event_hash).collect();
    let original = merkle_root(&hashes).unwrap();

    let mut altered = events[2].clone();
    altered.payload = b"{\"record\":999}".to_vec();
    altered.payload_hash = Digest::hash(&altered.payload);
    assert_ne!(altered.event_hash(), events[2].event_hash());

    let mut altered_hashes = hashes.clone();
    altered_hashes[2] = altered.event_hash();
    assert_ne!(merkle_root(&altered_hashes).unwrap(), original);

    // The old proof no longer verifies the altered event
    let proof = MerkleTree::build(&hashes).unwrap().prove_inclusion(&hashes[2]).unwrap();
    assert!(!verify_inclusion(&altered.event_hash(), &proof, &original));
}

#[test]
fn test_proof_from_other_batch_fails() {
    let first = test_hashes(4);
    let second: Vec<Digest> = (10..14)
        .map(|i| Digest::hash(format!("event-{}", i).as_bytes()))
        .collect();
    let proof = MerkleTree::build(&first).unwrap().prove_inclusion(&first[0]).unwrap();
    assert!(!verify_inclusion(&first[0], &proof, &merkle_root(&second).unwrap()));
}

#[test]
fn test_tampered_sibling_detected() {
    let hashes = test_hashes(8);
    let tree = MerkleTree::build(&hashes).unwrap();
    let mut proof = tree.prove_inclusion(&hashes[5]).unwrap();
    proof.sibling_path[1].digest = Digest::hash(b"forged sibling");

    assert_ne!(compute_root(&hashes[5], &proof), tree.root());
    assert!(!verify_inclusion(&hashes[5], &proof, &tree.root()));
}

#[test]
fn test_proof_length_is_logarithmic() {
    let hashes = test_hashes(1000);
    let tree = MerkleTree::build(&hashes).unwrap();
    assert_eq!(tree.depth(), 10);
    assert!(tree.proofs().iter().all(|p| p.size() == 10));
}
