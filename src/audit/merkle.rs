//! Merkle Tree for Audit Batches
//!
//! Builds a binary Merkle tree over the ordered event hashes of one batch
//! and extracts inclusion proofs. The tree is kept as one vector of digests
//! per level (leaves first) and is dropped once root and proofs are taken.
//!
//! Odd levels duplicate their last node: `node_hash(last, last)`. Verifiers
//! must apply the same rule.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::audit::hash::{leaf_hash, node_hash, Digest};
use crate::error::AnchorError;

/// Position of a sibling relative to the running hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub digest: Digest,
    pub side: Side,
}

/// Sibling path from a leaf to the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub event_hash: Digest,
    pub leaf_index: usize,
    pub sibling_path: Vec<ProofStep>,
}

impl InclusionProof {
    pub fn size(&self) -> usize {
        self.sibling_path.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Inclusion proof for {} at leaf {}: {} siblings",
            self.event_hash,
            self.leaf_index,
            self.sibling_path.len()
        )
    }
}

/// Merkle tree over one batch
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
    event_hashes: Vec<Digest>,
    leaf_index: HashMap<Digest, usize>,
}

impl MerkleTree {
    /// Build a tree from event hashes in batch order
    pub fn build(event_hashes: &[Digest]) -> Result<Self, AnchorError> {
        if event_hashes.is_empty() {
            return Err(AnchorError::EmptyBatch);
        }

        let mut levels = Vec::new();
        let mut current: Vec<Digest> = event_hashes.iter().map(leaf_hash).collect();

        while current.len() > 1 {
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [last] => node_hash(last, last),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(current);
            current = next;
        }
        levels.push(current);

        let mut leaf_index = HashMap::with_capacity(event_hashes.len());
        for (index, hash) in event_hashes.iter().enumerate() {
            leaf_index.entry(*hash).or_insert(index);
        }

        let tree = Self {
            levels,
            event_hashes: event_hashes.to_vec(),
            leaf_index,
        };
        debug!(
            "Built Merkle tree: {} leaves, depth {}, root {}",
            tree.leaf_count(),
            tree.depth(),
            tree.root()
        );
        Ok(tree)
    }

    pub fn root(&self) -> Digest {
        // build() always leaves a single-node top level
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> usize {
        self.event_hashes.len()
    }

    /// Number of hashing levels above the leaves
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Inclusion proof for an event hash
    pub fn prove_inclusion(&self, event_hash: &Digest) -> Result<InclusionProof, AnchorError> {
        let index = *self
            .leaf_index
            .get(event_hash)
            .ok_or_else(|| AnchorError::not_found(format!("Event hash {} not in batch", event_hash)))?;
        Ok(self.proof_at(index))
    }

    /// Inclusion proofs for every leaf, in batch order
    pub fn proofs(&self) -> Vec<InclusionProof> {
        (0..self.leaf_count()).map(|i| self.proof_at(i)).collect()
    }

    fn proof_at(&self, leaf_index: usize) -> InclusionProof {
        let mut sibling_path = Vec::with_capacity(self.depth());
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let step = if index % 2 == 0 {
                // Missing right sibling means the node was duplicated
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                ProofStep {
                    digest: *sibling,
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    digest: level[index - 1],
                    side: Side::Left,
                }
            };
            sibling_path.push(step);
            index /= 2;
        }

        InclusionProof {
            event_hash: self.event_hashes[leaf_index],
            leaf_index,
            sibling_path,
        }
    }
}

/// Merkle root for an ordered batch of event hashes
pub fn merkle_root(event_hashes: &[Digest]) -> Result<Digest, AnchorError> {
    Ok(MerkleTree::build(event_hashes)?.root())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(count: usize) -> Vec<Digest> {
        (0..count)
            .map(|i| Digest::hash(format!("event-{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(matches!(MerkleTree::build(&[]), Err(AnchorError::EmptyBatch)));
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let batch = hashes(1);
        let tree = MerkleTree::build(&batch).unwrap();
        assert_eq!(tree.root(), leaf_hash(&batch[0]));
        assert_eq!(tree.depth(), 0);
        assert!(tree.prove_inclusion(&batch[0]).unwrap().sibling_path.is_empty());
    }

    #[test]
    fn test_two_leaves() {
        let batch = hashes(2);
        let root = merkle_root(&batch).unwrap();
        assert_eq!(root, node_hash(&leaf_hash(&batch[0]), &leaf_hash(&batch[1])));
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let batch = hashes(3);
        let l: Vec<Digest> = batch.iter().map(leaf_hash).collect();
        let expected = node_hash(&node_hash(&l[0], &l[1]), &node_hash(&l[2], &l[2]));
        assert_eq!(merkle_root(&batch).unwrap(), expected);
    }

    #[test]
    fn test_five_leaves_duplicate_at_each_unbalanced_level() {
        let batch = hashes(5);
        let l: Vec<Digest> = batch.iter().map(leaf_hash).collect();
        let n01 = node_hash(&l[0], &l[1]);
        let n23 = node_hash(&l[2], &l[3]);
        let n44 = node_hash(&l[4], &l[4]);
        let left = node_hash(&n01, &n23);
        let right = node_hash(&n44, &n44);
        assert_eq!(merkle_root(&batch).unwrap(), node_hash(&left, &right));
    }

    #[test]
    fn test_proof_sides() {
        let batch = hashes(3);
        let tree = MerkleTree::build(&batch).unwrap();

        let proof = tree.prove_inclusion(&batch[2]).unwrap();
        assert_eq!(proof.leaf_index, 2);
        assert_eq!(proof.sibling_path[0].side, Side::Right);
        assert_eq!(proof.sibling_path[0].digest, leaf_hash(&batch[2]));
        assert_eq!(proof.sibling_path[1].side, Side::Left);

        let proof = tree.prove_inclusion(&batch[1]).unwrap();
        assert_eq!(proof.sibling_path[0].side, Side::Left);
        assert_eq!(proof.sibling_path[0].digest, leaf_hash(&batch[0]));
    }

    #[test]
    fn test_missing_hash_not_found() {
        let tree = MerkleTree::build(&hashes(4)).unwrap();
        let absent = Digest::hash(b"absent");
        assert!(matches!(
            tree.prove_inclusion(&absent),
            Err(AnchorError::NotFound(_))
        ));
    }

    #[test]
    fn test_proofs_cover_every_leaf() {
        let tree = MerkleTree::build(&hashes(7)).unwrap();
        let proofs = tree.proofs();
        assert_eq!(proofs.len(), 7);
        assert!(proofs.iter().all(|p| p.size() == tree.depth()));
    }
}
