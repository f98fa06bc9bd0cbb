//! RFC 6962 style Merkle trees over SHA-256, with inclusion proofs.

use sha2::{Digest, Sha256};

pub const HASH_SIZE: usize = 32;

/// Upper bound on the number of aunts accepted in a proof, enough for any tree
/// this node will ever build.
const MAX_AUNTS: usize = 100;

const LEAF_PREFIX: u8 = 0;
const INNER_PREFIX: u8 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("proof total must be positive, got {0}")]
    InvalidTotal(i64),
    #[error("proof index {index} out of range for total {total}")]
    InvalidIndex { index: i64, total: i64 },
    #[error("proof has {0} aunts, more than the maximum of {MAX_AUNTS}")]
    TooManyAunts(usize),
    #[error("leaf hash has {0} bytes, expected {HASH_SIZE}")]
    InvalidLeafHashSize(usize),
    #[error("leaf hash does not match the leaf")]
    LeafHashMismatch,
    #[error("computed root does not match the expected root")]
    RootMismatch,
}

pub fn empty_hash() -> Vec<u8> {
    Sha256::digest([]).to_vec()
}

pub fn leaf_hash(leaf: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize().to_vec()
}

pub fn inner_hash(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().to_vec()
}

/// Largest power of two strictly less than `n`. Requires `n >= 2`.
fn split_point(n: usize) -> usize {
    debug_assert!(n >= 2);
    1 << (usize::BITS - (n - 1).leading_zeros() - 1)
}

pub fn hash_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    match items.len() {
        0 => empty_hash(),
        1 => leaf_hash(items[0].as_ref()),
        n => {
            let k = split_point(n);
            let left = hash_from_byte_slices(&items[..k]);
            let right = hash_from_byte_slices(&items[k..]);
            inner_hash(&left, &right)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Proof {
    pub total: i64,
    pub index: i64,
    pub leaf_hash: Vec<u8>,
    pub aunts: Vec<Vec<u8>>,
}

/// Returns the root hash of `items` and one inclusion proof per item.
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (Vec<u8>, Vec<Proof>) {
    if items.is_empty() {
        return (empty_hash(), Vec::new());
    }
    let leaves: Vec<Vec<u8>> = items.iter().map(|item| leaf_hash(item.as_ref())).collect();
    let (root, trails) = build_trails(&leaves);
    let total = items.len() as i64;
    let proofs = trails
        .into_iter()
        .zip(leaves)
        .enumerate()
        .map(|(index, (aunts, leaf_hash))| Proof {
            total,
            index: index as i64,
            leaf_hash,
            aunts,
        })
        .collect();
    (root, proofs)
}

/// Aunts are collected bottom up, the sibling closest to the leaf first.
fn build_trails(leaves: &[Vec<u8>]) -> (Vec<u8>, Vec<Vec<Vec<u8>>>) {
    if leaves.len() == 1 {
        return (leaves[0].clone(), vec![Vec::new()]);
    }
    let k = split_point(leaves.len());
    let (left_root, mut left_trails) = build_trails(&leaves[..k]);
    let (right_root, right_trails) = build_trails(&leaves[k..]);
    for trail in left_trails.iter_mut() {
        trail.push(right_root.clone());
    }
    left_trails.extend(right_trails.into_iter().map(|mut trail| {
        trail.push(left_root.clone());
        trail
    }));
    (inner_hash(&left_root, &right_root), left_trails)
}

fn compute_hash_from_aunts(
    index: i64,
    total: i64,
    leaf_hash: &[u8],
    aunts: &[Vec<u8>],
) -> Option<Vec<u8>> {
    if index >= total || index < 0 || total <= 0 {
        return None;
    }
    if total == 1 {
        return aunts.is_empty().then(|| leaf_hash.to_vec());
    }
    let (last, rest) = aunts.split_last()?;
    let k = split_point(total as usize) as i64;
    if index < k {
        let left = compute_hash_from_aunts(index, k, leaf_hash, rest)?;
        Some(inner_hash(&left, last))
    } else {
        let right = compute_hash_from_aunts(index - k, total - k, leaf_hash, rest)?;
        Some(inner_hash(last, &right))
    }
}

impl Proof {
    pub fn validate_basic(&self) -> Result<(), MerkleError> {
        if self.total <= 0 {
            return Err(MerkleError::InvalidTotal(self.total));
        }
        if self.index < 0 || self.index >= self.total {
            return Err(MerkleError::InvalidIndex {
                index: self.index,
                total: self.total,
            });
        }
        if self.leaf_hash.len() != HASH_SIZE {
            return Err(MerkleError::InvalidLeafHashSize(self.leaf_hash.len()));
        }
        if self.aunts.len() > MAX_AUNTS {
            return Err(MerkleError::TooManyAunts(self.aunts.len()));
        }
        Ok(())
    }

    pub fn compute_root_hash(&self) -> Option<Vec<u8>> {
        compute_hash_from_aunts(self.index, self.total, &self.leaf_hash, &self.aunts)
    }

    /// Checks that `leaf` is included under `root_hash`.
    pub fn verify(&self, root_hash: &[u8], leaf: &[u8]) -> Result<(), MerkleError> {
        self.validate_basic()?;
        if leaf_hash(leaf) != self.leaf_hash {
            return Err(MerkleError::LeafHashMismatch);
        }
        match self.compute_root_hash() {
            Some(computed) if computed == root_hash => Ok(()),
            _ => Err(MerkleError::RootMismatch),
        }
    }

    pub fn to_proto(&self) -> p2p_proto::crypto::Proof {
        p2p_proto::crypto::Proof {
            total: self.total,
            index: self.index,
            leaf_hash: self.leaf_hash.clone(),
            aunts: self.aunts.clone(),
        }
    }

    pub fn from_proto(proto: p2p_proto::crypto::Proof) -> Result<Self, MerkleError> {
        let proof = Self {
            total: proto.total,
            index: proto.index,
            leaf_hash: proto.leaf_hash,
            aunts: proto.aunts,
        };
        proof.validate_basic()?;
        Ok(proof)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn empty_tree_hashes_to_sha256_of_nothing() {
        assert_eq!(
            hex::encode(hash_from_byte_slices::<Vec<u8>>(&[])),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    #[case(100)]
    fn every_proof_verifies_against_the_root(#[case] n: usize) {
        let items: Vec<Vec<u8>> = (0..n).map(|i| format!("item {i}").into_bytes()).collect();
        let (root, proofs) = proofs_from_byte_slices(&items);
        assert_eq!(root, hash_from_byte_slices(&items));
        for (item, proof) in items.iter().zip(&proofs) {
            proof.verify(&root, item).unwrap();
        }
    }

    #[test]
    fn proof_for_wrong_leaf_fails() {
        let items = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let (root, proofs) = proofs_from_byte_slices(&items);
        assert_eq!(
            proofs[0].verify(&root, b"b"),
            Err(MerkleError::LeafHashMismatch)
        );

        let mut tampered = proofs[1].clone();
        tampered.aunts[0] = vec![0; HASH_SIZE];
        assert_eq!(tampered.verify(&root, b"b"), Err(MerkleError::RootMismatch));
    }
}
