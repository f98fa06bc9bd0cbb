use std::sync::Arc;

use crate::bits::BitArray;
use crate::block::PartSetHeader;
use crate::merkle::{self, MerkleError, Proof};

pub const BLOCK_PART_SIZE_BYTES: u32 = 65_536;
pub const MAX_BLOCK_SIZE_BYTES: i64 = 104_857_600;
/// Upper bound on `PartSetHeader::total` accepted from anyone.
pub const MAX_BLOCK_PARTS_COUNT: u32 = (MAX_BLOCK_SIZE_BYTES / BLOCK_PART_SIZE_BYTES as i64) as u32 + 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of range for a set of {total} parts")]
    UnexpectedIndex { index: u32, total: u32 },
    #[error("part has {0} bytes, more than the maximum part size")]
    TooBig(usize),
    #[error("part proof index {proof} does not match part index {part}")]
    ProofIndexMismatch { part: u32, proof: i64 },
    #[error("invalid part proof: {0}")]
    InvalidProof(#[from] MerkleError),
    #[error("missing part proof")]
    MissingProof,
}

/// One slice of a serialized block together with its inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: Proof,
}

impl Part {
    pub fn validate_basic(&self) -> Result<(), PartSetError> {
        if self.bytes.len() > BLOCK_PART_SIZE_BYTES as usize {
            return Err(PartSetError::TooBig(self.bytes.len()));
        }
        if self.proof.index != self.index as i64 {
            return Err(PartSetError::ProofIndexMismatch {
                part: self.index,
                proof: self.proof.index,
            });
        }
        self.proof.validate_basic()?;
        Ok(())
    }

    pub fn to_proto(&self) -> p2p_proto::types::Part {
        p2p_proto::types::Part {
            index: self.index,
            bytes: self.bytes.clone(),
            proof: Some(self.proof.to_proto()),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Part) -> Result<Self, PartSetError> {
        let proof = proto.proof.ok_or(PartSetError::MissingProof)?;
        Ok(Self {
            index: proto.index,
            bytes: proto.bytes,
            proof: Proof::from_proto(proof)?,
        })
    }
}

/// A block split into parts. Either built from the full block data by the
/// proposer, or from a header by everyone else and then filled part by part.
///
/// Parts are shared behind `Arc` so that cloning a part set (as round state
/// snapshots do) does not copy block data.
#[derive(Clone, Debug)]
pub struct PartSet {
    total: u32,
    hash: Vec<u8>,
    parts: Vec<Option<Arc<Part>>>,
    parts_bit_array: BitArray,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    pub fn from_data(data: &[u8], part_size: u32) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size as usize).collect()
        };
        let (root, proofs) = merkle::proofs_from_byte_slices(&chunks);
        let total = chunks.len() as u32;
        let mut parts_bit_array = BitArray::new(total as usize);
        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                parts_bit_array.set_index(index, true);
                Some(Arc::new(Part {
                    index: index as u32,
                    bytes: bytes.to_vec(),
                    proof,
                }))
            })
            .collect();
        Self {
            total,
            hash: root,
            parts,
            parts_bit_array,
            count: total,
            byte_size: data.len(),
        }
    }

    /// An empty part set expecting the parts described by `header`. Callers
    /// bound `header.total` before calling this.
    pub fn from_header(header: &PartSetHeader) -> Self {
        Self {
            total: header.total,
            hash: header.hash.clone(),
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total,
            hash: self.hash.clone(),
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.total == header.total && self.hash == header.hash
    }

    pub fn bit_array(&self) -> BitArray {
        self.parts_bit_array.clone()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    /// Adds a part after checking its proof against the set's root. Returns
    /// `Ok(false)` if the part was already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.total {
            return Err(PartSetError::UnexpectedIndex {
                index: part.index,
                total: self.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        part.proof.verify(&self.hash, &part.bytes)?;

        let index = part.index as usize;
        self.byte_size += part.bytes.len();
        self.parts[index] = Some(Arc::new(part));
        self.parts_bit_array.set_index(index, true);
        self.count += 1;
        Ok(true)
    }

    pub fn get_part(&self, index: usize) -> Option<Arc<Part>> {
        self.parts.get(index).cloned().flatten()
    }

    /// The reassembled data, once every part has arrived.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut data = Vec::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            data.extend_from_slice(&part.bytes);
        }
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn max_parts_count_covers_max_block_size() {
        assert_eq!(MAX_BLOCK_PARTS_COUNT, 1601);
    }

    #[test]
    fn parts_reassemble_into_original_data() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let original = PartSet::from_data(&data, 1024);
        assert_eq!(original.total(), 10);

        let mut copy = PartSet::from_header(&original.header());
        assert!(!copy.is_complete());
        for index in (0..original.total() as usize).rev() {
            let part = original.get_part(index).unwrap();
            assert!(copy.add_part((*part).clone()).unwrap());
        }
        assert!(copy.is_complete());
        assert_eq!(copy.assemble().unwrap(), data);
    }

    #[test]
    fn duplicate_part_is_not_added_twice() {
        let original = PartSet::from_data(b"hello world", 4);
        let mut copy = PartSet::from_header(&original.header());
        let part = (*original.get_part(1).unwrap()).clone();
        assert!(copy.add_part(part.clone()).unwrap());
        assert!(!copy.add_part(part).unwrap());
        assert_eq!(copy.count(), 1);
    }

    #[test]
    fn part_from_other_set_is_rejected() {
        let a = PartSet::from_data(b"aaaaaaaa", 4);
        let b = PartSet::from_data(b"bbbbbbbb", 4);
        let mut copy = PartSet::from_header(&a.header());
        let foreign = (*b.get_part(0).unwrap()).clone();
        assert_matches!(copy.add_part(foreign), Err(PartSetError::InvalidProof(_)));

        let mut out_of_range = (*a.get_part(0).unwrap()).clone();
        out_of_range.index = 2;
        assert_matches!(
            copy.add_part(out_of_range),
            Err(PartSetError::UnexpectedIndex { index: 2, total: 2 })
        );
    }
}
