use std::fmt;

use bitvec::prelude::*;
use rand::seq::IteratorRandom;

/// A fixed size array of bits, as exchanged between peers to describe which
/// votes or block parts they have.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitArray {
    bits: BitVec<u64, Lsb0>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BitArrayError {
    #[error("negative bit array size {0}")]
    NegativeSize(i64),
    #[error("bit array of {bits} bits carries {elems} words, expected {expected}")]
    WordCountMismatch {
        bits: i64,
        elems: usize,
        expected: usize,
    },
}

impl BitArray {
    pub fn new(size: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.bits.len()
    }

    pub fn get_index(&self, index: usize) -> bool {
        self.bits.get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// Sets the bit at `index`. Returns `false` if the index is out of range.
    pub fn set_index(&mut self, index: usize, value: bool) -> bool {
        match self.bits.get_mut(index) {
            Some(mut bit) => {
                *bit = value;
                true
            }
            None => false,
        }
    }

    /// Bits set in either array, sized to the larger of the two.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let mut result = if self.size() >= other.size() {
            self.clone()
        } else {
            other.clone()
        };
        let smaller = if self.size() >= other.size() {
            other
        } else {
            self
        };
        for index in smaller.bits.iter_ones() {
            result.bits.set(index, true);
        }
        result
    }

    /// Bits set in both arrays, sized to the smaller of the two.
    pub fn and(&self, other: &BitArray) -> BitArray {
        let size = self.size().min(other.size());
        let mut result = BitArray::new(size);
        for index in 0..size {
            if self.bits[index] && other.bits[index] {
                result.bits.set(index, true);
            }
        }
        result
    }

    pub fn not(&self) -> BitArray {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        Self { bits: !bits }
    }

    /// Bits set in `self` but not in `other`. The result has the size of
    /// `self`; bits beyond the end of `other` are kept as they are.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut result = self.clone();
        for index in other.bits.iter_ones() {
            if index >= result.size() {
                break;
            }
            result.bits.set(index, false);
        }
        result
    }

    /// Overwrites the overlapping prefix of `self` with the bits of `other`.
    pub fn update(&mut self, other: &BitArray) {
        let size = self.size().min(other.size());
        for index in 0..size {
            let value = other.bits[index];
            self.bits.set(index, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn is_full(&self) -> bool {
        self.bits.all()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Picks the index of a random set bit.
    pub fn pick_random(&self) -> Option<usize> {
        self.bits.iter_ones().choose(&mut rand::thread_rng())
    }

    pub fn to_proto(&self) -> p2p_proto::libs::BitArray {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        p2p_proto::libs::BitArray {
            bits: self.size() as i64,
            elems: bits.as_raw_slice().to_vec(),
        }
    }

    pub fn from_proto(proto: &p2p_proto::libs::BitArray) -> Result<Self, BitArrayError> {
        if proto.bits < 0 {
            return Err(BitArrayError::NegativeSize(proto.bits));
        }
        let expected = (proto.bits as usize).div_ceil(64);
        if proto.elems.len() != expected {
            return Err(BitArrayError::WordCountMismatch {
                bits: proto.bits,
                elems: proto.elems.len(),
                expected,
            });
        }
        let mut bits = BitVec::<u64, Lsb0>::from_vec(proto.elems.clone());
        bits.truncate(proto.bits as usize);
        bits.set_uninitialized(false);
        Ok(Self { bits })
    }
}

impl fmt::Debug for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BA{{{}:", self.size())?;
        for bit in self.bits.iter() {
            f.write_str(if *bit { "x" } else { "_" })?;
        }
        f.write_str("}")
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_str(pattern: &str) -> BitArray {
        let mut bits = BitArray::new(pattern.len());
        for (index, c) in pattern.chars().enumerate() {
            bits.set_index(index, c == 'x');
        }
        bits
    }

    #[test]
    fn set_index_out_of_range_is_rejected() {
        let mut bits = BitArray::new(3);
        assert!(bits.set_index(2, true));
        assert!(!bits.set_index(3, true));
        assert_eq!(bits.count_ones(), 1);
    }

    #[test]
    fn sub_keeps_size_of_receiver() {
        let a = from_str("xxxx_");
        let b = from_str("x_x");
        let diff = a.sub(&b);
        assert_eq!(diff.size(), 5);
        assert_eq!(diff, from_str("_x_x_"));
    }

    #[test]
    fn or_and_not() {
        let a = from_str("x__x");
        let b = from_str("_x");
        assert_eq!(a.or(&b), from_str("xx_x"));
        assert_eq!(a.and(&b), from_str("__"));
        assert_eq!(a.not(), from_str("_xx_"));
    }

    #[test]
    fn pick_random_only_returns_set_bits() {
        let a = from_str("__x__");
        assert_eq!(a.pick_random(), Some(2));
        assert_eq!(BitArray::new(4).pick_random(), None);
    }

    #[test]
    fn proto_rejects_mismatched_word_count() {
        let proto = p2p_proto::libs::BitArray {
            bits: 65,
            elems: vec![0],
        };
        assert_eq!(
            BitArray::from_proto(&proto),
            Err(BitArrayError::WordCountMismatch {
                bits: 65,
                elems: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn proto_round_trip_clears_padding() {
        let proto = p2p_proto::libs::BitArray {
            bits: 3,
            elems: vec![u64::MAX],
        };
        let bits = BitArray::from_proto(&proto).unwrap();
        assert!(bits.is_full());
        assert_eq!(bits.to_proto().elems, vec![0b111]);
    }
}
