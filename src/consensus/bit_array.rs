use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const WORD_BITS: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitArrayError {
    #[error("Word count {words} does not match bit length {bits}")]
    LengthMismatch { bits: usize, words: usize },
}

/// Fixed-length bit vector over validator indices, packed into u32 words.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBitArray", into = "RawBitArray")]
pub struct BitArray {
    bits: usize,
    elems: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct RawBitArray {
    bits: u32,
    elems: Vec<u32>,
}

impl TryFrom<RawBitArray> for BitArray {
    type Error = BitArrayError;

    fn try_from(raw: RawBitArray) -> Result<Self, Self::Error> {
        BitArray::from_words(raw.bits as usize, raw.elems)
    }
}

impl From<BitArray> for RawBitArray {
    fn from(array: BitArray) -> Self {
        RawBitArray {
            bits: array.bits as u32,
            elems: array.elems,
        }
    }
}

fn word_count(bits: usize) -> usize {
    (bits + WORD_BITS - 1) / WORD_BITS
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            elems: vec![0; word_count(bits)],
        }
    }

    pub fn from_words(bits: usize, mut elems: Vec<u32>) -> Result<Self, BitArrayError> {
        if elems.len() != word_count(bits) {
            return Err(BitArrayError::LengthMismatch {
                bits,
                words: elems.len(),
            });
        }
        // bits past the end are never observable
        let tail = bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = elems.last_mut() {
                *last &= (1u32 << tail) - 1;
            }
        }
        Ok(Self { bits, elems })
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.elems.iter().all(|word| *word == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.bits
    }

    pub fn words(&self) -> &[u32] {
        &self.elems
    }

    pub fn get_index(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.elems[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Returns false when `index` is out of range.
    pub fn set_index(&mut self, index: usize, value: bool) -> bool {
        if index >= self.bits {
            return false;
        }
        let mask = 1 << (index % WORD_BITS);
        if value {
            self.elems[index / WORD_BITS] |= mask;
        } else {
            self.elems[index / WORD_BITS] &= !mask;
        }
        true
    }

    pub fn count(&self) -> usize {
        self.elems.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Copy of `self` with every bit set in `other` cleared.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut result = self.clone();
        for (word, other_word) in result.elems.iter_mut().zip(other.elems.iter()) {
            *word &= !other_word;
        }
        result.mask_tail();
        result
    }

    /// Union, sized to the longer of the two.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let (mut result, shorter) = if self.bits >= other.bits {
            (self.clone(), other)
        } else {
            (other.clone(), self)
        };
        for (word, other_word) in result.elems.iter_mut().zip(shorter.elems.iter()) {
            *word |= other_word;
        }
        result
    }

    /// Overwrites `self` with `other` over the overlapping prefix.
    pub fn update(&mut self, other: &BitArray) {
        let overlap = word_count(self.bits.min(other.bits));
        self.elems[..overlap].copy_from_slice(&other.elems[..overlap]);
        self.mask_tail();
    }

    pub fn true_indices(&self) -> Vec<usize> {
        (0..self.bits).filter(|i| self.get_index(*i)).collect()
    }

    pub fn pick_random(&self) -> Option<usize> {
        self.true_indices().choose(&mut rand::thread_rng()).copied()
    }

    fn mask_tail(&mut self) {
        let tail = self.bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.elems.last_mut() {
                *last &= (1u32 << tail) - 1;
            }
        }
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            f.write_str(if self.get_index(i) { "x" } else { "_" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BA{{{}:{}}}", self.bits, self)
    }
}
