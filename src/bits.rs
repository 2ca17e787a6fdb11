//! Bit vectors with constant-time rank and select queries.
//!
//! [`BitBuffer`] is a mutable builder; freezing it into a [`BitVector`]
//! computes a rank directory with one cumulative count per 512-bit block.
//! Ranks are half-open: `rank1(i)` counts set bits in `[0, i)`.

use serde::{Deserialize, Serialize};

//-----------------------------------------------------------------------------

const WORD_BITS: usize = 64;
const BLOCK_WORDS: usize = 8;
const BLOCK_BITS: usize = WORD_BITS * BLOCK_WORDS;

//-----------------------------------------------------------------------------

/// A mutable fixed-length bit buffer used for building a [`BitVector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitBuffer {
    len: usize,
    words: Vec<u64>,
}

impl BitBuffer {
    /// Creates a buffer of the given length with all bits unset.
    pub fn new(len: usize) -> Self {
        let words = vec![0; (len + WORD_BITS - 1) / WORD_BITS];
        BitBuffer { len, words }
    }

    /// Returns the length of the buffer in bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the bit at the given position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < self.len, "Bit index {} out of bounds for length {}", i, self.len);
        self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
    }

    /// Returns the bit at the given position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len, "Bit index {} out of bounds for length {}", i, self.len);
        (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1
    }
}

//-----------------------------------------------------------------------------

/// An immutable bit vector with a rank directory.
///
/// Supports `access` in O(1), `rank1` in O(1), and `select1` in
/// O(log n) via binary search over the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitVector {
    len: usize,
    ones: usize,
    words: Vec<u64>,
    // Cumulative number of set bits before each 512-bit block.
    blocks: Vec<u32>,
}

impl From<BitBuffer> for BitVector {
    fn from(buffer: BitBuffer) -> Self {
        assert!(buffer.len <= u32::MAX as usize, "Bit vector too long for the rank directory");
        let num_blocks = (buffer.words.len() + BLOCK_WORDS - 1) / BLOCK_WORDS;
        let mut blocks = Vec::with_capacity(num_blocks + 1);
        let mut ones: usize = 0;
        for block in 0..num_blocks {
            blocks.push(ones as u32);
            let start = block * BLOCK_WORDS;
            let end = (start + BLOCK_WORDS).min(buffer.words.len());
            for word in &buffer.words[start..end] {
                ones += word.count_ones() as usize;
            }
        }
        blocks.push(ones as u32);
        BitVector { len: buffer.len, ones, words: buffer.words, blocks }
    }
}

impl BitVector {
    /// Returns the length of the vector in bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the vector is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the total number of set bits.
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.ones
    }

    /// Returns the bit at the given position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len, "Bit index {} out of bounds for length {}", i, self.len);
        (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1
    }

    /// Returns the number of set bits in `[0, i)`.
    pub fn rank1(&self, i: usize) -> usize {
        assert!(i <= self.len, "Rank index {} out of bounds for length {}", i, self.len);
        let mut result = self.blocks[i / BLOCK_BITS] as usize;
        let start = (i / BLOCK_BITS) * BLOCK_WORDS;
        for word in &self.words[start..i / WORD_BITS] {
            result += word.count_ones() as usize;
        }
        let tail = i % WORD_BITS;
        if tail > 0 {
            let word = self.words[i / WORD_BITS];
            result += (word & ((1u64 << tail) - 1)).count_ones() as usize;
        }
        result
    }

    /// Returns the position of the set bit of the given rank, so that
    /// `rank1(select1(k).unwrap()) == k`.
    ///
    /// Returns [`None`] if there are not enough set bits.
    pub fn select1(&self, k: usize) -> Option<usize> {
        if k >= self.ones {
            return None;
        }
        // Last block with at most k preceding set bits.
        let mut low = 0;
        let mut high = self.blocks.len() - 1;
        while low + 1 < high {
            let mid = (low + high) / 2;
            if self.blocks[mid] as usize <= k {
                low = mid;
            } else {
                high = mid;
            }
        }
        let mut remaining = k - self.blocks[low] as usize;
        let start = low * BLOCK_WORDS;
        let end = (start + BLOCK_WORDS).min(self.words.len());
        for (offset, word) in self.words[start..end].iter().enumerate() {
            let ones = word.count_ones() as usize;
            if remaining < ones {
                let mut word = *word;
                for _ in 0..remaining {
                    word &= word - 1;
                }
                return Some((start + offset) * WORD_BITS + word.trailing_zeros() as usize);
            }
            remaining -= ones;
        }
        None
    }
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
