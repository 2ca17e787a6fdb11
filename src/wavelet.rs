//! A wavelet tree over a small byte alphabet.
//!
//! The tree is stored in level order (one bit plane per level, most
//! significant bit first), with each plane backed by a rank-enabled
//! [`BitVector`]. Symbols are routed to the next level by a stable
//! partition: zeros first, then ones. This gives `rank(c, i)` and
//! `access(i)` in O(log sigma) bit-vector operations.

use crate::bits::{BitBuffer, BitVector};

use serde::{Deserialize, Serialize};

//-----------------------------------------------------------------------------

/// An immutable multi-symbol string supporting partial rank queries.
///
/// Ranks are half-open: `rank(c, i)` counts occurrences of `c` in
/// `[0, i)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveletTree {
    len: usize,
    bits: usize,
    levels: Vec<BitVector>,
    // Number of zero bits in each level.
    zeros: Vec<usize>,
}

impl WaveletTree {
    /// Builds a wavelet tree over the given symbols.
    ///
    /// `sigma` is the size of the alphabet; every symbol must be below it.
    pub fn new(data: &[u8], sigma: usize) -> Self {
        assert!(sigma >= 1 && sigma <= 256, "Invalid alphabet size {}", sigma);
        let mut bits = 1;
        while (1usize << bits) < sigma {
            bits += 1;
        }

        let len = data.len();
        let mut levels = Vec::with_capacity(bits);
        let mut zeros = Vec::with_capacity(bits);
        let mut current: Vec<u8> = data.to_vec();
        let mut next: Vec<u8> = Vec::with_capacity(len);
        for level in 0..bits {
            let shift = bits - 1 - level;
            let mut buffer = BitBuffer::new(len);
            for (i, &symbol) in current.iter().enumerate() {
                debug_assert!((symbol as usize) < sigma, "Symbol {} out of range", symbol);
                if (symbol >> shift) & 1 == 1 {
                    buffer.set(i);
                }
            }
            let plane = BitVector::from(buffer);
            zeros.push(len - plane.count_ones());

            // Stable partition for the next level.
            next.clear();
            next.extend(current.iter().filter(|&&symbol| (symbol >> shift) & 1 == 0));
            next.extend(current.iter().filter(|&&symbol| (symbol >> shift) & 1 == 1));
            std::mem::swap(&mut current, &mut next);

            levels.push(plane);
        }

        WaveletTree { len, bits, levels, zeros }
    }

    /// Returns the length of the underlying string.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the underlying string is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the symbol at the given position.
    pub fn access(&self, mut i: usize) -> u8 {
        assert!(i < self.len, "Index {} out of bounds for length {}", i, self.len);
        let mut symbol = 0u8;
        for (plane, &z) in self.levels.iter().zip(self.zeros.iter()) {
            symbol <<= 1;
            if plane.get(i) {
                symbol |= 1;
                i = z + plane.rank1(i);
            } else {
                i -= plane.rank1(i);
            }
        }
        symbol
    }

    /// Returns the number of occurrences of `symbol` in `[0, i)`.
    pub fn rank(&self, symbol: u8, i: usize) -> usize {
        assert!(i <= self.len, "Rank index {} out of bounds for length {}", i, self.len);
        assert!((symbol as usize) < (1 << self.bits), "Symbol {} out of range", symbol);
        let mut start = 0;
        let mut end = i;
        for (level, (plane, &z)) in self.levels.iter().zip(self.zeros.iter()).enumerate() {
            let shift = self.bits - 1 - level;
            if (symbol >> shift) & 1 == 1 {
                start = z + plane.rank1(start);
                end = z + plane.rank1(end);
            } else {
                start -= plane.rank1(start);
                end -= plane.rank1(end);
            }
        }
        end - start
    }
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
