//! The consensus-space FM-index.
//!
//! The index is a compressed full-text structure over the concatenation
//! of the ungapped reference sequences of an MSA, with an auxiliary
//! mapping from concatenated positions back to consensus columns.
//! Searches therefore report matches in alignment coordinates, and the
//! matched substring can be reconstructed in aligned form with gap
//! characters restored.
//!
//! The backbone is a textbook FM-index: a C-table of cumulative symbol
//! counts, the BWT of the concatenated text stored in a [`WaveletTree`],
//! and a sparse suffix-array sample addressed through a rank-enabled
//! [`BitVector`]. The pattern is scanned right to left and the suffix
//! interval is contracted with the LF-mapping.
//!
//! Once built, the index is immutable; concurrent read-only searches are
//! safe.

use crate::alphabet;
use crate::bits::{BitBuffer, BitVector};
use crate::msa::Msa;
use crate::suffix;
use crate::utils;
use crate::wavelet::WaveletTree;

use rand::Rng;
use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

#[cfg(test)]
mod tests;

//-----------------------------------------------------------------------------

/// Sampling rate of suffix-array entries. Must be a power of two; every
/// LF-chain reaches a sampled entry in at most this many steps.
pub const SA_SAMPLE_RATE: u32 = 32;

// "PPLCSFM" + format byte.
const MAGIC: u64 = 0x5050_4C43_5346_4D01;
const FORMAT_VERSION: u32 = 1;

//-----------------------------------------------------------------------------

/// A located occurrence of a pattern, in consensus coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsLoc {
    /// 1-based consensus column of the first matched residue.
    pub cs_start: usize,
    /// 1-based consensus column of the last matched residue.
    pub cs_end: usize,
    /// The matched pattern in aligned form, with gap characters inserted
    /// wherever consecutive residues span more than one consensus column.
    pub match_cs: String,
}

//-----------------------------------------------------------------------------

/// A consensus-space FM-index over the reference sequences of an MSA.
///
/// # Examples
///
/// ```
/// use phyloplace::csfm::CsfmIndex;
/// use phyloplace::msa::Msa;
///
/// let msa = Msa::new("toy", &[("s1", "ACGT-"), ("s2", "ACGTA")]).unwrap();
/// let index = CsfmIndex::build(&msa, false).unwrap();
/// assert_eq!(index.count("ACGT"), 2);
/// let hits = index.locate("CGTA");
/// assert_eq!(hits.len(), 1);
/// assert_eq!((hits[0].cs_start, hits[0].cs_end), (2, 5));
/// assert_eq!(hits[0].match_cs, "CGTA");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CsfmIndex {
    alphabet_name: String,
    gap_ch: u8,
    cs_len: usize,
    concat_len: usize,
    // Cumulative symbol counts: c_table[c] is the number of symbols
    // smaller than c in the concatenated text.
    c_table: Vec<u32>,
    // Consensus string, 1-based with a leading space.
    cs_seq: String,
    // Per-column identity, 1-based with a dummy value at 0.
    cs_identity: Vec<f64>,
    // Concatenated position to 1-based consensus column; 0 at separators.
    concat2cs: Vec<u16>,
    // Start offset of each sequence in the concatenated text.
    seq_starts: Vec<u32>,
    // SA values at sampled suffix-array positions.
    sa_sampled: Vec<u32>,
    // BWT of the concatenated text.
    bwt: WaveletTree,
    // Marks suffix-array positions with a sampled value.
    sa_idx: BitVector,
}

//-----------------------------------------------------------------------------

/// Index construction.
impl CsfmIndex {
    /// Builds the index for the given alignment.
    ///
    /// This walks the rows in MSA order, concatenating the ungapped
    /// residues with one separator after each sequence, builds the suffix
    /// array with a linear-time algorithm, samples it, and derives the
    /// BWT. Build-time failures are fatal.
    pub fn build(msa: &Msa, verbose: bool) -> Result<Self, String> {
        let cs_len = msa.cs_len();
        let concat_len = msa.non_gap_len() + msa.num_seq();
        let n = concat_len + 1;

        // Concatenated text, consensus mapping, and symbol counts.
        let mut text = vec![0u8; n];
        let mut concat2cs = vec![0u16; n];
        let mut counts = vec![0u32; alphabet::SIGMA];
        let mut seq_starts = Vec::with_capacity(msa.num_seq());
        let mut shift = 0;
        for i in 0..msa.num_seq() {
            seq_starts.push(shift as u32);
            for j in 0..cs_len {
                let ch = msa.residue_at(i, j);
                if alphabet::is_gap(ch) {
                    continue;
                }
                let code = alphabet::encode(ch).ok_or_else(|| format!(
                    "Invalid residue {} in sequence {} at column {}",
                    char::from(ch), msa.seq_name_at(i), j + 1
                ))? + 1;
                counts[code as usize] += 1;
                text[shift] = code;
                concat2cs[shift] = (j + 1) as u16;
                shift += 1;
            }
            counts[alphabet::SEPARATOR as usize] += 1;
            text[shift] = alphabet::SEPARATOR;
            concat2cs[shift] = 0;
            shift += 1;
        }
        debug_assert_eq!(shift, n - 1);
        counts[alphabet::NULL as usize] += 1;

        let mut c_table = vec![0u32; alphabet::SIGMA + 1];
        for c in 0..alphabet::SIGMA {
            c_table[c + 1] = c_table[c] + counts[c];
        }

        if verbose {
            eprintln!(
                "Concatenated {} residues from {} sequences",
                concat_len - msa.num_seq(), msa.num_seq()
            );
        }

        // Suffix array, SA sample, and BWT.
        let sa = suffix::suffix_array(&text).map_err(|err| {
            format!("Cannot build the suffix array of the concatenated text: {}", err)
        })?;
        let mut sa_sampled = Vec::with_capacity(n / SA_SAMPLE_RATE as usize + 1);
        let mut mask = BitBuffer::new(n);
        for (i, &value) in sa.iter().enumerate() {
            if value % SA_SAMPLE_RATE == 0 {
                sa_sampled.push(value);
                mask.set(i);
            }
        }
        let sa_idx = BitVector::from(mask);
        let bwt_text = suffix::bwt_from_sa(&text, &sa);
        let bwt = WaveletTree::new(&bwt_text, alphabet::SIGMA);

        let mut cs_seq = String::with_capacity(cs_len + 1);
        cs_seq.push(' ');
        cs_seq.push_str(msa.cs());
        let mut cs_identity = Vec::with_capacity(cs_len + 1);
        cs_identity.push(0.0);
        for j in 0..cs_len {
            cs_identity.push(msa.identity_at(j));
        }

        let index = CsfmIndex {
            alphabet_name: String::from(alphabet::ALPHABET_NAME),
            gap_ch: alphabet::GAP,
            cs_len,
            concat_len,
            c_table,
            cs_seq,
            cs_identity,
            concat2cs,
            seq_starts,
            sa_sampled,
            bwt,
            sa_idx,
        };
        if verbose {
            eprintln!(
                "Built CSFM index with {} sampled SA entries ({})",
                index.sa_sampled.len(),
                utils::human_readable_size(index.footprint())
            );
        }
        Ok(index)
    }

    // Rough in-memory footprint in bytes, for progress reporting.
    fn footprint(&self) -> usize {
        let n = self.concat_len + 1;
        2 * n + 4 * self.sa_sampled.len() + n / 2 + 4 * self.c_table.len()
            + self.cs_seq.len() + 8 * self.cs_identity.len() + 4 * self.seq_starts.len()
    }
}

//-----------------------------------------------------------------------------

/// Statistics.
impl CsfmIndex {
    /// Returns the consensus length of the underlying alignment.
    #[inline]
    pub fn cs_len(&self) -> usize {
        self.cs_len
    }

    /// Returns the length of the concatenated text, excluding the null
    /// terminator.
    #[inline]
    pub fn concat_len(&self) -> usize {
        self.concat_len
    }

    /// Returns the number of indexed sequences.
    #[inline]
    pub fn num_seq(&self) -> usize {
        self.seq_starts.len()
    }

    /// Returns the consensus string (1-based; the character at offset 0
    /// is a placeholder space).
    pub fn cs(&self) -> &str {
        &self.cs_seq
    }

    /// Returns the identity score of the given 1-based consensus column.
    #[inline]
    pub fn identity_at(&self, j: usize) -> f64 {
        self.cs_identity[j]
    }

    /// Returns the gap character used when reconstructing aligned matches.
    #[inline]
    pub fn gap_ch(&self) -> u8 {
        self.gap_ch
    }
}

//-----------------------------------------------------------------------------

/// Queries.
impl CsfmIndex {
    /// Returns the number of occurrences of the pattern.
    ///
    /// An empty pattern or a pattern with characters outside the alphabet
    /// matches nothing.
    pub fn count(&self, pattern: &str) -> usize {
        let (sp, ep) = self.backward_search(pattern.as_bytes());
        ep - sp
    }

    /// Returns all occurrences of the pattern in consensus coordinates.
    pub fn locate(&self, pattern: &str) -> Vec<CsLoc> {
        let (sp, ep) = self.backward_search(pattern.as_bytes());
        (sp..ep).map(|i| self.cs_loc(self.access_sa(i), pattern)).collect()
    }

    /// Returns the occurrence at the first suffix-array position of the
    /// match interval. Deterministic.
    pub fn locate_first(&self, pattern: &str) -> Option<CsLoc> {
        let (sp, ep) = self.backward_search(pattern.as_bytes());
        if sp < ep {
            Some(self.cs_loc(self.access_sa(sp), pattern))
        } else {
            None
        }
    }

    /// Returns a uniformly random occurrence from the match interval,
    /// using the caller-supplied generator.
    pub fn locate_one<R: Rng>(&self, pattern: &str, rng: &mut R) -> Option<CsLoc> {
        let (sp, ep) = self.backward_search(pattern.as_bytes());
        if sp < ep {
            let i = rng.gen_range(sp..ep);
            Some(self.cs_loc(self.access_sa(i), pattern))
        } else {
            None
        }
    }

    /// Returns the set of sequence indexes with at least one occurrence
    /// of the pattern.
    pub fn locate_index(&self, pattern: &str) -> BTreeSet<usize> {
        let (sp, ep) = self.backward_search(pattern.as_bytes());
        let mut result = BTreeSet::new();
        for i in sp..ep {
            let concat_start = self.access_sa(i);
            result.insert(self.seq_index(concat_start));
        }
        result
    }

    // Returns the half-open suffix-array interval matching the pattern.
    // The pattern is scanned right to left; each character contracts the
    // interval through the LF-mapping.
    fn backward_search(&self, pattern: &[u8]) -> (usize, usize) {
        let last = match pattern.last().copied().and_then(Self::pattern_code) {
            Some(code) => code,
            None => return (0, 0),
        };
        let mut sp = self.c_table[last as usize] as usize;
        let mut ep = self.c_table[last as usize + 1] as usize;
        for &ch in pattern[..pattern.len() - 1].iter().rev() {
            if sp >= ep {
                return (0, 0);
            }
            let code = match Self::pattern_code(ch) {
                Some(code) => code,
                None => return (0, 0),
            };
            sp = self.c_table[code as usize] as usize + self.bwt.rank(code, sp);
            ep = self.c_table[code as usize] as usize + self.bwt.rank(code, ep);
        }
        if sp < ep { (sp, ep) } else { (0, 0) }
    }

    // Maps a pattern character to its code in the concatenated text.
    #[inline]
    fn pattern_code(ch: u8) -> Option<u8> {
        alphabet::encode(ch).map(|code| code + 1)
    }

    /// Resolves a suffix-array entry from the sparse sample by stepping
    /// backward with the LF-mapping until a sampled position is reached.
    /// Terminates in at most [`SA_SAMPLE_RATE`] steps.
    pub fn access_sa(&self, mut i: usize) -> usize {
        let mut dist = 0;
        while !self.sa_idx.get(i) {
            let c = self.bwt.access(i);
            i = self.c_table[c as usize] as usize + self.bwt.rank(c, i);
            dist += 1;
        }
        self.sa_sampled[self.sa_idx.rank1(i)] as usize + dist
    }

    // Builds the located occurrence for a match starting at the given
    // concatenated position.
    fn cs_loc(&self, concat_start: usize, pattern: &str) -> CsLoc {
        let m = pattern.len();
        let cs_start = self.concat2cs[concat_start] as usize;
        let cs_end = self.concat2cs[concat_start + m - 1] as usize;
        CsLoc { cs_start, cs_end, match_cs: self.extract_cs(concat_start, pattern) }
    }

    // Reconstructs the aligned form of a matched pattern by inserting the
    // gap character wherever consecutive residues skip consensus columns.
    fn extract_cs(&self, concat_start: usize, pattern: &str) -> String {
        let mut result = String::with_capacity(pattern.len());
        for (k, ch) in pattern.bytes().enumerate() {
            let pos = concat_start + k;
            debug_assert!(self.concat2cs[pos] > 0, "Match spans a separator");
            if k > 0 {
                let delta = (self.concat2cs[pos] - self.concat2cs[pos - 1]) as usize;
                for _ in 1..delta {
                    result.push(char::from(self.gap_ch));
                }
            }
            result.push(char::from(ch));
        }
        result
    }

    // Returns the index of the sequence containing the given concatenated
    // position.
    fn seq_index(&self, concat_pos: usize) -> usize {
        self.seq_starts.partition_point(|&start| start as usize <= concat_pos) - 1
    }
}

//-----------------------------------------------------------------------------

/// Persistence.
impl CsfmIndex {
    /// Serializes the index into the writer as a versioned binary blob.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<(), String> {
        writer.write_all(&MAGIC.to_le_bytes()).map_err(|err| {
            format!("Failed to write the index header: {}", err)
        })?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes()).map_err(|err| {
            format!("Failed to write the index header: {}", err)
        })?;
        bincode::serialize_into(writer, self).map_err(|err| {
            format!("Failed to serialize the index: {}", err)
        })
    }

    /// Loads an index from the reader, checking the header first.
    ///
    /// Fails if the magic number is wrong or the blob was written by a
    /// newer version of the format.
    pub fn load_from<R: Read>(reader: &mut R) -> Result<Self, String> {
        let mut magic = [0u8; 8];
        let mut version = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|err| {
            format!("Failed to read the index header: {}", err)
        })?;
        if u64::from_le_bytes(magic) != MAGIC {
            return Err(String::from("Not a CSFM index file"));
        }
        reader.read_exact(&mut version).map_err(|err| {
            format!("Failed to read the index header: {}", err)
        })?;
        let version = u32::from_le_bytes(version);
        if version > FORMAT_VERSION {
            return Err(format!(
                "The index was written by a newer version of the format ({} > {})",
                version, FORMAT_VERSION
            ));
        }
        let index: CsfmIndex = bincode::deserialize_from(reader).map_err(|err| {
            format!("Failed to deserialize the index: {}", err)
        })?;
        if index.alphabet_name != alphabet::ALPHABET_NAME {
            return Err(format!("Unsupported alphabet {}", index.alphabet_name));
        }
        Ok(index)
    }

    /// Saves the index to the given file.
    pub fn save<P: AsRef<Path>>(&self, filename: P) -> Result<(), String> {
        let file = File::create(&filename).map_err(|err| {
            format!("Failed to create {}: {}", filename.as_ref().display(), err)
        })?;
        let mut writer = BufWriter::new(file);
        self.save_to(&mut writer)
    }

    /// Loads an index from the given file.
    pub fn load<P: AsRef<Path>>(filename: P) -> Result<Self, String> {
        let file = File::open(&filename).map_err(|err| {
            format!("Failed to open {}: {}", filename.as_ref().display(), err)
        })?;
        let mut reader = BufReader::new(file);
        Self::load_from(&mut reader)
    }
}

//-----------------------------------------------------------------------------
