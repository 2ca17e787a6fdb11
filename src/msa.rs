//! An in-memory multiple sequence alignment.
//!
//! The MSA loader itself is an external collaborator; this module holds
//! the validated value it produces: `N` aligned rows of equal consensus
//! length over the DNA alphabet plus gaps, with a consensus string and a
//! per-column identity score. Both the FM-index builder and the
//! phylogenetic tree consume this interface.

use crate::alphabet::{self, DigitalSeq};

//-----------------------------------------------------------------------------

/// The longest consensus length the consensus-space index can handle.
pub const MAX_CS_LEN: usize = u16::MAX as usize;

/// A validated multiple sequence alignment over the DNA alphabet.
///
/// Rows are validated at construction: every residue is either a gap or
/// an alphabet symbol, and all rows have the same length. Residues
/// outside the alphabet are a hard error here; tolerant decoding is
/// reserved for query reads.
#[derive(Clone, Debug, PartialEq)]
pub struct Msa {
    name: String,
    names: Vec<String>,
    rows: Vec<Vec<u8>>,
    digital: Vec<DigitalSeq>,
    cs_len: usize,
    cs_seq: String,
    identity: Vec<f64>,
    non_gap: usize,
}

impl Msa {
    /// Creates an alignment from named aligned rows.
    ///
    /// Returns an error if the alignment is empty, the rows have unequal
    /// lengths, the consensus length exceeds [`MAX_CS_LEN`], or a row
    /// contains a residue outside the alphabet.
    pub fn new(name: &str, rows: &[(&str, &str)]) -> Result<Self, String> {
        if rows.is_empty() {
            return Err(format!("Empty alignment {}", name));
        }
        let cs_len = rows[0].1.len();
        if cs_len == 0 {
            return Err(format!("Alignment {} has zero columns", name));
        }
        if cs_len > MAX_CS_LEN {
            return Err(format!(
                "Alignment {} has consensus length {} exceeding the maximum of {}",
                name, cs_len, MAX_CS_LEN
            ));
        }

        let mut names = Vec::with_capacity(rows.len());
        let mut aligned = Vec::with_capacity(rows.len());
        let mut digital = Vec::with_capacity(rows.len());
        let mut non_gap = 0;
        for (seq_name, seq) in rows.iter() {
            if seq.len() != cs_len {
                return Err(format!(
                    "Sequence {} has length {} but the alignment has {} columns",
                    seq_name, seq.len(), cs_len
                ));
            }
            let ds = DigitalSeq::from_aligned(seq_name, seq.as_bytes())?;
            non_gap += ds.non_gap_len();
            names.push(String::from(*seq_name));
            aligned.push(seq.as_bytes().to_vec());
            digital.push(ds);
        }

        let (cs_seq, identity) = consensus(&aligned, cs_len);
        Ok(Msa {
            name: String::from(name),
            names,
            rows: aligned,
            digital,
            cs_len,
            cs_seq,
            identity,
            non_gap,
        })
    }

    /// Returns the name of the alignment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of sequences.
    #[inline]
    pub fn num_seq(&self) -> usize {
        self.rows.len()
    }

    /// Returns the consensus length (number of columns).
    #[inline]
    pub fn cs_len(&self) -> usize {
        self.cs_len
    }

    /// Returns the consensus string.
    pub fn cs(&self) -> &str {
        &self.cs_seq
    }

    /// Returns the identity score of the given column, in `[0, 1]`.
    #[inline]
    pub fn identity_at(&self, j: usize) -> f64 {
        self.identity[j]
    }

    /// Returns the aligned residue of sequence `i` at column `j`.
    #[inline]
    pub fn residue_at(&self, i: usize, j: usize) -> u8 {
        self.rows[i][j]
    }

    /// Returns the integer-coded aligned sequence for row `i`.
    pub fn ds_at(&self, i: usize) -> &DigitalSeq {
        &self.digital[i]
    }

    /// Returns the name of sequence `i`.
    pub fn seq_name_at(&self, i: usize) -> &str {
        &self.names[i]
    }

    /// Returns the total number of non-gap residues in the alignment.
    #[inline]
    pub fn non_gap_len(&self) -> usize {
        self.non_gap
    }
}

// Majority consensus over the observed characters of each column; ties
// prefer alphabet symbols in code order over the gap. Identity is the
// fraction of rows that carry the consensus character.
fn consensus(rows: &[Vec<u8>], cs_len: usize) -> (String, Vec<f64>) {
    let mut cs_seq = String::with_capacity(cs_len);
    let mut identity = Vec::with_capacity(cs_len);
    for j in 0..cs_len {
        let mut counts = [0usize; alphabet::SIZE + 1];
        for row in rows.iter() {
            match alphabet::encode(row[j]) {
                Some(code) => counts[code as usize] += 1,
                None => counts[alphabet::SIZE] += 1,
            }
        }
        let mut best = 0;
        for k in 1..counts.len() {
            if counts[k] > counts[best] {
                best = k;
            }
        }
        let ch = if best < alphabet::SIZE {
            alphabet::decode(best as u8)
        } else {
            alphabet::GAP
        };
        cs_seq.push(char::from(ch));
        identity.push(counts[best] as f64 / rows.len() as f64);
    }
    (cs_seq, identity)
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
