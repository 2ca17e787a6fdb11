//! The DNA alphabet and integer-coded aligned sequences.
//!
//! Symbol codes are shared by the FM-index and the likelihood engine:
//! `0` is reserved for the null terminator, `1..=4` are the alphabet
//! symbols `A`, `C`, `G`, `T` (upper-case canonicalized), and `5` is the
//! per-sequence separator. An aligned sequence is stored as a
//! [`DigitalSeq`], one signed byte per consensus column, with a negative
//! sentinel for gap columns.

use std::fmt;

use serde::{Deserialize, Serialize};

//-----------------------------------------------------------------------------

/// Name of the alphabet, stored in persisted indexes.
pub const ALPHABET_NAME: &str = "DNA";

/// Number of symbols in the alphabet.
pub const SIZE: usize = 4;

/// Code of the null terminator in the concatenated text.
pub const NULL: u8 = 0;

/// Code of the per-sequence separator in the concatenated text.
pub const SEPARATOR: u8 = SIZE as u8 + 1;

/// Total number of distinct codes in the concatenated text.
pub const SIGMA: usize = SIZE + 2;

/// The canonical gap character.
pub const GAP: u8 = b'-';

/// Gap sentinel in a [`DigitalSeq`].
pub const GAP_CODE: i8 = -1;

const DECODE: [u8; SIZE] = *b"ACGT";

const fn generate_encoding() -> [i8; 256] {
    let mut result = [-1; 256];
    result[b'a' as usize] = 0; result[b'A' as usize] = 0;
    result[b'c' as usize] = 1; result[b'C' as usize] = 1;
    result[b'g' as usize] = 2; result[b'G' as usize] = 2;
    result[b't' as usize] = 3; result[b'T' as usize] = 3;
    result
}

const ENCODE: [i8; 256] = generate_encoding();

/// Returns the 0-based code for an alphabet character, or [`None`] if the
/// character is not in the alphabet.
#[inline]
pub fn encode(ch: u8) -> Option<u8> {
    let code = ENCODE[ch as usize];
    if code < 0 { None } else { Some(code as u8) }
}

/// Returns the canonical character for a 0-based alphabet code.
///
/// # Panics
///
/// May panic if the code is not a valid alphabet code.
#[inline]
pub fn decode(code: u8) -> u8 {
    DECODE[code as usize]
}

/// Returns `true` if the character denotes a gap in an aligned sequence.
#[inline]
pub fn is_gap(ch: u8) -> bool {
    ch == b'-' || ch == b'.'
}

//-----------------------------------------------------------------------------

/// A compact integer-coded aligned sequence.
///
/// Every consensus column stores either a 0-based alphabet code or the
/// negative gap sentinel [`GAP_CODE`]. Two constructors implement the two
/// decoding policies of the engine: [`DigitalSeq::from_aligned`] fails on
/// residues outside the alphabet (index construction), while
/// [`DigitalSeq::from_aligned_lossy`] maps them to gaps (likelihood
/// evaluation of query reads).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSeq {
    name: String,
    data: Vec<i8>,
}

impl DigitalSeq {
    /// Creates an empty sequence with the given name.
    pub fn new(name: &str) -> Self {
        DigitalSeq { name: String::from(name), data: Vec::new() }
    }

    /// Creates a sequence from aligned characters, failing on any residue
    /// that is neither a gap nor an alphabet symbol.
    pub fn from_aligned(name: &str, aligned: &[u8]) -> Result<Self, String> {
        let mut data = Vec::with_capacity(aligned.len());
        for (j, &ch) in aligned.iter().enumerate() {
            if is_gap(ch) {
                data.push(GAP_CODE);
            } else if let Some(code) = encode(ch) {
                data.push(code as i8);
            } else {
                return Err(format!(
                    "Invalid residue {} at column {} of sequence {}",
                    char::from(ch), j + 1, name
                ));
            }
        }
        Ok(DigitalSeq { name: String::from(name), data })
    }

    /// Creates a sequence from aligned characters, mapping any residue
    /// outside the alphabet to a gap.
    pub fn from_aligned_lossy(name: &str, aligned: &[u8]) -> Self {
        let data = aligned.iter().map(|&ch| {
            match encode(ch) {
                Some(code) => code as i8,
                None => GAP_CODE,
            }
        }).collect();
        DigitalSeq { name: String::from(name), data }
    }

    /// Returns the name of the sequence.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the aligned length of the sequence.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the sequence has no columns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the code at the given column: `>= 0` for a residue,
    /// negative for a gap.
    #[inline]
    pub fn get(&self, j: usize) -> i8 {
        self.data[j]
    }

    /// Returns `true` if the given column is a gap.
    #[inline]
    pub fn is_gap_at(&self, j: usize) -> bool {
        self.data[j] < 0
    }

    /// Returns the number of non-gap columns.
    pub fn non_gap_len(&self) -> usize {
        self.data.iter().filter(|&&code| code >= 0).count()
    }

    /// Returns an iterator over the column codes.
    pub fn iter(&self) -> std::slice::Iter<'_, i8> {
        self.data.iter()
    }
}

impl fmt::Display for DigitalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &code in self.data.iter() {
            let ch = if code < 0 { GAP } else { decode(code as u8) };
            write!(f, "{}", char::from(ch))?;
        }
        Ok(())
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for code in 0..SIZE as u8 {
            assert_eq!(encode(decode(code)), Some(code), "Wrong round trip for code {}", code);
        }
        assert_eq!(encode(b'a'), Some(0), "Lower-case characters should encode");
        assert_eq!(encode(b'N'), None, "Ambiguous characters are not in the alphabet");
        assert_eq!(encode(b'-'), None, "The gap character is not in the alphabet");
    }

    #[test]
    fn gap_detection() {
        assert!(is_gap(b'-'));
        assert!(is_gap(b'.'));
        assert!(!is_gap(b'A'));
    }

    #[test]
    fn digital_seq_strict() {
        let seq = DigitalSeq::from_aligned("seq1", b"AC-gT").unwrap();
        assert_eq!(seq.len(), 5);
        assert_eq!(seq.non_gap_len(), 4);
        assert_eq!(seq.get(0), 0);
        assert_eq!(seq.get(2), GAP_CODE);
        assert!(seq.is_gap_at(2));
        assert_eq!(seq.get(3), 2, "Lower-case g should canonicalize");
        assert_eq!(seq.to_string(), "AC-GT");
    }

    #[test]
    fn digital_seq_rejects_unknown_residues() {
        let result = DigitalSeq::from_aligned("bad", b"ACNT");
        assert!(result.is_err(), "Strict decoding should fail on N");
    }

    #[test]
    fn digital_seq_lossy_maps_to_gap() {
        let seq = DigitalSeq::from_aligned_lossy("read", b"ACNT");
        assert_eq!(seq.get(2), GAP_CODE, "Lossy decoding should map N to a gap");
        assert_eq!(seq.non_gap_len(), 3);
    }
}

//-----------------------------------------------------------------------------
