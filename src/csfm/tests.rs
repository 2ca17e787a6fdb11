use super::*;

use crate::suffix;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

//-----------------------------------------------------------------------------

fn build_index(rows: &[(&str, &str)]) -> CsfmIndex {
    let msa = Msa::new("test", rows).unwrap();
    let index = CsfmIndex::build(&msa, false);
    assert!(index.is_ok(), "Failed to build the index: {}", index.unwrap_err());
    index.unwrap()
}

// Rebuilds the concatenated text the same way the index builder does.
fn concat_text(rows: &[(&str, &str)]) -> Vec<u8> {
    let mut text = Vec::new();
    for (_, seq) in rows.iter() {
        for &ch in seq.as_bytes() {
            if !alphabet::is_gap(ch) {
                text.push(alphabet::encode(ch).unwrap() + 1);
            }
        }
        text.push(alphabet::SEPARATOR);
    }
    text.push(alphabet::NULL);
    text
}

fn strip_gaps(aligned: &str, gap_ch: u8) -> String {
    aligned.chars().filter(|&ch| ch != char::from(gap_ch)).collect()
}

//-----------------------------------------------------------------------------

const TOY: [(&str, &str); 2] = [("s1", "ACGT-"), ("s2", "ACGTA")];
const GAPPY: [(&str, &str); 2] = [("s1", "A-C-G"), ("s2", "A-CAG")];

#[test]
fn count_in_toy_alignment() {
    let index = build_index(&TOY);
    assert_eq!(index.cs_len(), 5);
    assert_eq!(index.count("ACGT"), 2);
    assert_eq!(index.count("A"), 3);
    assert_eq!(index.count("CGTA"), 1);
    assert_eq!(index.count("TT"), 0);
}

#[test]
fn locate_in_toy_alignment() {
    let index = build_index(&TOY);
    let hits = index.locate("CGTA");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].cs_start, 2);
    assert_eq!(hits[0].cs_end, 5);
    assert_eq!(hits[0].match_cs, "CGTA");
}

#[test]
fn locate_restores_gaps() {
    let index = build_index(&GAPPY);
    let hits = index.locate("ACG");
    assert_eq!(hits.len(), 1, "ACG should match only the first sequence");
    assert_eq!(hits[0].cs_start, 1);
    assert_eq!(hits[0].cs_end, 5);
    assert_eq!(hits[0].match_cs, "A-C-G");

    let hits = index.locate("ACAG");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].cs_start, 1);
    assert_eq!(hits[0].cs_end, 5);
    assert_eq!(hits[0].match_cs, "A-CAG");
}

#[test]
fn count_agrees_with_locate() {
    let rows = [("s1", "ACGTACGT"), ("s2", "ACG-ACGA"), ("s3", "TTGTAC-T")];
    let index = build_index(&rows);
    for pattern in ["A", "C", "ACG", "ACGT", "GTAC", "TTGTACT", "AAAA", ""] {
        assert_eq!(
            index.count(pattern), index.locate(pattern).len(),
            "count and locate disagree for {:?}", pattern
        );
    }
}

#[test]
fn match_cs_round_trip() {
    let rows = [("s1", "ACGTACGT"), ("s2", "ACG-ACGA"), ("s3", "TTGTAC-T")];
    let index = build_index(&rows);
    for pattern in ["A", "ACG", "ACGA", "GTAC", "TGTACT"] {
        for hit in index.locate(pattern) {
            assert_eq!(
                strip_gaps(&hit.match_cs, index.gap_ch()), pattern,
                "Stripping gaps from {:?} should restore the pattern", hit.match_cs
            );
            assert_eq!(
                hit.cs_end - hit.cs_start + 1, hit.match_cs.len(),
                "Aligned match length should span the consensus interval"
            );
        }
    }
}

#[test]
fn access_sa_agrees_with_full_sa() {
    let rows = [("s1", "ACGTACGTAC"), ("s2", "AC--ACGTAC"), ("s3", "GTGTACATAC")];
    let index = build_index(&rows);
    let text = concat_text(&rows);
    let sa = suffix::suffix_array(&text).unwrap();
    for (i, &value) in sa.iter().enumerate() {
        assert_eq!(index.access_sa(i), value as usize, "Wrong SA value at {}", i);
    }
}

#[test]
fn empty_and_invalid_patterns() {
    let index = build_index(&TOY);
    assert_eq!(index.count(""), 0);
    assert!(index.locate("").is_empty());
    assert_eq!(index.locate_first(""), None);
    assert_eq!(index.count("ACNT"), 0, "Characters outside the alphabet match nothing");
    assert!(index.locate("AC-T").is_empty(), "Gap characters match nothing");
    assert!(index.locate_index("X").is_empty());
}

#[test]
fn matches_never_cross_separators() {
    // The last residue of s1 and the first residue of s2 are adjacent in
    // the concatenated text, but a separator sits between them.
    let index = build_index(&[("s1", "ACGT"), ("s2", "TACG")]);
    assert_eq!(index.count("TT"), 0);
    assert_eq!(index.count("GTTA"), 0);
    assert_eq!(index.count("TA"), 1, "TA occurs only inside the second sequence");
}

#[test]
fn locate_first_is_deterministic() {
    let index = build_index(&TOY);
    let first = index.locate_first("ACGT").unwrap();
    assert_eq!(first, index.locate_first("ACGT").unwrap());
    let all = index.locate("ACGT");
    assert_eq!(first, all[0], "locate_first should return the first interval entry");
}

#[test]
fn locate_one_uses_caller_rng() {
    let index = build_index(&TOY);
    let all = index.locate("A");
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for _ in 0..10 {
        let hit = index.locate_one("A", &mut rng).unwrap();
        assert!(all.contains(&hit), "Random hit should be a real occurrence");
    }
    // Same seed, same draws.
    let mut first_rng = ChaCha8Rng::seed_from_u64(7);
    let mut second_rng = ChaCha8Rng::seed_from_u64(7);
    assert_eq!(
        index.locate_one("A", &mut first_rng),
        index.locate_one("A", &mut second_rng)
    );
    assert_eq!(index.locate_one("TT", &mut first_rng), None);
}

#[test]
fn locate_index_with_gapped_rows() {
    // Rows with very different ungapped lengths; fixed-stride arithmetic
    // would misattribute the hits.
    let index = build_index(&[("s1", "A---"), ("s2", "A--T"), ("s3", "ACGT")]);
    let hits = index.locate_index("T");
    assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    let hits = index.locate_index("A");
    assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    let hits = index.locate_index("AT");
    assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![1], "AT is the ungapped second row");
    assert!(index.locate_index("CGTT").is_empty());
}

#[test]
fn statistics() {
    let index = build_index(&TOY);
    assert_eq!(index.num_seq(), 2);
    assert_eq!(index.concat_len(), 9 + 2);
    assert_eq!(index.cs(), " ACGTA");
    assert!((index.identity_at(1) - 1.0).abs() < 1e-12);
    assert!((index.identity_at(5) - 0.5).abs() < 1e-12);
}

//-----------------------------------------------------------------------------

#[test]
fn save_and_load_round_trip() {
    let index = build_index(&[("s1", "ACGT"), ("s2", "TGCA"), ("s3", "ACGA")]);
    assert_eq!(index.count("ACG"), 2);

    let filename = utils::temp_file_name("csfm");
    index.save(&filename).unwrap();
    assert!(utils::file_exists(&filename));
    let loaded = CsfmIndex::load(&filename).unwrap();
    std::fs::remove_file(&filename).ok();

    assert_eq!(loaded, index, "The loaded index should be identical");
    assert_eq!(loaded.count("ACG"), 2);
    assert_eq!(loaded.locate("ACG"), index.locate("ACG"));
    assert_eq!(loaded.locate("GCA"), index.locate("GCA"));
}

#[test]
fn load_rejects_bad_header() {
    let index = build_index(&TOY);
    let mut blob: Vec<u8> = Vec::new();
    index.save_to(&mut blob).unwrap();

    // Wrong magic number.
    let mut corrupted = blob.clone();
    corrupted[0] ^= 0xFF;
    let result = CsfmIndex::load_from(&mut corrupted.as_slice());
    assert!(result.is_err(), "A wrong magic number should be rejected");

    // Newer format version.
    let mut newer = blob.clone();
    newer[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
    let result = CsfmIndex::load_from(&mut newer.as_slice());
    assert!(result.is_err(), "A newer format version should be rejected");

    // Truncated blob.
    let truncated = &blob[..blob.len() / 2];
    let result = CsfmIndex::load_from(&mut &truncated[..]);
    assert!(result.is_err(), "A truncated blob should be rejected");
}

//-----------------------------------------------------------------------------
