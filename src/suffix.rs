//! Linear-time suffix array construction and BWT derivation.
//!
//! The builder implements the SA-IS algorithm (Nong, Zhang, Chan 2009)
//! over a coded byte text. The text must end with a null terminator that
//! is the unique smallest symbol; interior separators are ordinary
//! symbols and may repeat.

//-----------------------------------------------------------------------------

const EMPTY: usize = usize::MAX;

/// Builds the suffix array of the coded text.
///
/// The last symbol must be the null code `0` and must not occur anywhere
/// else. Returns an error if the text does not satisfy the precondition.
pub fn suffix_array(text: &[u8]) -> Result<Vec<u32>, String> {
    let n = text.len();
    if n == 0 {
        return Err(String::from("Cannot build a suffix array over an empty text"));
    }
    if text[n - 1] != 0 {
        return Err(String::from("The text must end with a null terminator"));
    }
    if text[..n - 1].iter().any(|&c| c == 0) {
        return Err(String::from("The null terminator must be unique"));
    }
    if n > u32::MAX as usize {
        return Err(format!("Text of length {} is too long for a 32-bit suffix array", n));
    }

    let coded: Vec<usize> = text.iter().map(|&c| c as usize).collect();
    let mut sa = vec![EMPTY; n];
    sa_is(&coded, &mut sa, 256);
    Ok(sa.into_iter().map(|i| i as u32).collect())
}

/// Derives the BWT from the text and its suffix array.
///
/// `X[i] = T[SA[i] - 1]`, wrapping to the null terminator when
/// `SA[i] == 0`.
pub fn bwt_from_sa(text: &[u8], sa: &[u32]) -> Vec<u8> {
    sa.iter().map(|&i| {
        if i == 0 { 0 } else { text[i as usize - 1] }
    }).collect()
}

//-----------------------------------------------------------------------------

// The recursion works over `usize` symbols so that the names assigned to
// LMS substrings can exceed 255.
fn sa_is(text: &[usize], sa: &mut [usize], sigma: usize) {
    let n = text.len();
    if n == 1 {
        sa[0] = 0;
        return;
    }
    if n == 2 {
        // The sentinel suffix is always the smaller one.
        sa[0] = 1;
        sa[1] = 0;
        return;
    }

    // Suffix types: S-type if the suffix is smaller than its successor.
    let mut is_s = vec![false; n];
    is_s[n - 1] = true;
    for i in (0..n - 1).rev() {
        is_s[i] = text[i] < text[i + 1] || (text[i] == text[i + 1] && is_s[i + 1]);
    }
    let is_lms = |i: usize| i > 0 && is_s[i] && !is_s[i - 1];

    let mut bucket = vec![0usize; sigma];
    for &c in text {
        bucket[c] += 1;
    }

    // First pass: place LMS suffixes in text order and induce an order
    // that sorts the LMS substrings.
    sa.fill(EMPTY);
    let mut tail = bucket_tails(&bucket);
    for i in 0..n {
        if is_lms(i) {
            tail[text[i]] -= 1;
            sa[tail[text[i]]] = i;
        }
    }
    induce_l(text, sa, &is_s, &bucket);
    induce_s(text, sa, &is_s, &bucket);

    // Name the LMS substrings in their sorted order.
    let lms_sorted: Vec<usize> = sa.iter().copied().filter(|&p| p != EMPTY && is_lms(p)).collect();
    let mut names = vec![EMPTY; n];
    let mut current_name = 0;
    names[lms_sorted[0]] = 0;
    for window in lms_sorted.windows(2) {
        if !lms_substrings_equal(text, &is_s, window[0], window[1]) {
            current_name += 1;
        }
        names[window[1]] = current_name;
    }

    // Sort the LMS suffixes, recursing if some substrings were equal.
    let lms_positions: Vec<usize> = (0..n).filter(|&i| is_lms(i)).collect();
    let lms_in_order: Vec<usize> = if current_name + 1 == lms_sorted.len() {
        lms_sorted
    } else {
        let reduced: Vec<usize> = lms_positions.iter().map(|&i| names[i]).collect();
        let mut reduced_sa = vec![EMPTY; reduced.len()];
        sa_is(&reduced, &mut reduced_sa, current_name + 1);
        reduced_sa.iter().map(|&k| lms_positions[k]).collect()
    };

    // Final pass: place the sorted LMS suffixes and induce the rest.
    sa.fill(EMPTY);
    let mut tail = bucket_tails(&bucket);
    for &i in lms_in_order.iter().rev() {
        tail[text[i]] -= 1;
        sa[tail[text[i]]] = i;
    }
    induce_l(text, sa, &is_s, &bucket);
    induce_s(text, sa, &is_s, &bucket);
}

fn bucket_heads(bucket: &[usize]) -> Vec<usize> {
    let mut heads = Vec::with_capacity(bucket.len());
    let mut sum = 0;
    for &count in bucket {
        heads.push(sum);
        sum += count;
    }
    heads
}

fn bucket_tails(bucket: &[usize]) -> Vec<usize> {
    let mut tails = Vec::with_capacity(bucket.len());
    let mut sum = 0;
    for &count in bucket {
        sum += count;
        tails.push(sum);
    }
    tails
}

fn induce_l(text: &[usize], sa: &mut [usize], is_s: &[bool], bucket: &[usize]) {
    let mut head = bucket_heads(bucket);
    for k in 0..sa.len() {
        let p = sa[k];
        if p != EMPTY && p > 0 && !is_s[p - 1] {
            let c = text[p - 1];
            sa[head[c]] = p - 1;
            head[c] += 1;
        }
    }
}

fn induce_s(text: &[usize], sa: &mut [usize], is_s: &[bool], bucket: &[usize]) {
    let mut tail = bucket_tails(bucket);
    for k in (0..sa.len()).rev() {
        let p = sa[k];
        if p != EMPTY && p > 0 && is_s[p - 1] {
            let c = text[p - 1];
            tail[c] -= 1;
            sa[tail[c]] = p - 1;
        }
    }
}

// Two LMS substrings are equal if they match in both symbols and types up
// to and including the next LMS position.
fn lms_substrings_equal(text: &[usize], is_s: &[bool], a: usize, b: usize) -> bool {
    if a == b {
        return true;
    }
    let n = text.len();
    let is_lms = |i: usize| i > 0 && is_s[i] && !is_s[i - 1];
    let mut offset = 0;
    loop {
        let ai = a + offset;
        let bi = b + offset;
        if ai >= n || bi >= n || text[ai] != text[bi] || is_s[ai] != is_s[bi] {
            return false;
        }
        if offset > 0 && is_lms(ai) {
            return is_lms(bi);
        }
        if offset > 0 && is_lms(bi) {
            return false;
        }
        offset += 1;
    }
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
