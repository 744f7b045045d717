//! Fuzzy string similarity shared by C3 (club canonicalization) and C5
//! (name/club scoring). Hand-rolled: no fuzzy-matching crate appears
//! anywhere in the reference corpus for this, so this follows the
//! `fuzzywuzzy`/`rapidfuzz` token-sort/token-set-ratio family directly
//! rather than reaching for the standard library's exact-match tools
//! (§4.12 of SPEC_FULL.md).

/// Normalized Levenshtein similarity in `[0, 1]`; `1.0` for identical
/// strings, `0.0` for completely dissimilar strings of any length.
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    if max_len == 0 {
        return 1.0;
    }
    let dist = levenshtein_distance(&a_chars, &b_chars);
    1.0 - (dist as f64 / max_len as f64)
}

fn levenshtein_distance(a: &[char], b: &[char]) -> usize {
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0usize; m + 1];

    for i in 1..=n {
        curr[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[m]
}

fn tokenize(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

/// Reorders each string's tokens alphabetically before comparing — handles
/// word-reordering between providers (`"Dallas FC"` vs `"FC Dallas"`).
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let mut a_tokens = tokenize(a);
    let mut b_tokens = tokenize(b);
    a_tokens.sort_unstable();
    b_tokens.sort_unstable();
    levenshtein_ratio(&a_tokens.join(" "), &b_tokens.join(" "))
}

/// Compares the intersection-plus-sorted-remainder of each string's token
/// set against the other — handles one name being a superset of the
/// other's tokens (`"FC Dallas"` vs `"FC Dallas Academy Blue"`).
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    use std::collections::BTreeSet;

    let a_set: BTreeSet<&str> = tokenize(a).into_iter().collect();
    let b_set: BTreeSet<&str> = tokenize(b).into_iter().collect();

    let intersection: Vec<&str> = a_set.intersection(&b_set).copied().collect();
    let a_diff: Vec<&str> = a_set.difference(&b_set).copied().collect();
    let b_diff: Vec<&str> = b_set.difference(&a_set).copied().collect();

    let sorted_intersection = intersection.join(" ");
    let t0 = sorted_intersection.clone();
    let t1 = format!("{} {}", sorted_intersection, a_diff.join(" "))
        .trim()
        .to_string();
    let t2 = format!("{} {}", sorted_intersection, b_diff.join(" "))
        .trim()
        .to_string();

    levenshtein_ratio(&t0, &t1)
        .max(levenshtein_ratio(&t0, &t2))
        .max(levenshtein_ratio(&t1, &t2))
}

/// The similarity the matcher/canonicalizer actually call: the better of
/// token-sort and token-set ratio, matching §4.3/§4.5's "token-sort or
/// token-set ratio" language.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    token_sort_ratio(a, b).max(token_set_ratio(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_are_perfectly_similar() {
        assert_eq!(levenshtein_ratio("dallas", "dallas"), 1.0);
    }

    #[test]
    fn reordered_tokens_score_highly() {
        let s = token_sort_ratio("dallas fc academy", "fc academy dallas");
        assert!(s > 0.99, "expected near-1.0, got {s}");
    }

    #[test]
    fn superset_tokens_score_highly_via_token_set() {
        let s = token_set_ratio("fc dallas", "fc dallas academy blue");
        assert!(s > 0.8, "expected high token-set ratio, got {s}");
    }

    #[test]
    fn dissimilar_strings_score_low() {
        let s = name_similarity("fc dallas", "manchester united");
        assert!(s < 0.4, "expected low similarity, got {s}");
    }
}
