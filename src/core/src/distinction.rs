//! C2 — Distinction Extractor. Decomposes a normalized token stream into
//! ten feature sets used purely for hard rejection (never additive
//! scoring), per spec §4.2.

use crate::normalize::{classify_tokens, AgeToken, RawToken};
use crate::vocab;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distinction {
    pub colors: Vec<String>,
    pub directions: Vec<String>,
    pub programs: Vec<String>,
    pub team_number: Option<String>,
    pub location_codes: Vec<String>,
    pub state_codes: Vec<String>,
    pub squad_words: Vec<String>,
    pub age_tokens: Vec<String>,
    pub secondary_nums: Vec<String>,
    pub coach_name: Option<String>,
}

fn is_roman_numeral(token: &str) -> bool {
    vocab::ROMAN_NUMERALS.contains(&token)
}

fn titlecase(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn looks_capitalized(original_case_token: &str) -> bool {
    original_case_token
        .chars()
        .next()
        .map(|c| c.is_uppercase())
        .unwrap_or(false)
}

/// Extracts all ten feature sets from a raw team name. This re-tokenizes
/// with `classify_tokens` (rather than taking an already-normalized
/// `Normalized`) because several features need the age token's *position*
/// in the stream, which plain normalization discards.
pub fn extract(raw: &str) -> Result<Distinction, crate::error::NormalizationError> {
    let classified = classify_tokens(raw)?;
    // classify_tokens lowercases internally; recover original-case
    // capitalization signal for the coach-name ALL-CAPS/capitalized
    // fallbacks by scanning the raw string's own whitespace-split tokens
    // in parallel where lengths line up closely enough to be useful.
    let original_words: Vec<&str> = raw.split_whitespace().collect();

    let first_age_index = classified
        .iter()
        .position(|t| matches!(t, RawToken::Age(_)));

    let mut d = Distinction::default();

    // Pass 1: vocabulary tokens (colors, directions, programs, roman
    // numerals / team numbers, region/state codes).
    let mut residue_indices: Vec<usize> = Vec::new();
    for (i, tok) in classified.iter().enumerate() {
        let word = match tok {
            RawToken::Word(w) => w,
            RawToken::Age(a) => {
                d.age_tokens.push(format!("{:?}", a));
                continue;
            }
            RawToken::GenderWord(_) => continue,
        };

        if vocab::COLORS.contains(&word.as_str()) {
            d.colors.push(word.clone());
            continue;
        }
        if vocab::DIRECTIONS.contains(&word.as_str()) {
            d.directions.push(word.clone());
            continue;
        }
        if vocab::PROGRAM_NAMES.contains(&word.as_str()) {
            d.programs.push(word.clone());
            continue;
        }
        if is_roman_numeral(word) {
            d.team_number = Some(word.clone());
            continue;
        }
        if word.chars().all(|c| c.is_ascii_digit()) {
            // Pass 2: age patterns already consumed by classify_tokens;
            // any remaining pure-numeric token is a secondary number
            // (jersey/division number, not age).
            d.secondary_nums.push(word.clone());
            continue;
        }
        if word.len() >= 2 && word.len() <= 3 && vocab::REGION_CODES.contains(&word.as_str()) {
            if word.len() == 2 {
                d.state_codes.push(word.clone());
            } else {
                d.location_codes.push(word.clone());
            }
            continue;
        }
        if word.len() >= 2 && word.len() <= 3 && !vocab::COMMON_WORDS.contains(&word.as_str()) {
            d.location_codes.push(word.clone());
            continue;
        }

        residue_indices.push(i);
    }

    // Trailing arabic team number: a residual pure-digit token at the very
    // end (e.g. "Team 2") that isn't an age token.
    if d.team_number.is_none() {
        if let Some(RawToken::Word(last)) = classified.last() {
            if last.chars().all(|c| c.is_ascii_digit())
                && first_age_index.map(|idx| idx + 1 != classified.len() - 1).unwrap_or(true)
            {
                d.team_number = Some(last.clone());
            }
        }
    }

    // Pass 4: residue by length — squad words are >=4-char leftovers not
    // otherwise classified.
    for &i in &residue_indices {
        if let RawToken::Word(w) = &classified[i] {
            if w.len() >= 4 {
                d.squad_words.push(w.clone());
            }
        }
    }

    // Coach-name detection (§4.2, §9): the single capitalized/standalone
    // residue token found after the age position, filtered by the three
    // exclusion sets, with fallbacks in order: parenthesized non-region
    // token, ALL-CAPS tail token, trailing capitalized non-known token.
    d.coach_name = detect_coach_name(&classified, &original_words, first_age_index, &residue_indices);

    Ok(d)
}

fn detect_coach_name(
    classified: &[RawToken],
    original_words: &[&str],
    first_age_index: Option<usize>,
    residue_indices: &[usize],
) -> Option<String> {
    let after_age_start = first_age_index.map(|i| i + 1).unwrap_or(0);

    let is_excluded = |w: &str| {
        vocab::COMMON_WORDS.contains(w) || vocab::REGION_CODES.contains(w) || vocab::PROGRAM_NAMES.contains(w)
    };

    // Primary: a single residue token after the age position, surviving
    // all three exclusion sets.
    let candidates: Vec<&String> = residue_indices
        .iter()
        .filter(|&&i| i >= after_age_start)
        .filter_map(|&i| match &classified[i] {
            RawToken::Word(w) if !is_excluded(w) => Some(w),
            _ => None,
        })
        .collect();

    if candidates.len() == 1 {
        return Some(titlecase(candidates[0]));
    }
    if candidates.len() > 1 {
        // Ambiguous — fall through to the positional fallbacks rather than
        // guessing among several residue words.
    }

    // Fallback 1: a parenthesized non-region token in the original text.
    if let Some(paren_start) = original_words.iter().position(|w| w.starts_with('(')) {
        let joined: String = original_words[paren_start..]
            .join(" ")
            .chars()
            .filter(|c| *c != '(' && *c != ')')
            .collect();
        let lowered = joined.to_ascii_lowercase();
        if !lowered.is_empty() && !vocab::REGION_CODES.contains(lowered.as_str()) {
            return Some(joined);
        }
    }

    // Fallback 2: an ALL-CAPS tail token in the original text.
    if let Some(tail) = original_words.iter().rev().find(|w| {
        w.len() >= 2
            && w.chars().all(|c| c.is_ascii_uppercase() || !c.is_alphabetic())
            && w.chars().any(|c| c.is_alphabetic())
    }) {
        return Some((*tail).to_string());
    }

    // Fallback 3: a trailing capitalized, non-known token.
    if let Some(tail) = original_words.iter().rev().find(|w| {
        looks_capitalized(w) && !is_excluded(&w.to_ascii_lowercase())
    }) {
        return Some((*tail).to_string());
    }

    None
}

/// §4.2: two decomposition results are pair-incompatible iff any of colors,
/// directions, programs, team numbers, location codes, squad words, or
/// coach names differ. This is an absolute reject signal that scoring
/// never overrides.
pub fn pair_incompatible(a: &Distinction, b: &Distinction) -> bool {
    fn sets_conflict(x: &[String], y: &[String]) -> bool {
        !x.is_empty() && !y.is_empty() && x.iter().collect::<std::collections::HashSet<_>>()
            != y.iter().collect::<std::collections::HashSet<_>>()
    }

    sets_conflict(&a.colors, &b.colors)
        || sets_conflict(&a.directions, &b.directions)
        || sets_conflict(&a.programs, &b.programs)
        || (a.team_number.is_some() && b.team_number.is_some() && a.team_number != b.team_number)
        || sets_conflict(&a.location_codes, &b.location_codes)
        || sets_conflict(&a.squad_words, &b.squad_words)
        || (a.coach_name.is_some()
            && b.coach_name.is_some()
            && a.coach_name.as_deref().map(str::to_ascii_lowercase)
                != b.coach_name.as_deref().map(str::to_ascii_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_color_as_distinguishing_feature() {
        let d = extract("Atletico Dallas 15G Davis").unwrap();
        assert_eq!(d.coach_name.as_deref(), Some("Davis"));
    }

    #[test]
    fn variant_mismatch_rejects_by_coach_name() {
        let davis = extract("Atletico Dallas 15G Davis").unwrap();
        let riedell = extract("Atletico Dallas 15G Riedell").unwrap();
        assert!(pair_incompatible(&davis, &riedell));
    }

    #[test]
    fn color_difference_is_pair_incompatible() {
        let blue = extract("FC Dallas 2014 Blue").unwrap();
        let red = extract("FC Dallas 2014 Red").unwrap();
        assert!(pair_incompatible(&blue, &red));
    }

    #[test]
    fn identical_names_are_compatible() {
        let a = extract("FC Dallas 2014 Blue").unwrap();
        let b = extract("FC Dallas 2014 Blue").unwrap();
        assert!(!pair_incompatible(&a, &b));
    }

    #[test]
    fn roman_numeral_team_number_detected() {
        let d = extract("Richmond Kickers II").unwrap();
        assert_eq!(d.team_number.as_deref(), Some("ii"));
    }
}
