//! C1 — Name Normalizer. A pure function over a raw team-name string that
//! produces a canonical token sequence plus any `(age, gender)` pair found
//! embedded in the name. See spec §4.1.

use crate::error::NormalizationError;
use crate::ids::{AgeGroup, Gender};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgeToken {
    UAge(u8),
    BirthYear(u16),
}

impl AgeToken {
    /// A `U-age` on the left of `as_u_age`, or a birth year converted via
    /// the season mapping supplied by the caller (ingestion owns the
    /// current-season constant, §4.7).
    pub fn as_u_age(&self, current_season_start_year: u16) -> Option<AgeGroup> {
        match self {
            AgeToken::UAge(u) => Some(AgeGroup::new(*u)),
            AgeToken::BirthYear(year) => {
                let u = (current_season_start_year as i32 + 2) - *year as i32;
                if (AgeGroup::MIN_RANKED as i32..=AgeGroup::MAX_RANKED as i32).contains(&u) {
                    Some(AgeGroup::new(u as u8))
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Normalized {
    pub tokens: Vec<String>,
    pub age: Option<AgeToken>,
    pub gender: Option<Gender>,
}

impl Normalized {
    pub fn joined(&self) -> String {
        self.tokens.join(" ")
    }
}

// `14B`, `B14`, `2014B`, `B2014`, `U14B`, `BU14`, `U-14`, `U14`, `14`,
// `15M`, `G2016`, `2016G` — the twelve surface forms enumerated by §4.1
// step 4 (the thirteenth, `"2014 Boys"`, is two whitespace-separated
// tokens and is handled by the standalone gender-word pass instead).
static AGE_GENDER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?P<g1>[bgmf])-?(?P<n1>\d{2,4})|(?P<n2>\d{2,4})(?P<g2>[bgmf])|u-?(?P<u1>\d{1,2})(?P<g3>[bgmf])?|(?P<g4>[bgmf])?u-?(?P<u2>\d{1,2})|(?P<n3>\d{2,4}))$").unwrap()
});

fn expand_two_digit_year(two_digit: u16) -> u16 {
    // Sliding window: a 2-digit year <= 18 is a youth birth year in the
    // 2000s; anything else would fall outside a plausible U10-U18 cohort
    // and is left untouched by the caller's range check.
    if two_digit <= 18 {
        2000 + two_digit
    } else {
        1900 + two_digit
    }
}

fn parse_age_gender_token(raw: &str) -> Option<(Option<AgeToken>, Option<Gender>)> {
    let caps = AGE_GENDER_TOKEN.captures(raw)?;

    let gender_letter = caps
        .name("g1")
        .or_else(|| caps.name("g2"))
        .or_else(|| caps.name("g3"))
        .or_else(|| caps.name("g4"))
        .map(|m| m.as_str().to_ascii_lowercase());
    let gender = gender_letter.and_then(|g| Gender::parse(&g));

    if let Some(u) = caps.name("u1").or_else(|| caps.name("u2")) {
        let u_age: u8 = u.as_str().parse().ok()?;
        return Some((Some(AgeToken::UAge(u_age)), gender));
    }

    let number = caps
        .name("n1")
        .or_else(|| caps.name("n2"))
        .or_else(|| caps.name("n3"))
        .map(|m| m.as_str());

    if let Some(n) = number {
        let value: u16 = n.parse().ok()?;
        let year = if n.len() <= 2 {
            expand_two_digit_year(value)
        } else {
            value
        };
        return Some((Some(AgeToken::BirthYear(year)), gender));
    }

    None
}

fn join_compound_bigrams(tokens: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if i + 1 < tokens.len() {
            let pair = crate::vocab::COMPOUND_BIGRAMS
                .iter()
                .find(|(a, b, _)| *a == tokens[i] && *b == tokens[i + 1]);
            if let Some((_, _, joined)) = pair {
                out.push((*joined).to_string());
                i += 2;
                continue;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

fn strip_punctuation(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '\'')
        .collect()
}

/// A classified token in original order, preserved so consumers that need
/// positional context (e.g. the distinction extractor's "residue after the
/// age token" rules, §4.2) can still find the age token's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawToken {
    Word(String),
    Age(AgeToken),
    GenderWord(Gender),
}

/// Steps 1-6 of §4.1, but stopping short of discarding the age/gender
/// tokens so downstream positional consumers (C2) can still see them.
pub fn classify_tokens(raw: &str) -> Result<Vec<RawToken>, NormalizationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizationError);
    }

    let lowered = trimmed.to_ascii_lowercase();

    // Step 3 (hyphen -> space) happens before vocabulary stripping so a
    // hyphenated marker like `ECNL-RL` is still matched as a single
    // normalized phrase in step 2's phrase table, then collapsed again here
    // for any hyphens vocabulary stripping left behind.
    let mut working = lowered;
    for marker in crate::vocab::LEAGUE_MARKERS {
        if marker.contains(' ') || marker.contains('-') || marker.contains('_') {
            let squashed = marker.replace(['-', '_'], " ");
            working = working.replace(marker, " ");
            working = working.replace(&squashed, " ");
        }
    }
    working = working.replace('-', " ");
    let collapsed: Vec<&str> = working.split_whitespace().collect();
    let mut tokens: Vec<String> = Vec::new();
    for tok in collapsed {
        let cleaned = strip_punctuation(tok);
        if cleaned.is_empty() {
            continue;
        }
        if crate::vocab::is_league_marker(&cleaned) {
            continue;
        }
        tokens.push(cleaned);
    }

    tokens = join_compound_bigrams(tokens);

    let mut out = Vec::with_capacity(tokens.len());
    for tok in tokens {
        if crate::vocab::GENDER_WORDS.contains(&tok.as_str()) {
            if let Some(g) = Gender::parse(&tok) {
                out.push(RawToken::GenderWord(g));
                continue;
            }
        }
        if let Some((Some(tok_age), tok_gender)) = parse_age_gender_token(&tok) {
            out.push(RawToken::Age(tok_age));
            if let Some(g) = tok_gender {
                out.push(RawToken::GenderWord(g));
            }
            continue;
        }
        out.push(RawToken::Word(tok));
    }

    Ok(out)
}

/// Runs the full C1 pipeline over a raw team name.
pub fn normalize(raw: &str) -> Result<Normalized, NormalizationError> {
    let classified = classify_tokens(raw)?;

    let mut age: Option<AgeToken> = None;
    let mut gender: Option<Gender> = None;
    let mut kept = Vec::new();

    for tok in classified {
        match tok {
            RawToken::Word(w) => kept.push(w),
            RawToken::Age(a) => age = age.or(Some(a)),
            RawToken::GenderWord(g) => gender = gender.or(Some(g)),
        }
    }

    Ok(Normalized {
        tokens: kept,
        age,
        gender,
    })
}
