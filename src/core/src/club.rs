//! C3 — Club Canonicalizer. Maps noisy club-name surface forms onto a
//! stable canonical club id via a registry of known variants, falling back
//! to fuzzy token-set similarity, per spec §4.3.

use crate::textsim::token_set_ratio;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClubId(pub String);

/// Closed set of city-abbreviation expansions applied before lookup.
/// Non-exhaustive by design — grown in place as new providers surface new
/// abbreviations, never replaced with a different mechanism.
static CITY_ABBREVIATIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("ftw", "fort worth"),
        ("stl", "saint louis"),
        ("slc", "salt lake city"),
        ("okc", "oklahoma city"),
        ("nola", "new orleans"),
        ("dfw", "dallas fort worth"),
        ("atl", "atlanta"),
        ("nyc", "new york city"),
        ("la", "los angeles"),
        ("sd", "san diego"),
        ("sf", "san francisco"),
        ("kc", "kansas city"),
    ]
    .into_iter()
    .collect()
});

const MIN_CLUB_NAME_LEN: usize = 3;
const FUZZY_ACCEPT_THRESHOLD: f64 = 0.85;

/// Outcome of `ClubRegistry::canonicalize`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClubMatch {
    pub canonical_id: Option<ClubId>,
    pub confidence: f64,
    /// The normalized form, suitable for re-feeding through `canonicalize`
    /// (idempotence: `canonicalize(canonicalize(x).display) ==
    /// canonicalize(x)`).
    pub display: String,
}

fn dedup_whole_word_repeats(tokens: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for (i, tok) in tokens.iter().enumerate() {
        if i > 0 && tokens[i - 1] == *tok {
            continue;
        }
        out.push(tok.clone());
    }
    out
}

/// Normalizes a raw club string: lowercase/strip, strip trailing age/year
/// suffixes, punctuation removal, city-abbreviation expansion, suffix
/// canonicalization (`Soccer Club -> SC`, `Football Club -> FC`,
/// `F.C. -> FC`, prefixes preserved), then dedups repeated whole-word runs.
pub fn normalize_club_name(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let no_punct: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<String> = no_punct.split_whitespace().map(|s| s.to_string()).collect();

    // Strip trailing age/year suffix tokens (pure digits, or u-age forms).
    while let Some(last) = tokens.last() {
        let is_year_or_age = last.chars().all(|c| c.is_ascii_digit())
            || (last.starts_with('u') && last[1..].chars().all(|c| c.is_ascii_digit()) && last.len() > 1);
        if is_year_or_age {
            tokens.pop();
        } else {
            break;
        }
    }

    // City abbreviation expansion.
    let mut expanded: Vec<String> = Vec::with_capacity(tokens.len());
    for tok in &tokens {
        if let Some(full) = CITY_ABBREVIATIONS.get(tok.as_str()) {
            expanded.extend(full.split_whitespace().map(|s| s.to_string()));
        } else {
            expanded.push(tok.clone());
        }
    }

    // Non-stripping suffix canonicalization, phrase-level first so
    // "soccer club" -> "sc" collapses a two-token phrase into one.
    let joined = expanded.join(" ");
    let joined = joined.replace("soccer club", "sc");
    let joined = joined.replace("football club", "fc");
    let joined = joined.replace("f c", "fc");

    let tokens: Vec<String> = joined.split_whitespace().map(|t| t.to_string()).collect();

    let deduped = dedup_whole_word_repeats(&tokens);
    deduped.join(" ")
}

/// Holds canonical clubs, each with a set of known variant surface forms.
#[derive(Debug, Default, Clone)]
pub struct ClubRegistry {
    /// normalized variant -> canonical id
    variants: HashMap<String, ClubId>,
    canonical_variants: HashMap<ClubId, Vec<String>>,
}

impl ClubRegistry {
    pub fn new() -> Self {
        ClubRegistry::default()
    }

    /// Registers (or extends) a canonical club with known variant spellings.
    /// Variants are normalized on insert so lookups never re-normalize a
    /// stale spelling.
    pub fn register<I: IntoIterator<Item = String>>(&mut self, canonical_id: ClubId, variants: I) {
        let entry = self.canonical_variants.entry(canonical_id.clone()).or_default();
        for variant in variants {
            let normalized = normalize_club_name(&variant);
            if normalized.len() < MIN_CLUB_NAME_LEN {
                continue;
            }
            self.variants.insert(normalized.clone(), canonical_id.clone());
            if !entry.contains(&normalized) {
                entry.push(normalized);
            }
        }
    }

    pub fn canonicalize(&self, input: &str) -> ClubMatch {
        let normalized = normalize_club_name(input);

        if normalized.len() < MIN_CLUB_NAME_LEN {
            return ClubMatch {
                canonical_id: None,
                confidence: 0.0,
                display: normalized,
            };
        }

        if let Some(id) = self.variants.get(&normalized) {
            return ClubMatch {
                canonical_id: Some(id.clone()),
                confidence: 1.0,
                display: normalized,
            };
        }

        let mut best: Option<(ClubId, f64)> = None;
        for (id, variants) in &self.canonical_variants {
            for variant in variants {
                let score = token_set_ratio(&normalized, variant);
                if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                    best = Some((id.clone(), score));
                }
            }
        }

        if let Some((id, score)) = best {
            if score >= FUZZY_ACCEPT_THRESHOLD {
                return ClubMatch {
                    canonical_id: Some(id),
                    confidence: score,
                    display: normalized,
                };
            }
        }

        ClubMatch {
            canonical_id: None,
            confidence: 0.8,
            display: normalized,
        }
    }

    /// Similarity between two already-normalized club strings, exposed for
    /// C5's `club_similarity` scoring term.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        token_set_ratio(&normalize_club_name(a), &normalize_club_name(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> ClubRegistry {
        let mut reg = ClubRegistry::new();
        reg.register(
            ClubId("fc-dallas".into()),
            vec!["FC Dallas".to_string(), "Dallas FC".to_string(), "FCD".to_string()],
        );
        reg.register(
            ClubId("arkansas-sc".into()),
            vec!["Arkansas SC".to_string(), "Arkansas Soccer Club".to_string()],
        );
        reg
    }

    #[test]
    fn exact_variant_resolves_with_full_confidence() {
        let reg = sample_registry();
        let m = reg.canonicalize("FC Dallas");
        assert_eq!(m.canonical_id, Some(ClubId("fc-dallas".into())));
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn prefix_fc_does_not_collapse_with_suffix_sc() {
        let mut reg = ClubRegistry::new();
        reg.register(ClubId("fc-arkansas".into()), vec!["FC Arkansas".to_string()]);
        reg.register(ClubId("arkansas-sc".into()), vec!["Arkansas SC".to_string()]);

        let a = reg.canonicalize("FC Arkansas");
        let b = reg.canonicalize("Arkansas SC");
        assert_ne!(a.canonical_id, b.canonical_id);
    }

    #[test]
    fn fuzzy_match_accepts_above_threshold() {
        let reg = sample_registry();
        let m = reg.canonicalize("FC Dallas Academy 2014");
        assert_eq!(m.canonical_id, Some(ClubId("fc-dallas".into())));
    }

    #[test]
    fn unknown_club_returns_null_id_with_baseline_confidence() {
        let reg = sample_registry();
        let m = reg.canonicalize("Totally Unknown United");
        assert_eq!(m.canonical_id, None);
        assert_eq!(m.confidence, 0.8);
    }

    #[test]
    fn rejects_too_short_names() {
        let reg = sample_registry();
        let m = reg.canonicalize("FC");
        // "fc" survives as a token but is below MIN_CLUB_NAME_LEN as a whole name
        assert!(m.display.len() < MIN_CLUB_NAME_LEN || m.canonical_id.is_none());
    }

    #[test]
    fn canonicalize_is_idempotent_on_its_own_display_form() {
        let reg = sample_registry();
        let once = reg.canonicalize("Dallas FC 2014");
        let twice = reg.canonicalize(&once.display);
        assert_eq!(once.canonical_id, twice.canonical_id);
        assert_eq!(once.display, twice.display);
    }

    #[test]
    fn dedups_repeated_whole_word_runs() {
        let n = normalize_club_name("Dallas Dallas FC");
        assert_eq!(n, "dallas fc");
    }
}
