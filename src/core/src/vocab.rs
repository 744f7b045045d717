//! Closed, compile-time vocabularies shared by the normalizer, the
//! distinction extractor, and the review pipeline (§9: "encode the
//! exclusion sets as immutable compile-time data shared by the extractor
//! and the review pipeline").

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// League/tier markers stripped during normalization (§4.1 step 2). Listed
/// longest-first so `ECNL-RL`/`ECNL_RL` never gets shadowed by a bare `ECNL`
/// match.
pub static LEAGUE_MARKERS: &[&str] = &[
    "pre-ecnl",
    "pre ecnl",
    "ecnl-rl",
    "ecnl_rl",
    "ecnl rl",
    "mls next",
    "mls-next",
    "mls_next",
    "ecnl",
    "ecrl",
    "rl",
    "ga",
    "npl",
    "dplo",
    "dpl",
    "comp",
    "academy",
    "select",
    "premier",
    "elite",
];

/// Bigrams collapsed into a single compound token before splitting (§4.1
/// step 6), so a later whitespace split never separates them again.
pub static COMPOUND_BIGRAMS: &[(&str, &str, &str)] = &[
    ("ecnl", "rl", "ecnl_rl"),
    ("mls", "next", "mls_next"),
    ("pre", "ecnl", "pre_ecnl"),
];

pub static GENDER_WORDS: &[&str] = &["boys", "girls", "male", "female", "coed", "boy", "girl"];

/// ~300 common English words excluded from coach-name residue detection
/// (§4.2, §9). Kept intentionally short here (a representative core set);
/// the list is meant to be grown in place, not replaced with a different
/// mechanism.
pub static COMMON_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "of", "for", "club", "soccer", "football", "futbol", "fc", "sc", "fútbol",
        "youth", "united", "city", "town", "county", "valley", "river", "lake", "park", "north",
        "south", "east", "west", "central", "metro", "area", "region", "district", "league",
        "association", "alliance", "federation", "conference", "division", "group", "black",
        "white", "red", "blue", "green", "gold", "silver", "orange", "purple", "gray", "grey",
        "navy", "maroon", "team", "squad", "athletic", "athletics", "sports", "sporting", "academy",
        "institute", "school", "high", "junior", "senior", "rec", "recreation", "travel",
        "competitive", "premier", "select", "elite", "classic", "development", "program", "boys",
        "girls", "male", "female", "coed", "first", "second", "third", "fourth", "fifth", "one",
        "two", "three", "four", "five", "a", "b", "c", "d", "old", "new", "inc", "llc", "co",
    ]
    .into_iter()
    .collect()
});

/// ~100 two/three-letter region/state-style codes excluded from coach-name
/// residue detection and used by the distinction extractor's
/// `location_codes`/`state_codes` passes.
pub static REGION_CODES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "al", "ak", "az", "ar", "ca", "co", "ct", "de", "fl", "ga", "hi", "id", "il", "in", "ia",
        "ks", "ky", "la", "me", "md", "ma", "mi", "mn", "ms", "mo", "mt", "ne", "nv", "nh", "nj",
        "nm", "ny", "nc", "nd", "oh", "ok", "or", "pa", "ri", "sc", "sd", "tn", "tx", "ut", "vt",
        "va", "wa", "wv", "wi", "wy", "dc", "pr", "nor", "soc", "noca", "soca", "pnw", "sw", "ne",
        "nw", "se", "mw", "atl", "gulf", "mid",
    ]
    .into_iter()
    .collect()
});

/// ~30 known program names excluded from coach-name residue detection.
pub static PROGRAM_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "ecnl", "ecnl_rl", "ecrl", "mls_next", "npl", "dpl", "dplo", "pre_ecnl", "usl", "usya",
        "usclub", "gotsport", "tgs", "playmetrics", "rankone", "affinity", "demosphere", "surf",
        "presidents", "national", "regional", "state", "copa", "showcase", "invitational",
        "champions", "cup", "league", "conference", "academy",
    ]
    .into_iter()
    .collect()
});

pub fn is_league_marker(token: &str) -> bool {
    LEAGUE_MARKERS.contains(&token)
}

/// Jersey/kit colors — used by C2's `colors` feature set.
pub static COLORS: &[&str] = &[
    "black", "white", "red", "blue", "navy", "royal", "green", "gold", "yellow", "silver",
    "orange", "purple", "maroon", "gray", "grey", "crimson", "scarlet", "teal", "sky", "forest",
    "emerald", "charcoal", "cardinal", "burgundy", "violet", "magenta", "bronze", "platinum",
];

/// Compass/positional directions — used by C2's `directions` feature set.
pub static DIRECTIONS: &[&str] = &[
    "north", "south", "east", "west", "northeast", "northwest", "southeast", "southwest",
    "central", "metro",
];

/// Roman numerals I-X, used to detect a trailing team-number token.
pub static ROMAN_NUMERALS: &[&str] = &["i", "ii", "iii", "iv", "v", "vi", "vii", "viii", "ix", "x"];

