use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable, opaque identifier for a master team. Immutable while the team is
/// active; a deprecated team keeps its id so historical queries still resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterId(pub Uuid);

impl MasterId {
    pub fn new() -> Self {
        MasterId(Uuid::new_v4())
    }
}

impl Default for MasterId {
    fn default() -> Self {
        MasterId::new()
    }
}

impl fmt::Display for MasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a data source (row id in the provider table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub u32);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn parse(raw: &str) -> Option<Gender> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" | "boys" | "b" | "m" => Some(Gender::Male),
            "female" | "girls" | "g" | "f" => Some(Gender::Female),
            _ => None,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => write!(f, "Male"),
            Gender::Female => write!(f, "Female"),
        }
    }
}

/// `u10`..`u18`. Anything outside that range (e.g. U19) is representable for
/// identity/ingestion purposes but is never a ranking cohort (§9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgeGroup(pub u8);

impl AgeGroup {
    pub const MIN_RANKED: u8 = 10;
    pub const MAX_RANKED: u8 = 18;

    pub fn new(u_age: u8) -> Self {
        AgeGroup(u_age)
    }

    pub fn is_ranked(&self) -> bool {
        (Self::MIN_RANKED..=Self::MAX_RANKED).contains(&self.0)
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// `(age_group, gender)` — the unit of normalization and ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cohort {
    pub age_group: AgeGroup,
    pub gender: Gender,
}

impl Cohort {
    /// Returns `None` for age-boundary players (e.g. U19) per §9.1 — such
    /// masters are stored and ingested normally but excluded from ranking.
    pub fn from_age_gender(age_group: AgeGroup, gender: Gender) -> Option<Cohort> {
        if age_group.is_ranked() {
            Some(Cohort { age_group, gender })
        } else {
            None
        }
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.age_group, self.gender)
    }
}
