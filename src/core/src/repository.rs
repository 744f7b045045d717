//! Core domain data model (spec §3) and the storage/scraper boundary traits
//! (§6.1). Every component family that needs persistence talks to a
//! `Repository`; nothing in `core` knows how rows are actually stored.

use crate::ids::{AgeGroup, Cohort, Gender, MasterId, ProviderId};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMethod {
    DirectId,
    AliasByName,
    Fuzzy,
    ManualReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    Approved,
    Pending,
    Rejected,
}

/// Unique by `(provider_id, provider_team_id)`. `provider_team_id` may carry
/// semicolon-joined sub-ids folded together by a prior merge — callers
/// expand these themselves before keying a cache (§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub provider_id: ProviderId,
    pub provider_team_id: String,
    pub master_id: MasterId,
    pub match_method: MatchMethod,
    pub confidence: f64,
    pub review_status: ReviewStatus,
    /// The raw team name this alias was created from. Tier 2 of the
    /// matcher cascade (§4.5) looks this up case-insensitively, separately
    /// from the `(provider_id, provider_team_id)` primary key used by
    /// Tier 1 — the same alias row serves both lookup paths.
    pub raw_name: String,
}

/// Stable team identity. `(age_group, gender)` fixes the cohort;
/// `master_id` is immutable while `is_deprecated` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterTeam {
    pub master_id: MasterId,
    pub team_name: String,
    pub club_name: Option<String>,
    pub age_group: AgeGroup,
    pub gender: Gender,
    pub state_code: Option<String>,
    pub is_deprecated: bool,
}

/// Fields required to create a new `MasterTeam`; `master_id` is assigned by
/// the repository on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMasterTeam {
    pub team_name: String,
    pub club_name: Option<String>,
    pub age_group: AgeGroup,
    pub gender: Gender,
    pub state_code: Option<String>,
}

/// `game_uid = provider_code ":" date ":" min(t1,t2) ":" max(t1,t2)` —
/// scores excluded so both reporting perspectives of the same fixture
/// collapse to one uid (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub game_uid: String,
    pub provider_id: ProviderId,
    pub home_master_id: MasterId,
    pub away_master_id: MasterId,
    pub home_provider_id: String,
    pub away_provider_id: String,
    pub home_score: Option<u16>,
    pub away_score: Option<u16>,
    pub game_date: NaiveDate,
}

/// The second-level dedup key (§3): unique on `(provider_id,
/// home_provider_id, away_provider_id, game_date, home_score, away_score)`
/// with a sentinel for null scores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameCompositeKey {
    pub provider_id: ProviderId,
    pub home_provider_id: String,
    pub away_provider_id: String,
    pub game_date: NaiveDate,
    pub home_score: i32,
    pub away_score: i32,
}

/// Sentinel substituted for a null score when building a `GameCompositeKey`
/// (distinct from any representable score).
pub const NULL_SCORE_SENTINEL: i32 = -1;

impl GameCompositeKey {
    pub fn from_scores(
        provider_id: ProviderId,
        home_provider_id: String,
        away_provider_id: String,
        game_date: NaiveDate,
        home_score: Option<u16>,
        away_score: Option<u16>,
    ) -> Self {
        GameCompositeKey {
            provider_id,
            home_provider_id,
            away_provider_id,
            game_date,
            home_score: home_score.map(|s| s as i32).unwrap_or(NULL_SCORE_SENTINEL),
            away_score: away_score.map(|s| s as i32).unwrap_or(NULL_SCORE_SENTINEL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub provider_id: ProviderId,
    pub provider_team_id: String,
    pub raw_name: String,
    pub suggested_master_id: Option<MasterId>,
    pub confidence: f64,
    pub status: ReviewStatus,
}

/// A raw scraped record, pre-validation (§7: validated/normalized into a
/// `Game` by C7, or quarantined).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawGameRecord {
    pub provider_code: String,
    pub provider_id: ProviderId,
    pub home_provider_team_id: String,
    pub away_provider_team_id: String,
    pub home_team_name: String,
    pub away_team_name: String,
    pub home_club_name: Option<String>,
    pub away_club_name: Option<String>,
    pub state_code: Option<String>,
    pub raw_gender: String,
    pub raw_age: String,
    pub home_score: Option<String>,
    pub away_score: Option<String>,
    pub raw_game_date: String,
}

/// Per-cohort ranking output row (§3). Populated by C8; persisted wholesale
/// per ranking run via `Repository::replace_rankings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTeam {
    pub master_id: MasterId,
    pub team_name: String,
    pub cohort: Cohort,
    pub games_played: u32,
    pub offense_raw: f64,
    pub defense_raw: f64,
    pub offense_shrunk: f64,
    pub defense_shrunk: f64,
    pub offense_normalized: f64,
    pub defense_normalized: f64,
    pub sos_raw: f64,
    pub sos_normalized: f64,
    pub performance_delta: f64,
    pub provisional_multiplier: f64,
    pub anchor: f64,
    pub powerscore_core: f64,
    pub powerscore_adj: f64,
    pub powerscore_ml: Option<f64>,
    pub rank_in_cohort: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Storage boundary. A concrete implementation lives in the database crate;
/// `core` only ever depends on this trait.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn lookup_alias(
        &self,
        provider_id: ProviderId,
        provider_team_id: &str,
    ) -> Result<Option<MasterId>, RepositoryError>;
    async fn upsert_alias(&self, alias: Alias) -> Result<(), RepositoryError>;
    async fn create_master(&self, team: NewMasterTeam) -> Result<MasterId, RepositoryError>;
    async fn merge_master(&self, from: MasterId, into: MasterId) -> Result<(), RepositoryError>;
    async fn game_uid_exists(&self, uid: &str) -> Result<bool, RepositoryError>;
    async fn composite_key_exists(&self, key: &GameCompositeKey) -> Result<bool, RepositoryError>;
    async fn bulk_insert_games(&self, games: &[Game]) -> Result<BulkInsertReport, RepositoryError>;
    async fn games_in_window(&self, since: NaiveDate) -> Result<Vec<Game>, RepositoryError>;
    async fn all_masters(&self) -> Result<Vec<MasterTeam>, RepositoryError>;
    async fn replace_rankings(&self, cohort: Cohort, rows: Vec<RankedTeam>) -> Result<(), RepositoryError>;
    async fn enqueue_review(&self, entry: ReviewEntry) -> Result<(), RepositoryError>;
    async fn scan_approved_aliases(&self, page_size: usize) -> Result<Vec<Alias>, RepositoryError>;
    /// Re-binds the underlying storage client (§4.4, §4.7). Long-running
    /// ingestion and the alias cache both call this periodically to avoid
    /// long-lived connection degradation; a default no-op is provided for
    /// backends (e.g. pure in-memory ones) that hold no external handle.
    async fn refresh_handle(&self) {}
}

/// Scraper collaborator injected into C7. Returns a lazy iterator so the
/// orchestrator streams records in batches rather than materializing a
/// provider's entire result set up front (§9 "generators/lazy sequences").
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn pull(&self) -> Result<Box<dyn Iterator<Item = RawGameRecord> + Send>, crate::error::IngestError>;
}
