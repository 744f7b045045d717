//! squadgraph-core: the team-identity resolution and ranking domain logic
//! (components C1-C9). Pure domain code plus the `Repository`/`Scraper`
//! trait boundary; no concrete I/O lives here (see `squadgraph-database`).

pub mod alias_cache;
pub mod club;
pub mod config;
pub mod dedupe;
pub mod distinction;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod matcher;
pub mod normalize;
pub mod ranking;
pub mod repository;
pub mod review;
pub mod textsim;
pub mod vocab;

pub use alias_cache::AliasCache;
pub use config::{MatchingPolicy, RankingConfig};
pub use ids::{AgeGroup, Cohort, Gender, MasterId, ProviderId};
pub use matcher::{MatchOutcome, MatchRequest, TeamMatcher};
pub use ranking::{run_ranking_for_all_cohorts, RankingEngine, RankingOutcome};
pub use repository::{Alias, Game, MasterTeam, RankedTeam, Repository, ReviewEntry, Scraper};
pub use review::ReviewQueue;
