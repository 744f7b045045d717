//! squadgraph-database: a concrete, in-memory `core::Repository`
//! implementation. Mirrors the teacher's `Arc<RwLock<Option<SimulatorData>>>`
//! shape — one coarse `RwLock` guarding a set of plain tables — standing in
//! for the externally-described relational store (SPEC_FULL §2.1). No
//! seed-data loaders live here: unlike the teacher's static JSON-backed
//! football world, every row here is written by ingestion/matching at
//! runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, info};
use tokio::sync::RwLock;

use core::error::RepositoryError;
use core::ids::{Cohort, MasterId, ProviderId};
use core::repository::{
    Alias, BulkInsertReport, Game, GameCompositeKey, MasterTeam, NewMasterTeam, RankedTeam, Repository, ReviewEntry,
};

/// Keyed by `(provider_id, provider_team_id)`, matching the alias table's
/// natural key (§3).
type AliasKey = (ProviderId, String);

#[derive(Default)]
struct Tables {
    aliases: HashMap<AliasKey, Alias>,
    masters: HashMap<MasterId, MasterTeam>,
    games_by_uid: HashMap<String, Vec<Game>>,
    composite_keys: std::collections::HashSet<GameCompositeKey>,
    reviews: Vec<ReviewEntry>,
    rankings: HashMap<Cohort, Vec<RankedTeam>>,
}

/// In-memory stand-in for the relational store, behind the same trait every
/// matching/ingestion/ranking component already talks to. A single coarse
/// `RwLock` over the whole table set is simple and correct; `refresh_handle`
/// is a no-op since there's no external connection to re-bind.
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
    refresh_calls: AtomicU64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        InMemoryRepository {
            tables: RwLock::new(Tables::default()),
            refresh_calls: AtomicU64::new(0),
        }
    }

    /// Diagnostic counter exposed for the web crate's health endpoint.
    pub fn refresh_call_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        InMemoryRepository::new()
    }
}

fn expand_sub_ids(provider_team_id: &str) -> impl Iterator<Item = &str> {
    provider_team_id.split(';').map(str::trim).filter(|s| !s.is_empty())
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn lookup_alias(&self, provider_id: ProviderId, provider_team_id: &str) -> Result<Option<MasterId>, RepositoryError> {
        let guard = self.tables.read().await;
        Ok(guard.aliases.get(&(provider_id, provider_team_id.to_string())).map(|a| a.master_id))
    }

    async fn upsert_alias(&self, alias: Alias) -> Result<(), RepositoryError> {
        let mut guard = self.tables.write().await;
        for sub_id in expand_sub_ids(&alias.provider_team_id).map(str::to_string).collect::<Vec<_>>() {
            guard.aliases.insert((alias.provider_id, sub_id), alias.clone());
        }
        Ok(())
    }

    async fn create_master(&self, team: NewMasterTeam) -> Result<MasterId, RepositoryError> {
        let master_id = MasterId::new();
        let master = MasterTeam {
            master_id,
            team_name: team.team_name,
            club_name: team.club_name,
            age_group: team.age_group,
            gender: team.gender,
            state_code: team.state_code,
            is_deprecated: false,
        };
        let mut guard = self.tables.write().await;
        guard.masters.insert(master_id, master);
        debug!("database: created master {master_id}");
        Ok(master_id)
    }

    async fn merge_master(&self, from: MasterId, into: MasterId) -> Result<(), RepositoryError> {
        let mut guard = self.tables.write().await;
        if !guard.masters.contains_key(&into) {
            return Err(RepositoryError::Permanent {
                message: format!("merge target {into} does not exist"),
            });
        }
        if let Some(mut deprecated) = guard.masters.get(&from).cloned() {
            deprecated.is_deprecated = true;
            guard.masters.insert(from, deprecated);
        }
        for alias in guard.aliases.values_mut() {
            if alias.master_id == from {
                alias.master_id = into;
            }
        }
        info!("database: merged master {from} into {into}");
        Ok(())
    }

    async fn game_uid_exists(&self, uid: &str) -> Result<bool, RepositoryError> {
        let guard = self.tables.read().await;
        Ok(guard.games_by_uid.contains_key(uid))
    }

    async fn composite_key_exists(&self, key: &GameCompositeKey) -> Result<bool, RepositoryError> {
        let guard = self.tables.read().await;
        Ok(guard.composite_keys.contains(key))
    }

    async fn bulk_insert_games(&self, games: &[Game]) -> Result<BulkInsertReport, RepositoryError> {
        let mut guard = self.tables.write().await;
        let mut inserted = 0;
        let mut duplicates = 0;
        for game in games {
            let key = GameCompositeKey::from_scores(
                game.provider_id,
                game.home_provider_id.clone(),
                game.away_provider_id.clone(),
                game.game_date,
                game.home_score,
                game.away_score,
            );
            if guard.composite_keys.contains(&key) {
                duplicates += 1;
                continue;
            }
            guard.composite_keys.insert(key);
            guard.games_by_uid.entry(game.game_uid.clone()).or_default().push(game.clone());
            inserted += 1;
        }
        Ok(BulkInsertReport { inserted, duplicates })
    }

    async fn games_in_window(&self, since: NaiveDate) -> Result<Vec<Game>, RepositoryError> {
        let guard = self.tables.read().await;
        Ok(guard
            .games_by_uid
            .values()
            .flatten()
            .filter(|g| g.game_date >= since)
            .cloned()
            .collect())
    }

    async fn all_masters(&self) -> Result<Vec<MasterTeam>, RepositoryError> {
        let guard = self.tables.read().await;
        Ok(guard.masters.values().cloned().collect())
    }

    async fn replace_rankings(&self, cohort: Cohort, rows: Vec<RankedTeam>) -> Result<(), RepositoryError> {
        let mut guard = self.tables.write().await;
        guard.rankings.insert(cohort, rows);
        Ok(())
    }

    async fn enqueue_review(&self, entry: ReviewEntry) -> Result<(), RepositoryError> {
        let mut guard = self.tables.write().await;
        guard.reviews.push(entry);
        Ok(())
    }

    /// The whole in-memory alias table fits in a single page; `page_size`
    /// is accepted for signature parity with a real paginated backend but
    /// otherwise unused here.
    async fn scan_approved_aliases(&self, _page_size: usize) -> Result<Vec<Alias>, RepositoryError> {
        let guard = self.tables.read().await;
        Ok(guard
            .aliases
            .values()
            .filter(|a| a.review_status == core::repository::ReviewStatus::Approved)
            .cloned()
            .collect())
    }

    async fn refresh_handle(&self) {
        self.refresh_calls.fetch_add(1, Ordering::Relaxed);
        debug!("database: handle refresh acknowledged (no-op, in-memory store)");
    }
}

/// Read-only accessor used by the web crate for ranking queries, kept
/// outside the `Repository` trait since it isn't part of the write-side
/// ingestion/matching contract (§2.1 "thin read-only API").
impl InMemoryRepository {
    pub async fn rankings_for(&self, cohort: Cohort) -> Vec<RankedTeam> {
        self.tables.read().await.rankings.get(&cohort).cloned().unwrap_or_default()
    }

    pub async fn all_cohorts(&self) -> Vec<Cohort> {
        self.tables.read().await.rankings.keys().copied().collect()
    }

    pub async fn pending_review_entries(&self) -> Vec<ReviewEntry> {
        self.tables
            .read()
            .await
            .reviews
            .iter()
            .filter(|e| e.status == core::repository::ReviewStatus::Pending)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ids::{AgeGroup, Gender};

    fn new_master(name: &str) -> NewMasterTeam {
        NewMasterTeam {
            team_name: name.to_string(),
            club_name: None,
            age_group: AgeGroup::new(14),
            gender: Gender::Male,
            state_code: Some("TX".to_string()),
        }
    }

    #[tokio::test]
    async fn created_master_is_immediately_visible_via_all_masters() {
        let repo = InMemoryRepository::new();
        let id = repo.create_master(new_master("Dallas Hurricanes")).await.unwrap();
        let all = repo.all_masters().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].master_id, id);
    }

    #[tokio::test]
    async fn merge_deprecates_source_and_repoints_aliases() {
        let repo = InMemoryRepository::new();
        let from = repo.create_master(new_master("Dallas Hurricanes Blue")).await.unwrap();
        let into = repo.create_master(new_master("Dallas Hurricanes")).await.unwrap();

        let alias = Alias {
            provider_id: ProviderId(1),
            provider_team_id: "901".to_string(),
            master_id: from,
            match_method: core::repository::MatchMethod::ManualReview,
            confidence: 1.0,
            review_status: core::repository::ReviewStatus::Approved,
            raw_name: "Dallas Hurricanes Blue".to_string(),
        };
        repo.upsert_alias(alias).await.unwrap();
        repo.merge_master(from, into).await.unwrap();

        assert_eq!(repo.lookup_alias(ProviderId(1), "901").await.unwrap(), Some(into));
        let all = repo.all_masters().await.unwrap();
        let deprecated = all.iter().find(|m| m.master_id == from).unwrap();
        assert!(deprecated.is_deprecated);
    }

    #[tokio::test]
    async fn duplicate_composite_key_is_rejected_on_bulk_insert() {
        let repo = InMemoryRepository::new();
        let home = MasterId::new();
        let away = MasterId::new();
        let game = Game {
            game_uid: "gotsport:2025-03-15:100:200".to_string(),
            provider_id: ProviderId(1),
            home_master_id: home,
            away_master_id: away,
            home_provider_id: "100".to_string(),
            away_provider_id: "200".to_string(),
            home_score: Some(2),
            away_score: Some(1),
            game_date: NaiveDate::from_ymd_opt(2025, 3, 15).unwrap(),
        };

        let first = repo.bulk_insert_games(&[game.clone()]).await.unwrap();
        assert_eq!(first.inserted, 1);
        let second = repo.bulk_insert_games(&[game]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);
    }

    #[tokio::test]
    async fn refresh_handle_increments_the_diagnostic_counter() {
        let repo = InMemoryRepository::new();
        repo.refresh_handle().await;
        repo.refresh_handle().await;
        assert_eq!(repo.refresh_call_count(), 2);
    }
}
