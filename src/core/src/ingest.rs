//! C7 — Ingestion Orchestrator. Validates a raw scraper batch, dispatches
//! each side of a fixture through the C5 matcher, dedupes the resulting
//! neutral-form games via C6, and bulk-persists the survivors (§4.7).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use log::{info, warn};
use rand::Rng;
use rayon::prelude::*;

use crate::config::MatchingPolicy;
use crate::dedupe::{self, DedupOutcome, HomeAway, PerspectiveGame};
use crate::error::{IngestError, RepositoryError, ValidationError};
use crate::ids::{AgeGroup, Gender, MasterId, ProviderId};
use crate::matcher::{MatchOutcome, MatchRequest, ProviderMatchConfig, TeamMatcher};
use crate::repository::{Game, GameCompositeKey, RawGameRecord, Repository};

/// How many records trigger a storage-handle refresh (§4.4, §4.7).
const HANDLE_REFRESH_EVERY: u64 = 1000;
const MAX_RETRY_ATTEMPTS: u8 = 4;
const BASE_BACKOFF_MS: u64 = 50;

/// Per-run counters surfaced to the caller/logs (§7 "observable outcomes").
#[derive(Debug, Clone, Default)]
pub struct ImportMetrics {
    pub processed: u64,
    pub accepted: u64,
    pub quarantined: u64,
    pub duplicate_uid: u64,
    pub duplicate_composite: u64,
    pub matched: u64,
    pub partial: u64,
    pub failed_validation: u64,
    pub teams_created: u64,
    pub fuzzy_auto_approved: u64,
    pub fuzzy_queued_for_review: u64,
    pub batch_failures: u64,
    pub errors: Vec<String>,
}

impl ImportMetrics {
    fn merge(&mut self, other: ImportMetrics) {
        self.processed += other.processed;
        self.accepted += other.accepted;
        self.quarantined += other.quarantined;
        self.duplicate_uid += other.duplicate_uid;
        self.duplicate_composite += other.duplicate_composite;
        self.matched += other.matched;
        self.partial += other.partial;
        self.failed_validation += other.failed_validation;
        self.teams_created += other.teams_created;
        self.fuzzy_auto_approved += other.fuzzy_auto_approved;
        self.fuzzy_queued_for_review += other.fuzzy_queued_for_review;
        self.batch_failures += other.batch_failures;
        self.errors.extend(other.errors);
    }
}

/// A raw record that has passed field-level validation (§4.7 step 1):
/// dates parsed, scores numeric-or-absent, provider-team-ids non-empty,
/// gender recognized. Age is still a token pending the matcher's own
/// birth-year-to-U-age conversion (that needs `current_season_start_year`,
/// which is a per-run constant rather than a per-record one).
struct ValidatedRecord {
    raw: RawGameRecord,
    game_date: NaiveDate,
    gender: Gender,
    home_score: Option<u16>,
    away_score: Option<u16>,
}

fn parse_score(field: &'static str, raw: &Option<String>) -> Result<Option<u16>, ValidationError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s.trim().parse::<u16>().map(Some).map_err(|_| ValidationError::NonNumericScore {
            field,
            raw: s.clone(),
        }),
    }
}

fn parse_age_group(raw_age: &str, current_season_start_year: u16) -> Option<AgeGroup> {
    let trimmed = raw_age.trim();
    if let Some(stripped) = trimmed.strip_prefix(['u', 'U']) {
        if let Ok(u) = stripped.trim_start_matches('-').parse::<u8>() {
            let ag = AgeGroup::new(u);
            return ag.is_ranked().then_some(ag);
        }
    }
    if let Ok(year) = trimmed.parse::<u16>() {
        let year = if year < 100 {
            if year <= 18 { 2000 + year } else { 1900 + year }
        } else {
            year
        };
        let u = (current_season_start_year as i32 + 2) - year as i32;
        if (AgeGroup::MIN_RANKED as i32..=AgeGroup::MAX_RANKED as i32).contains(&u) {
            return Some(AgeGroup::new(u as u8));
        }
    }
    None
}

/// Step 1 of §4.7: per-record field validation. Pure and CPU-only so the
/// caller can fan a batch out across `rayon` before touching any `await`
/// point.
fn validate_record(raw: RawGameRecord) -> Result<ValidatedRecord, (RawGameRecord, ValidationError)> {
    let game_date = match NaiveDate::parse_from_str(&raw.raw_game_date, "%Y-%m-%d") {
        Ok(d) => d,
        Err(_) => return Err((raw.clone(), ValidationError::BadDate { raw: raw.raw_game_date.clone() })),
    };

    if raw.home_provider_team_id.trim().is_empty() || raw.away_provider_team_id.trim().is_empty() {
        return Err((
            raw.clone(),
            ValidationError::MissingProviderTeamId {
                provider_code: raw.provider_code.clone(),
            },
        ));
    }

    let gender = match Gender::parse(&raw.raw_gender) {
        Some(g) => g,
        None => {
            return Err((
                raw.clone(),
                ValidationError::UnrecognizedGender { raw: raw.raw_gender.clone() },
            ))
        }
    };

    let home_score = match parse_score("home_score", &raw.home_score) {
        Ok(s) => s,
        Err(e) => return Err((raw.clone(), e)),
    };
    let away_score = match parse_score("away_score", &raw.away_score) {
        Ok(s) => s,
        Err(e) => return Err((raw.clone(), e)),
    };

    Ok(ValidatedRecord {
        raw,
        game_date,
        gender,
        home_score,
        away_score,
    })
}

/// Sleeps with full jitter before a retry (§5, §7): `rand(0, base * 2^attempt)`.
async fn jittered_backoff(attempt: u8) {
    let ceiling = BASE_BACKOFF_MS * (1u64 << attempt.min(6));
    let millis = rand::thread_rng().gen_range(0..=ceiling);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

pub struct IngestOrchestrator<R: Repository> {
    pub repository: Arc<R>,
    pub matcher: Arc<TeamMatcher<R>>,
    pub current_season_start_year: u16,
    ops_since_refresh: std::sync::atomic::AtomicU64,
}

impl<R: Repository> IngestOrchestrator<R> {
    pub fn new(repository: Arc<R>, matcher: Arc<TeamMatcher<R>>, current_season_start_year: u16) -> Self {
        IngestOrchestrator {
            repository,
            matcher,
            current_season_start_year,
            ops_since_refresh: std::sync::atomic::AtomicU64::new(0),
        }
    }

    async fn note_processed(&self, n: u64) {
        let before = self.ops_since_refresh.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        if (before + n) / HANDLE_REFRESH_EVERY > before / HANDLE_REFRESH_EVERY {
            self.repository.refresh_handle().await;
        }
    }

    /// Runs one batch end to end: validate, match both sides, dedupe, and
    /// persist. Never returns early on a per-record problem — only a
    /// repository failure that survives the retry budget becomes a
    /// `BatchFailure`-worthy error (the caller decides whether to record
    /// and continue or abort the whole run).
    pub async fn ingest_batch(
        &self,
        records: Vec<RawGameRecord>,
        config: &ProviderMatchConfig,
        candidates: &[crate::repository::MasterTeam],
    ) -> Result<ImportMetrics, IngestError> {
        let mut metrics = ImportMetrics::default();
        metrics.processed = records.len() as u64;

        let (validated, quarantined): (Vec<_>, Vec<_>) =
            records.into_par_iter().map(validate_record).partition_map(|r| match r {
                Ok(v) => rayon::iter::Either::Left(v),
                Err(e) => rayon::iter::Either::Right(e),
            });

        metrics.quarantined += quarantined.len() as u64;
        metrics.failed_validation += quarantined.len() as u64;
        for (raw, err) in quarantined {
            metrics
                .errors
                .push(format!("quarantined {}/{}: {err}", raw.provider_code, raw.home_provider_team_id));
        }

        let mut perspective_games = Vec::with_capacity(validated.len());

        for v in validated {
            let Some(age_group) = parse_age_group(&v.raw.raw_age, self.current_season_start_year) else {
                metrics.quarantined += 1;
                metrics
                    .errors
                    .push(format!("quarantined {}: unresolvable age {:?}", v.raw.provider_code, v.raw.raw_age));
                continue;
            };

            let home_request = MatchRequest {
                provider_id: v.raw.provider_id,
                provider_team_id: Some(v.raw.home_provider_team_id.clone()),
                team_name: v.raw.home_team_name.clone(),
                age_group,
                gender: v.gender,
                club_name: v.raw.home_club_name.clone(),
                state_code: v.raw.state_code.clone(),
                current_season_start_year: self.current_season_start_year,
            };
            let away_request = MatchRequest {
                provider_id: v.raw.provider_id,
                provider_team_id: Some(v.raw.away_provider_team_id.clone()),
                team_name: v.raw.away_team_name.clone(),
                age_group,
                gender: v.gender,
                club_name: v.raw.away_club_name.clone(),
                state_code: v.raw.state_code.clone(),
                current_season_start_year: self.current_season_start_year,
            };

            let home_outcome = self.matcher.match_team(&home_request, config, candidates).await?;
            let away_outcome = self.matcher.match_team(&away_request, config, candidates).await?;

            self.tally_match_outcome(&mut metrics, &home_outcome);
            self.tally_match_outcome(&mut metrics, &away_outcome);

            match (resolved_master(&home_outcome), resolved_master(&away_outcome)) {
                (Some(home_id), Some(away_id)) => {
                    metrics.matched += 1;
                    perspective_games.push(PerspectiveGame {
                        provider_id: v.raw.provider_id,
                        provider_code: v.raw.provider_code.clone(),
                        team_master_id: home_id,
                        team_provider_id: v.raw.home_provider_team_id.clone(),
                        opponent_master_id: away_id,
                        opponent_provider_id: v.raw.away_provider_team_id.clone(),
                        home_away: HomeAway::Home,
                        goals_for: v.home_score,
                        goals_against: v.away_score,
                        game_date: v.game_date,
                    });
                }
                _ => {
                    // One or both sides landed in review/unmatched: the game
                    // can't be inserted with a concrete master id on both
                    // ends. It's recoverable once the pending review
                    // resolves, on a later ingestion pass.
                    metrics.partial += 1;
                }
            }
        }

        let games: Vec<Game> = perspective_games.iter().map(dedupe::to_neutral).collect();
        let outcome = self.dedupe_against_storage(games).await?;
        metrics.duplicate_uid += outcome.uid_duplicates as u64;
        metrics.duplicate_composite += outcome.composite_duplicates as u64;

        let inserted = self.bulk_insert_with_fallback(outcome.to_insert).await?;
        metrics.accepted += inserted as u64;

        self.note_processed(metrics.processed).await;

        info!(
            "ingest: batch processed={} accepted={} matched={} partial={} quarantined={}",
            metrics.processed, metrics.accepted, metrics.matched, metrics.partial, metrics.quarantined
        );

        Ok(metrics)
    }

    fn tally_match_outcome(&self, metrics: &mut ImportMetrics, outcome: &MatchOutcome) {
        match outcome {
            MatchOutcome::Created { .. } => metrics.teams_created += 1,
            MatchOutcome::Matched {
                method: crate::repository::MatchMethod::Fuzzy,
                ..
            } => metrics.fuzzy_auto_approved += 1,
            MatchOutcome::Review { .. } => metrics.fuzzy_queued_for_review += 1,
            _ => {}
        }
    }

    /// Bulk-checks each neutral game's uid/composite key against storage,
    /// then runs the in-memory two-level dedup of §4.6 against that
    /// snapshot.
    async fn dedupe_against_storage(&self, games: Vec<Game>) -> Result<DedupOutcome, RepositoryError> {
        let mut existing_uids = HashSet::new();
        let mut existing_keys = HashSet::new();

        for g in &games {
            if self.retry_transient(|| self.repository.game_uid_exists(&g.game_uid)).await? {
                existing_uids.insert(g.game_uid.clone());
            }
            let key = GameCompositeKey::from_scores(
                g.provider_id,
                g.home_provider_id.clone(),
                g.away_provider_id.clone(),
                g.game_date,
                g.home_score,
                g.away_score,
            );
            if self.retry_transient(|| self.repository.composite_key_exists(&key)).await? {
                existing_keys.insert(key);
            }
        }

        Ok(dedupe::dedupe_batch(games, &existing_uids, &existing_keys))
    }

    /// Bulk-inserts; on a conflict (another writer raced the same
    /// composite key between the check above and this insert) falls back
    /// to inserting rows one at a time so the rest of the batch still
    /// lands (§4.7 "duplicate-key fallback").
    async fn bulk_insert_with_fallback(&self, games: Vec<Game>) -> Result<usize, RepositoryError> {
        if games.is_empty() {
            return Ok(0);
        }

        match self.retry_transient(|| self.repository.bulk_insert_games(&games)).await {
            Ok(report) => Ok(report.inserted),
            Err(RepositoryError::Conflict { .. }) => {
                warn!("ingest: bulk insert conflicted, falling back to per-row insert for {} games", games.len());
                let mut inserted = 0;
                for g in games {
                    match self.retry_transient(|| self.repository.bulk_insert_games(std::slice::from_ref(&g))).await {
                        Ok(report) => inserted += report.inserted,
                        Err(RepositoryError::Conflict { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(inserted)
            }
            Err(e) => Err(e),
        }
    }

    /// Retries a repository call against `RepositoryError::Transient` with
    /// full-jitter exponential backoff, up to [`MAX_RETRY_ATTEMPTS`] (§5,
    /// §7). `Permanent`/`Conflict` propagate immediately.
    async fn retry_transient<T, F, Fut>(&self, mut call: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RepositoryError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(RepositoryError::Transient { .. }) if attempt < MAX_RETRY_ATTEMPTS => {
                    jittered_backoff(attempt).await;
                    attempt += 1;
                    self.repository.refresh_handle().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn resolved_master(outcome: &MatchOutcome) -> Option<MasterId> {
    match outcome {
        MatchOutcome::Matched { master_id, .. } => Some(*master_id),
        MatchOutcome::Created { master_id } => Some(*master_id),
        MatchOutcome::Review { .. } | MatchOutcome::Unmatched => None,
    }
}

/// Runs every batch the scraper yields, shrinking batch size and backing
/// off when a batch fails outright (§5 "shrink-and-backoff"), and
/// accumulating metrics across the whole run. `initial_batch_size` and
/// `max_concurrent_batches` bound CPU-side fan-out; repository calls
/// inside a single batch stay sequential so retries/backoff are simple to
/// reason about.
pub async fn run_full_ingest<R: Repository>(
    orchestrator: &IngestOrchestrator<R>,
    scraper: &dyn crate::repository::Scraper,
    policy: MatchingPolicy,
    initial_batch_size: usize,
) -> Result<ImportMetrics, IngestError> {
    let records_iter = scraper.pull().await?;
    let all: Vec<RawGameRecord> = records_iter.collect();
    let candidates = orchestrator.repository.all_masters().await?;
    let config: ProviderMatchConfig = policy.into();

    let mut total = ImportMetrics::default();
    let mut batch_size = initial_batch_size.max(1);
    let mut offset = 0;

    while offset < all.len() {
        let end = (offset + batch_size).min(all.len());
        let batch = all[offset..end].to_vec();

        match orchestrator.ingest_batch(batch, &config, &candidates).await {
            Ok(metrics) => {
                total.merge(metrics);
                offset = end;
            }
            Err(IngestError::Repository(RepositoryError::Transient { .. })) if batch_size > 1 => {
                // Shrink-and-backoff: halve the batch and retry the same
                // window rather than losing it.
                warn!("ingest: batch [{offset}, {end}) hit a transient error, shrinking batch size {batch_size} -> {}", batch_size / 2);
                batch_size = (batch_size / 2).max(1);
            }
            Err(e) => {
                total.batch_failures += 1;
                total.errors.push(format!("batch [{offset}, {end}) failed: {e}"));
                offset = end;
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias_cache::AliasCache;
    use crate::club::ClubRegistry;
    use crate::repository::*;
    use crate::review::ReviewQueue;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeRepo {
        masters: StdMutex<Vec<MasterTeam>>,
        aliases: StdMutex<Vec<Alias>>,
        games: StdMutex<Vec<Game>>,
        uids: StdMutex<HashSet<String>>,
        keys: StdMutex<HashSet<GameCompositeKey>>,
    }

    #[async_trait]
    impl Repository for FakeRepo {
        async fn lookup_alias(&self, _: ProviderId, _: &str) -> Result<Option<MasterId>, RepositoryError> {
            Ok(None)
        }
        async fn upsert_alias(&self, alias: Alias) -> Result<(), RepositoryError> {
            self.aliases.lock().unwrap().push(alias);
            Ok(())
        }
        async fn create_master(&self, team: NewMasterTeam) -> Result<MasterId, RepositoryError> {
            let master_id = MasterId::new();
            self.masters.lock().unwrap().push(MasterTeam {
                master_id,
                team_name: team.team_name,
                club_name: team.club_name,
                age_group: team.age_group,
                gender: team.gender,
                state_code: team.state_code,
                is_deprecated: false,
            });
            Ok(master_id)
        }
        async fn merge_master(&self, _: MasterId, _: MasterId) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn game_uid_exists(&self, uid: &str) -> Result<bool, RepositoryError> {
            Ok(self.uids.lock().unwrap().contains(uid))
        }
        async fn composite_key_exists(&self, key: &GameCompositeKey) -> Result<bool, RepositoryError> {
            Ok(self.keys.lock().unwrap().contains(key))
        }
        async fn bulk_insert_games(&self, games: &[Game]) -> Result<BulkInsertReport, RepositoryError> {
            let mut store = self.games.lock().unwrap();
            let mut uids = self.uids.lock().unwrap();
            let mut keys = self.keys.lock().unwrap();
            for g in games {
                uids.insert(g.game_uid.clone());
                keys.insert(GameCompositeKey::from_scores(
                    g.provider_id,
                    g.home_provider_id.clone(),
                    g.away_provider_id.clone(),
                    g.game_date,
                    g.home_score,
                    g.away_score,
                ));
                store.push(g.clone());
            }
            Ok(BulkInsertReport { inserted: games.len(), duplicates: 0 })
        }
        async fn games_in_window(&self, _: NaiveDate) -> Result<Vec<Game>, RepositoryError> {
            Ok(self.games.lock().unwrap().clone())
        }
        async fn all_masters(&self) -> Result<Vec<MasterTeam>, RepositoryError> {
            Ok(self.masters.lock().unwrap().clone())
        }
        async fn replace_rankings(&self, _: crate::ids::Cohort, _: Vec<RankedTeam>) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn enqueue_review(&self, _: ReviewEntry) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn scan_approved_aliases(&self, _: usize) -> Result<Vec<Alias>, RepositoryError> {
            Ok(self.aliases.lock().unwrap().clone())
        }
    }

    fn record(home: &str, away: &str, date: &str) -> RawGameRecord {
        RawGameRecord {
            provider_code: "gotsport".into(),
            provider_id: ProviderId(1),
            home_provider_team_id: format!("{home}-id"),
            away_provider_team_id: format!("{away}-id"),
            home_team_name: format!("{home} 2014 Blue Boys"),
            away_team_name: format!("{away} 2014 Blue Boys"),
            home_club_name: Some(home.to_string()),
            away_club_name: Some(away.to_string()),
            state_code: Some("TX".to_string()),
            raw_gender: "Boys".to_string(),
            raw_age: "2014".to_string(),
            home_score: Some("2".to_string()),
            away_score: Some("1".to_string()),
            raw_game_date: date.to_string(),
        }
    }

    async fn harness() -> (IngestOrchestrator<FakeRepo>, Arc<FakeRepo>) {
        let repo = Arc::new(FakeRepo::default());
        let cache = Arc::new(AliasCache::load(Arc::clone(&repo), 100, 1000).await.unwrap());
        let registry = Arc::new(ClubRegistry::new());
        let queue = Arc::new(ReviewQueue::new(Arc::clone(&repo)));
        let matcher = Arc::new(TeamMatcher::new(cache, registry, queue, Arc::clone(&repo)));
        (IngestOrchestrator::new(Arc::clone(&repo), matcher, 2025), repo)
    }

    #[tokio::test]
    async fn fresh_batch_creates_both_teams_and_inserts_one_game() {
        let (orchestrator, repo) = harness().await;
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let records = vec![record("Dallas Hurricanes", "Texans SC", "2025-03-15")];

        let metrics = orchestrator.ingest_batch(records, &config, &[]).await.unwrap();
        assert_eq!(metrics.matched, 1);
        assert_eq!(metrics.accepted, 1);
        assert_eq!(repo.games.lock().unwrap().len(), 1);
        assert_eq!(metrics.teams_created, 2);
    }

    #[tokio::test]
    async fn bad_date_is_quarantined_without_aborting_the_batch() {
        let (orchestrator, _repo) = harness().await;
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let mut bad = record("Dallas Hurricanes", "Texans SC", "not-a-date");
        bad.raw_game_date = "03/15/2025".into();
        let good = record("Dallas Hurricanes", "Texans SC", "2025-03-16");

        let metrics = orchestrator.ingest_batch(vec![bad, good], &config, &[]).await.unwrap();
        assert_eq!(metrics.quarantined, 1);
        assert_eq!(metrics.matched, 1);
    }

    #[tokio::test]
    async fn rerunning_the_same_fixture_is_deduped_against_storage() {
        let (orchestrator, repo) = harness().await;
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let records = vec![record("Dallas Hurricanes", "Texans SC", "2025-03-15")];

        orchestrator.ingest_batch(records.clone(), &config, &[]).await.unwrap();
        let candidates = repo.all_masters().await.unwrap();
        let metrics = orchestrator.ingest_batch(records, &config, &candidates).await.unwrap();

        assert_eq!(metrics.accepted, 0, "identical fixture replayed must not duplicate storage");
        assert_eq!(repo.games.lock().unwrap().len(), 1);
    }
}
