use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use core::alias_cache::AliasCache;
use core::club::ClubRegistry;
use core::ingest::IngestOrchestrator;
use core::matcher::TeamMatcher;
use core::review::ReviewQueue;
use core::{run_ranking_for_all_cohorts, MatchingPolicy, RankingConfig};
use database::InMemoryRepository;
use env_logger::Env;
use log::{error, info, warn};
use web::RankingServer;

/// How often the ranking job re-runs once the server is up. Not one of the
/// §6 enumerated matching/ranking knobs — purely an operational schedule,
/// so it gets its own variable rather than overloading one of those.
const RANKING_JOB_INTERVAL_SECS: u64 = 6 * 60 * 60;
const ALIAS_CACHE_PAGE_SIZE: usize = 500;
const CURRENT_SEASON_START_YEAR: u16 = 2025;

#[tokio::main]
async fn main() -> ExitCode {
    color_eyre::install().unwrap();

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // §7 FatalConfigError: an invalid enumerated config value aborts the
    // process before any ingestion or ranking work begins.
    let ranking_config = match RankingConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("fatal config error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let matching_policy = match MatchingPolicy::from_env().and_then(|p| {
        p.validate()?;
        Ok(p)
    }) {
        Ok(p) => p,
        Err(e) => {
            error!("fatal config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let repository = Arc::new(InMemoryRepository::new());

    let alias_cache = match AliasCache::load(
        repository.clone(),
        ALIAS_CACHE_PAGE_SIZE,
        matching_policy.connection_refresh_interval,
    )
    .await
    {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!("failed to preload alias cache: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The club registry is seeded from an external club-roster source
    // (out of scope per §1 "external collaborators"); it starts empty and
    // club names fall back to C3's normalized-form/confidence-0.8 path
    // until a loader registers known variants.
    let club_registry = Arc::new(ClubRegistry::new());
    let review_queue = Arc::new(ReviewQueue::new(repository.clone()));

    let matcher = Arc::new(TeamMatcher::new(
        alias_cache,
        club_registry,
        review_queue,
        repository.clone(),
    ));
    // No concrete `Scraper` ships in this crate (§1: site-specific scrapers
    // are an out-of-scope external collaborator) — the orchestrator is
    // wired here so the object graph is ready the moment one is injected,
    // via `run_full_ingest(&_orchestrator, scraper, policy, batch_size)`.
    let _orchestrator = Arc::new(IngestOrchestrator::new(
        repository.clone(),
        matcher,
        CURRENT_SEASON_START_YEAR,
    ));

    info!("squadgraph core online: alias cache preloaded, matcher and ingest orchestrator wired");

    let is_one_shot = std::env::var("MODE") == Ok(String::from("ONESHOT"));

    if is_one_shot {
        // One-shot mode runs a single ranking pass against whatever is
        // already in the repository and exits — useful for a cron-style
        // deployment that doesn't want a resident server.
        info!("one-shot ranking run started");
        let as_of = Utc::now().date_naive();
        return match run_ranking_for_all_cohorts(repository.as_ref(), &ranking_config, as_of).await {
            Ok(outcomes) => {
                info!("one-shot ranking run complete: {} cohort(s) ranked", outcomes.len());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("one-shot ranking run failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    // Ranking is otherwise a standalone periodic job (§5): it reads a
    // consistent snapshot of masters/games and replaces rankings per
    // cohort in its own transaction, independent of any in-flight
    // ingestion batch.
    let ranking_repository = repository.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(RANKING_JOB_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let as_of = Utc::now().date_naive();
            match run_ranking_for_all_cohorts(ranking_repository.as_ref(), &ranking_config, as_of).await {
                Ok(outcomes) => {
                    let unconverged = outcomes.iter().filter(|o| !o.converged).count();
                    if unconverged > 0 {
                        warn!("ranking run: {unconverged} cohort(s) emitted RankingConvergenceWarning");
                    }
                    info!("ranking run: {} cohort(s) refreshed", outcomes.len());
                }
                Err(e) => error!("ranking run failed, previous snapshot retained: {e}"),
            }
        }
    });

    let port: u16 = std::env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8080);
    RankingServer::new(repository, port).run().await;

    ExitCode::SUCCESS
}
