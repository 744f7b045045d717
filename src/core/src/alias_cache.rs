//! C4 — Alias Store & Cache. A process-wide, preloaded in-memory mirror of
//! the approved alias rows, injected into the matcher (§4.4, §9 "global
//! mutable state"). All writes go through this narrow interface, which also
//! persists to the repository, so a fresh process always reseeds from
//! storage rather than trusting stale local state.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use tokio::sync::{Mutex, RwLock};

use crate::error::RepositoryError;
use crate::ids::{MasterId, ProviderId};
use crate::repository::{Alias, MatchMethod, Repository, ReviewStatus};

/// Fuzzy-matched aliases never reach full confidence; 1.0 is reserved for
/// direct provider-id matches (§4.4).
pub const FUZZY_CONFIDENCE_CEILING: f64 = 0.99;

type CacheKey = (ProviderId, String);
type NameKey = (ProviderId, String);

struct CacheInner {
    entries: HashMap<CacheKey, MasterId>,
    /// Secondary index over `(provider_id, lowercased raw_name)`, serving
    /// Tier 2 of the matcher cascade (§4.5). A name can map to more than
    /// one master across different sibling teams sharing a club name, so
    /// each bucket carries every `(master_id, confidence)` pair on file.
    by_name: HashMap<NameKey, Vec<(MasterId, f64)>>,
}

/// Expands a possibly semicolon-joined `provider_team_id` into the set of
/// keys a single alias row should resolve under (§3, §4.4): a prior merge
/// can fold several provider-side ids into one alias row.
fn expand_sub_ids(provider_team_id: &str) -> impl Iterator<Item = String> + '_ {
    provider_team_id
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Reader/writer alias cache with per-master write serialization (§4.4,
/// §5). Readers take the shared `RwLock` read guard; a writer additionally
/// holds a per-`master_id` `Mutex` for the duration of its upsert so two
/// concurrent writers touching different masters never block each other.
pub struct AliasCache<R: Repository> {
    repository: Arc<R>,
    inner: RwLock<CacheInner>,
    master_locks: RwLock<HashMap<MasterId, Arc<Mutex<()>>>>,
    refresh_interval: u64,
    ops_since_refresh: std::sync::atomic::AtomicU64,
}

impl<R: Repository> AliasCache<R> {
    /// Preloads the cache via a paginated scan of approved alias rows
    /// (§4.4). `refresh_interval` controls how often `note_operation` logs
    /// a handle-refresh warning (see `refresh_handle`).
    pub async fn load(repository: Arc<R>, page_size: usize, refresh_interval: u64) -> Result<Self, RepositoryError> {
        let rows = repository.scan_approved_aliases(page_size).await?;
        let mut entries = HashMap::with_capacity(rows.len() * 2);
        let mut by_name: HashMap<NameKey, Vec<(MasterId, f64)>> = HashMap::new();
        for alias in rows {
            for key in expand_sub_ids(&alias.provider_team_id) {
                entries.insert((alias.provider_id, key), alias.master_id);
            }
            if !alias.raw_name.trim().is_empty() {
                let name_key = (alias.provider_id, alias.raw_name.to_ascii_lowercase());
                by_name.entry(name_key).or_default().push((alias.master_id, alias.confidence));
            }
        }
        Ok(AliasCache {
            repository,
            inner: RwLock::new(CacheInner { entries, by_name }),
            master_locks: RwLock::new(HashMap::new()),
            refresh_interval,
            ops_since_refresh: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub async fn lookup(&self, provider_id: ProviderId, provider_team_id: &str) -> Option<MasterId> {
        let guard = self.inner.read().await;
        guard.entries.get(&(provider_id, provider_team_id.to_string())).copied()
    }

    /// Tier 2 (§4.5): case-insensitive lookup on the raw name, scoped to a
    /// provider. Returns every `(master_id, confidence)` candidate on file;
    /// the caller applies the gender/age filter and the `>= 0.90` accept
    /// threshold, since the cache itself holds no cohort information.
    pub async fn lookup_by_name(&self, provider_id: ProviderId, raw_name: &str) -> Vec<(MasterId, f64)> {
        let guard = self.inner.read().await;
        guard
            .by_name
            .get(&(provider_id, raw_name.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_default()
    }

    async fn lock_for(&self, master_id: MasterId) -> Arc<Mutex<()>> {
        {
            let guard = self.master_locks.read().await;
            if let Some(lock) = guard.get(&master_id) {
                return Arc::clone(lock);
            }
        }
        let mut guard = self.master_locks.write().await;
        Arc::clone(guard.entry(master_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Idempotent upsert. Fuzzy-matched confidence is capped at
    /// [`FUZZY_CONFIDENCE_CEILING`]; direct-id matches are the only source
    /// of `confidence == 1.0` (§4.4).
    pub async fn upsert(&self, mut alias: Alias) -> Result<(), RepositoryError> {
        if alias.match_method != MatchMethod::DirectId {
            alias.confidence = alias.confidence.min(FUZZY_CONFIDENCE_CEILING);
        }

        let per_master_lock = self.lock_for(alias.master_id).await;
        let _guard = per_master_lock.lock().await;

        self.repository.upsert_alias(alias.clone()).await?;

        if alias.review_status == ReviewStatus::Approved {
            let mut cache = self.inner.write().await;
            for key in expand_sub_ids(&alias.provider_team_id) {
                cache.entries.insert((alias.provider_id, key), alias.master_id);
            }
            if !alias.raw_name.trim().is_empty() {
                let name_key = (alias.provider_id, alias.raw_name.to_ascii_lowercase());
                let bucket = cache.by_name.entry(name_key).or_default();
                if let Some(existing) = bucket.iter_mut().find(|(m, _)| *m == alias.master_id) {
                    existing.1 = alias.confidence;
                } else {
                    bucket.push((alias.master_id, alias.confidence));
                }
            }
        }

        self.note_operation().await;
        Ok(())
    }

    /// Drops every cache entry pointing at `master_id` (§4.4: invalidate on
    /// merge). The repository row itself is updated by the caller via
    /// `merge_master`; this only keeps the in-memory mirror consistent.
    pub async fn invalidate(&self, master_id: MasterId) {
        let mut cache = self.inner.write().await;
        cache.entries.retain(|_, v| *v != master_id);
        cache.by_name.retain(|_, v| {
            v.retain(|(m, _)| *m != master_id);
            !v.is_empty()
        });
    }

    /// Re-points every cache entry from `master_id` to `into`, used
    /// alongside `invalidate` when a merge needs historical lookups to keep
    /// resolving (rather than dropping them outright).
    pub async fn repoint(&self, from: MasterId, into: MasterId) {
        let mut cache = self.inner.write().await;
        for v in cache.entries.values_mut() {
            if *v == from {
                *v = into;
            }
        }
    }

    async fn note_operation(&self) {
        let n = self
            .ops_since_refresh
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        if n % self.refresh_interval == 0 {
            self.refresh_handle().await;
        }
    }

    /// Re-binds the underlying storage client every N operations to avoid
    /// long-lived connection degradation (§4.4). The in-memory entry map is
    /// untouched — only the repository's own handle is asked to refresh.
    pub async fn refresh_handle(&self) {
        warn!("alias cache refreshing storage handle after {} operations", self.refresh_interval);
        self.repository.refresh_handle().await;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeRepo {
        aliases: StdMutex<Vec<Alias>>,
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
        async fn create_master(&self, _: NewMasterTeam) -> Result<MasterId, RepositoryError> {
            Ok(MasterId::new())
        }
        async fn merge_master(&self, _: MasterId, _: MasterId) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn game_uid_exists(&self, _: &str) -> Result<bool, RepositoryError> {
            Ok(false)
        }
        async fn composite_key_exists(&self, _: &GameCompositeKey) -> Result<bool, RepositoryError> {
            Ok(false)
        }
        async fn bulk_insert_games(&self, games: &[Game]) -> Result<BulkInsertReport, RepositoryError> {
            Ok(BulkInsertReport { inserted: games.len(), duplicates: 0 })
        }
        async fn games_in_window(&self, _: NaiveDate) -> Result<Vec<Game>, RepositoryError> {
            Ok(vec![])
        }
        async fn all_masters(&self) -> Result<Vec<MasterTeam>, RepositoryError> {
            Ok(vec![])
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
        async fn refresh_handle(&self) {}
    }

    fn sample_alias(master: MasterId, tid: &str) -> Alias {
        Alias {
            provider_id: ProviderId(1),
            provider_team_id: tid.to_string(),
            master_id: master,
            match_method: MatchMethod::Fuzzy,
            confidence: 1.0,
            review_status: ReviewStatus::Approved,
            raw_name: "FC Dallas 2014 Blue".to_string(),
        }
    }

    #[tokio::test]
    async fn expands_semicolon_joined_sub_ids_into_multiple_cache_keys() {
        let repo = Arc::new(FakeRepo::default());
        let master = MasterId::new();
        repo.upsert_alias(sample_alias(master, "111;222")).await.unwrap();

        let cache = AliasCache::load(repo, 100, 1000).await.unwrap();
        assert_eq!(cache.lookup(ProviderId(1), "111").await, Some(master));
        assert_eq!(cache.lookup(ProviderId(1), "222").await, Some(master));
    }

    #[tokio::test]
    async fn fuzzy_confidence_is_capped_below_one() {
        let repo = Arc::new(FakeRepo::default());
        let master = MasterId::new();
        let cache = AliasCache::load(Arc::clone(&repo), 100, 1000).await.unwrap();

        let mut alias = sample_alias(master, "900");
        alias.confidence = 1.0;
        cache.upsert(alias).await.unwrap();

        let stored = repo.aliases.lock().unwrap().clone();
        assert_eq!(stored.last().unwrap().confidence, FUZZY_CONFIDENCE_CEILING);
    }

    #[tokio::test]
    async fn invalidate_drops_all_entries_for_a_master() {
        let repo = Arc::new(FakeRepo::default());
        let master = MasterId::new();
        repo.upsert_alias(sample_alias(master, "1;2;3")).await.unwrap();
        let cache = AliasCache::load(repo, 100, 1000).await.unwrap();

        assert_eq!(cache.len().await, 3);
        cache.invalidate(master).await;
        assert_eq!(cache.len().await, 0);
    }
}
