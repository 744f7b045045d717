//! C9 — Review Queue. Append-only per `(provider_id, provider_team_id)`
//! with last-write-wins on status (§4.9, "State Machines"). Holds pending
//! `ReviewEntry` rows in memory alongside the repository copy so C5/C7 can
//! requeue or resolve them without a round trip for every lookup.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio::sync::RwLock;

use crate::alias_cache::AliasCache;
use crate::error::RepositoryError;
use crate::ids::{MasterId, ProviderId};
use crate::repository::{Alias, MatchMethod, Repository, ReviewEntry, ReviewStatus};

type QueueKey = (ProviderId, String);

/// In-memory mirror of the pending review rows, backed by the repository.
pub struct ReviewQueue<R: Repository> {
    repository: Arc<R>,
    pending: RwLock<HashMap<QueueKey, ReviewEntry>>,
}

impl<R: Repository> ReviewQueue<R> {
    pub fn new(repository: Arc<R>) -> Self {
        ReviewQueue {
            repository,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Records a new or updated entry (last-write-wins on `status`, per the
    /// alias state machine in §4.9).
    pub async fn submit(&self, entry: ReviewEntry) -> Result<(), RepositoryError> {
        self.repository.enqueue_review(entry.clone()).await?;
        let key = (entry.provider_id, entry.provider_team_id.clone());
        self.pending.write().await.insert(key, entry);
        Ok(())
    }

    /// Approves a pending entry against `master_id`, creating an approved
    /// alias through `alias_cache` so the matcher picks it up on the very
    /// next lookup (§4.9: `approve(entry, master_id) -> alias created`).
    pub async fn approve(
        &self,
        provider_id: ProviderId,
        provider_team_id: &str,
        master_id: MasterId,
        alias_cache: &AliasCache<R>,
    ) -> Result<(), RepositoryError> {
        let key = (provider_id, provider_team_id.to_string());
        let mut guard = self.pending.write().await;
        if let Some(entry) = guard.get_mut(&key) {
            entry.status = ReviewStatus::Approved;
            entry.suggested_master_id = Some(master_id);
        }
        drop(guard);

        let raw_name = self
            .pending
            .read()
            .await
            .get(&key)
            .map(|e| e.raw_name.clone())
            .unwrap_or_default();
        let alias = Alias {
            provider_id,
            provider_team_id: provider_team_id.to_string(),
            master_id,
            match_method: MatchMethod::ManualReview,
            confidence: 1.0,
            review_status: ReviewStatus::Approved,
            raw_name,
        };
        alias_cache.upsert(alias).await?;
        info!("review entry approved: provider={provider_id} team={provider_team_id} -> master={master_id}");
        Ok(())
    }

    pub async fn reject(&self, provider_id: ProviderId, provider_team_id: &str) -> Result<(), RepositoryError> {
        let key = (provider_id, provider_team_id.to_string());
        let mut guard = self.pending.write().await;
        let Some(entry) = guard.get_mut(&key) else {
            return Ok(());
        };
        entry.status = ReviewStatus::Rejected;
        let entry = entry.clone();
        drop(guard);
        self.repository.enqueue_review(entry).await
    }

    /// Puts an entry back to `pending` (e.g. after a merge changed what it
    /// might now resolve to, §4.9).
    pub async fn requeue(&self, provider_id: ProviderId, provider_team_id: &str) -> Result<(), RepositoryError> {
        let key = (provider_id, provider_team_id.to_string());
        let mut guard = self.pending.write().await;
        if let Some(entry) = guard.get_mut(&key) {
            entry.status = ReviewStatus::Pending;
            let entry = entry.clone();
            drop(guard);
            return self.repository.enqueue_review(entry).await;
        }
        Ok(())
    }

    pub async fn pending_entries(&self) -> Vec<ReviewEntry> {
        self.pending
            .read()
            .await
            .values()
            .filter(|e| e.status == ReviewStatus::Pending)
            .cloned()
            .collect()
    }

    /// Re-queues every pending entry that suggested `merged_from`, pointing
    /// the suggestion at the surviving master instead (§4.9: "re-matching
    /// against the queue may be triggered after a merge/create in C5").
    pub async fn retarget_after_merge(&self, merged_from: MasterId, surviving: MasterId) {
        let mut guard = self.pending.write().await;
        for entry in guard.values_mut() {
            if entry.suggested_master_id == Some(merged_from) {
                entry.suggested_master_id = Some(surviving);
            }
        }
    }
}
