//! C5 — Team Matcher. The three-tier matching cascade with provider policy
//! (§4.5). Depends on C1 (normalize), C2 (distinction), C3 (club
//! canonicalization) and C4 (alias cache); creates review entries via C9.

use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;

use crate::alias_cache::AliasCache;
use crate::club::ClubRegistry;
use crate::config::MatchingPolicy;
use crate::distinction::{self, Distinction};
use crate::error::RepositoryError;
use crate::ids::{AgeGroup, Gender, MasterId, ProviderId};
use crate::normalize;
use crate::repository::{Alias, MasterTeam, MatchMethod, NewMasterTeam, Repository, ReviewEntry, ReviewStatus};
use crate::review::ReviewQueue;
use crate::textsim;

/// Inputs to a single matching attempt (§4.5).
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub provider_id: ProviderId,
    pub provider_team_id: Option<String>,
    pub team_name: String,
    pub age_group: AgeGroup,
    pub gender: Gender,
    pub club_name: Option<String>,
    pub state_code: Option<String>,
    /// The birth-year-to-U-age season anchor used when `strict_age_on_id`
    /// needs to parse age back out of the raw name (§4.1, §4.7).
    pub current_season_start_year: u16,
}

/// Marks which league/tier membership a team carries, derived from the
/// league markers stripped during normalization (§4.1 step 2). Used by the
/// scoring formula's `league_match_bonus`/`league_mismatch_penalty` terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeagueMembership(pub Vec<String>);

fn extract_league_membership(raw_name: &str) -> LeagueMembership {
    let lowered = raw_name.to_ascii_lowercase();
    let mut found = Vec::new();
    for marker in crate::vocab::LEAGUE_MARKERS {
        if lowered.contains(marker) {
            found.push((*marker).to_string());
        }
    }
    LeagueMembership(found)
}

/// A post-match gate: re-verifies something about the selected candidate
/// after scoring, rejecting even a high-scoring match (§4.5, "the most
/// dangerous merge"). Boxed so provider policies can carry
/// provider-specific predicates without a trait hierarchy per provider
/// (§9: "do not express via subtype hierarchy").
pub type PostMatchGate = Arc<dyn Fn(&MatchRequest, &MasterTeam) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ProviderMatchConfig {
    pub policy: MatchingPolicy,
    pub post_match_gates: Vec<PostMatchGate>,
}

impl std::fmt::Debug for ProviderMatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMatchConfig")
            .field("policy", &self.policy)
            .field("post_match_gates", &self.post_match_gates.len())
            .finish()
    }
}

impl From<MatchingPolicy> for ProviderMatchConfig {
    fn from(policy: MatchingPolicy) -> Self {
        ProviderMatchConfig {
            policy,
            post_match_gates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Matched an existing master; an alias was written (or already existed
    /// for Tier 1/2).
    Matched {
        master_id: MasterId,
        method: MatchMethod,
        confidence: f64,
    },
    /// A brand-new master was created and an approved alias attached
    /// (low-score path with `may_create_team`).
    Created { master_id: MasterId },
    /// Score fell in the review band; a `ReviewEntry` was queued.
    Review {
        suggested_master_id: Option<MasterId>,
        confidence: f64,
    },
    /// No candidate, no creation rights: queued without a suggestion.
    Unmatched,
}

struct Candidate<'a> {
    master: &'a MasterTeam,
    club_match: crate::club::ClubMatch,
    distinction: Option<Distinction>,
    league: LeagueMembership,
}

pub struct TeamMatcher<R: Repository> {
    pub alias_cache: Arc<AliasCache<R>>,
    pub club_registry: Arc<ClubRegistry>,
    pub review_queue: Arc<ReviewQueue<R>>,
    pub repository: Arc<R>,
}

impl<R: Repository> TeamMatcher<R> {
    pub fn new(
        alias_cache: Arc<AliasCache<R>>,
        club_registry: Arc<ClubRegistry>,
        review_queue: Arc<ReviewQueue<R>>,
        repository: Arc<R>,
    ) -> Self {
        TeamMatcher {
            alias_cache,
            club_registry,
            review_queue,
            repository,
        }
    }

    /// Runs the full three-tier cascade. `candidates` is the pool this
    /// request may match against — callers typically pass every
    /// non-deprecated master (Tier 3's gates do the cohort/club/variant
    /// narrowing internally; Tier 1/2 look a specific master up directly).
    pub async fn match_team(
        &self,
        request: &MatchRequest,
        config: &ProviderMatchConfig,
        candidates: &[MasterTeam],
    ) -> Result<MatchOutcome, RepositoryError> {
        if let Some(outcome) = self.tier1_direct_id(request, config, candidates).await? {
            debug!("matcher: tier1 direct_id hit for provider={} team={:?}", request.provider_id, request.provider_team_id);
            return Ok(outcome);
        }

        if let Some(outcome) = self.tier2_alias_by_name(request, candidates).await {
            debug!("matcher: tier2 alias_by_name hit for provider={}", request.provider_id);
            return Ok(outcome);
        }

        let outcome = self.tier3_fuzzy(request, config, candidates).await?;
        debug!("matcher: tier3 fuzzy outcome={:?} for provider={}", outcome, request.provider_id);
        Ok(outcome)
    }

    async fn tier1_direct_id(
        &self,
        request: &MatchRequest,
        config: &ProviderMatchConfig,
        candidates: &[MasterTeam],
    ) -> Result<Option<MatchOutcome>, RepositoryError> {
        let Some(tid) = &request.provider_team_id else {
            return Ok(None);
        };

        let Some(master_id) = self.alias_cache.lookup(request.provider_id, tid).await else {
            return Ok(None);
        };

        let Some(master) = candidates.iter().find(|m| m.master_id == master_id) else {
            // Master isn't in the supplied pool (e.g. deprecated or outside
            // the caller's candidate window) — fall through to Tier 2/3
            // rather than trusting a stale id blindly.
            return Ok(None);
        };

        if master.gender != request.gender {
            return Ok(None);
        }

        if config.policy.strict_age_on_id {
            let normalized = normalize::normalize(&request.team_name).ok();
            let parsed_age = normalized
                .and_then(|n| n.age)
                .and_then(|a| a.as_u_age(request.current_season_start_year));
            if let Some(parsed) = parsed_age {
                if parsed != master.age_group {
                    return Ok(None);
                }
            }
        }

        Ok(Some(MatchOutcome::Matched {
            master_id,
            method: MatchMethod::DirectId,
            confidence: 1.0,
        }))
    }

    async fn tier2_alias_by_name(&self, request: &MatchRequest, candidates: &[MasterTeam]) -> Option<MatchOutcome> {
        let hits = self.alias_cache.lookup_by_name(request.provider_id, &request.team_name).await;
        hits.into_iter()
            .filter(|(_, confidence)| *confidence >= 0.90)
            .find_map(|(master_id, confidence)| {
                let master = candidates.iter().find(|m| m.master_id == master_id)?;
                if master.gender != request.gender {
                    return None;
                }
                if master.age_group != request.age_group {
                    return None;
                }
                Some(MatchOutcome::Matched {
                    master_id,
                    method: MatchMethod::AliasByName,
                    confidence,
                })
            })
    }

    async fn tier3_fuzzy(
        &self,
        request: &MatchRequest,
        config: &ProviderMatchConfig,
        candidates: &[MasterTeam],
    ) -> Result<MatchOutcome, RepositoryError> {
        let request_distinction = distinction::extract(&request.team_name).ok();
        let request_normalized = normalize::normalize(&request.team_name).ok();
        let request_club = request.club_name.as_ref().map(|c| self.club_registry.canonicalize(c));
        let request_league = extract_league_membership(&request.team_name);

        // Gate 1: club filter. Restrict to (age_group, gender), and, if
        // both clubs resolve, matching canonical clubs. Falls back to a
        // broader scan only if club extraction fails for the incoming
        // request — never merely because the filtered set came up empty.
        // `pre_filter_state` additionally restricts the pool to the
        // request's state when the policy asks for it and the request
        // actually carries one (§6 "Restrict candidates to a state").
        let cohort_pool: Vec<&MasterTeam> = candidates
            .iter()
            .filter(|m| !m.is_deprecated && m.age_group == request.age_group && m.gender == request.gender)
            .filter(|m| {
                !config.policy.pre_filter_state
                    || request.state_code.is_none()
                    || m.state_code.as_deref() == request.state_code.as_deref()
            })
            .collect();

        let club_filtered: Vec<Candidate> = cohort_pool
            .iter()
            .filter_map(|&m| {
                let club_match = m
                    .club_name
                    .as_ref()
                    .map(|c| self.club_registry.canonicalize(c))
                    .unwrap_or(crate::club::ClubMatch {
                        canonical_id: None,
                        confidence: 0.0,
                        display: String::new(),
                    });

                if let Some(req_club) = &request_club {
                    if req_club.canonical_id.is_some()
                        && club_match.canonical_id.is_some()
                        && req_club.canonical_id != club_match.canonical_id
                    {
                        return None;
                    }
                }

                Some(Candidate {
                    master: m,
                    distinction: distinction::extract(&m.team_name).ok(),
                    league: extract_league_membership(&m.team_name),
                    club_match,
                })
            })
            .collect();

        let pool: Vec<Candidate> = if request_club.is_none() && club_filtered.is_empty() {
            // Club extraction failed for the incoming request itself:
            // fall back to the broader cohort scan.
            cohort_pool
                .iter()
                .map(|&m| Candidate {
                    master: m,
                    distinction: distinction::extract(&m.team_name).ok(),
                    league: extract_league_membership(&m.team_name),
                    club_match: m
                        .club_name
                        .as_ref()
                        .map(|c| self.club_registry.canonicalize(c))
                        .unwrap_or(crate::club::ClubMatch {
                            canonical_id: None,
                            confidence: 0.0,
                            display: String::new(),
                        }),
                })
                .collect()
        } else {
            club_filtered
        };

        // Gate 2: variant gate. If the incoming request carries a variant
        // (coach name / color / direction / roman numeral), candidates
        // with a *different* variant value are dropped.
        let gate2: Vec<&Candidate> = pool
            .iter()
            .filter(|c| {
                let Some(req_d) = &request_distinction else { return true };
                let Some(cand_d) = &c.distinction else { return true };
                !variant_conflicts(req_d, cand_d)
            })
            .collect();

        // Gate 3: distinction gate. Pair-incompatibility is an absolute
        // reject, never overridden by score.
        let gate3: Vec<&Candidate> = gate2
            .into_iter()
            .filter(|c| {
                let (Some(req_d), Some(cand_d)) = (&request_distinction, &c.distinction) else {
                    return true;
                };
                !distinction::pair_incompatible(req_d, cand_d)
            })
            .collect();

        let request_tokens = request_normalized.as_ref().map(|n| n.joined()).unwrap_or_default();

        let mut scored: Vec<(f64, &Candidate)> = gate3
            .into_iter()
            .map(|c| {
                (
                    score_candidate(
                        request,
                        &request_tokens,
                        &request_distinction,
                        &request_club,
                        &request_league,
                        c,
                        &config.policy,
                        &self.club_registry,
                    ),
                    c,
                )
            })
            .collect();

        scored.sort_by(|a, b| compare_candidates(a, b, &request_distinction));

        let best = scored.into_iter().next();

        let Some((score, candidate)) = best else {
            return self.handle_no_candidate(request, config, None, 0.0).await;
        };

        let gate_rejected = config.post_match_gates.iter().any(|g| !g(request, candidate.master));
        if gate_rejected {
            // Post-match gate rejected the best candidate even though it
            // scored high; force creation (policy permitting) rather than
            // silently accepting a dangerous cross-division merge (§4.5).
            return self.handle_no_candidate(request, config, None, 0.0).await;
        }

        if score >= config.policy.threshold_auto_approve {
            let alias = Alias {
                provider_id: request.provider_id,
                provider_team_id: request.provider_team_id.clone().unwrap_or_default(),
                master_id: candidate.master.master_id,
                match_method: MatchMethod::Fuzzy,
                confidence: score.min(config.policy.fuzzy_confidence_ceiling),
                review_status: ReviewStatus::Approved,
                raw_name: request.team_name.clone(),
            };
            let confidence = alias.confidence;
            self.alias_cache.upsert(alias).await?;
            return Ok(MatchOutcome::Matched {
                master_id: candidate.master.master_id,
                method: MatchMethod::Fuzzy,
                confidence,
            });
        }

        if score >= config.policy.threshold_review {
            let entry = ReviewEntry {
                provider_id: request.provider_id,
                provider_team_id: request.provider_team_id.clone().unwrap_or_default(),
                raw_name: request.team_name.clone(),
                suggested_master_id: Some(candidate.master.master_id),
                confidence: score,
                status: ReviewStatus::Pending,
            };
            self.review_queue.submit(entry).await?;
            return Ok(MatchOutcome::Review {
                suggested_master_id: Some(candidate.master.master_id),
                confidence: score,
            });
        }

        self.handle_no_candidate(request, config, None, score).await
    }

    async fn handle_no_candidate(
        &self,
        request: &MatchRequest,
        config: &ProviderMatchConfig,
        suggested: Option<MasterId>,
        confidence: f64,
    ) -> Result<MatchOutcome, RepositoryError> {
        if config.policy.may_create_team {
            let new_master = NewMasterTeam {
                team_name: request.team_name.clone(),
                club_name: request.club_name.clone(),
                age_group: request.age_group,
                gender: request.gender,
                state_code: request.state_code.clone(),
            };
            let master_id = self.repository.create_master(new_master).await?;
            let alias = Alias {
                provider_id: request.provider_id,
                provider_team_id: request.provider_team_id.clone().unwrap_or_default(),
                master_id,
                match_method: MatchMethod::Fuzzy,
                confidence: 1.0_f64.min(config.policy.fuzzy_confidence_ceiling),
                review_status: ReviewStatus::Approved,
                raw_name: request.team_name.clone(),
            };
            self.alias_cache.upsert(alias).await?;
            return Ok(MatchOutcome::Created { master_id });
        }

        let entry = ReviewEntry {
            provider_id: request.provider_id,
            provider_team_id: request.provider_team_id.clone().unwrap_or_default(),
            raw_name: request.team_name.clone(),
            suggested_master_id: suggested,
            confidence,
            status: ReviewStatus::Pending,
        };
        self.review_queue.submit(entry).await?;
        Ok(MatchOutcome::Review {
            suggested_master_id: suggested,
            confidence,
        })
    }
}

/// A "variant" is the short differentiator the glossary defines: color,
/// direction, coach, or roman numeral. Two candidates conflict when the
/// incoming request carries a variant value and the candidate carries a
/// *different* one for the same feature.
fn variant_conflicts(req: &Distinction, cand: &Distinction) -> bool {
    fn differs(a: &[String], b: &[String]) -> bool {
        !a.is_empty() && !b.is_empty() && a != b
    }
    differs(&req.colors, &cand.colors)
        || differs(&req.directions, &cand.directions)
        || (req.team_number.is_some() && cand.team_number.is_some() && req.team_number != cand.team_number)
        || (req.coach_name.is_some()
            && cand.coach_name.is_some()
            && req.coach_name.as_deref().map(str::to_ascii_lowercase)
                != cand.coach_name.as_deref().map(str::to_ascii_lowercase))
}

#[allow(clippy::too_many_arguments)]
fn score_candidate(
    request: &MatchRequest,
    request_tokens: &str,
    request_distinction: &Option<Distinction>,
    request_club: &Option<crate::club::ClubMatch>,
    request_league: &LeagueMembership,
    candidate: &Candidate,
    policy: &MatchingPolicy,
    club_registry: &ClubRegistry,
) -> f64 {
    let name_similarity = textsim::name_similarity(request_tokens, &candidate.master.team_name.to_ascii_lowercase());

    let club_similarity = match (request_club, &candidate.master.club_name) {
        (Some(req_club), Some(_)) if !req_club.display.is_empty() && !candidate.club_match.display.is_empty() => {
            if req_club.canonical_id.is_some() && req_club.canonical_id == candidate.club_match.canonical_id {
                1.0
            } else {
                club_registry.similarity(&req_club.display, &candidate.club_match.display)
            }
        }
        _ => 0.0,
    };

    let age_match = request_distinction
        .as_ref()
        .map(|d| !d.age_tokens.is_empty() && d.age_tokens == candidate.distinction.as_ref().map(|c| c.age_tokens.clone()).unwrap_or_default())
        .unwrap_or(false);

    let state_match = request
        .state_code
        .as_ref()
        .zip(candidate.master.state_code.as_ref())
        .map(|(a, b)| a.eq_ignore_ascii_case(b))
        .unwrap_or(false);

    let variant_matches = request_distinction
        .as_ref()
        .zip(candidate.distinction.as_ref())
        .map(|(a, b)| !variant_conflicts(a, b) && (a.colors == b.colors || a.coach_name == b.coach_name) && (!a.colors.is_empty() || a.coach_name.is_some()))
        .unwrap_or(false);

    let mut score = 0.35 * name_similarity
        + 0.35 * club_similarity
        + 0.10 * if age_match { 1.0 } else { 0.0 }
        + 0.10 * if state_match { 1.0 } else { 0.0 };

    if club_similarity >= 0.80 {
        score += policy.club_boost;
    }
    if club_similarity >= 0.80 && variant_matches {
        score += policy.club_variant_boost;
    }

    if !request_league.0.is_empty() && !candidate.league.0.is_empty() {
        if request_league.0.iter().any(|m| candidate.league.0.contains(m)) {
            score += policy.league_match_bonus;
        } else {
            score += policy.league_mismatch_penalty;
        }
    }

    score.clamp(0.0, 1.2)
}

/// Tie-break rule (§4.5): scores within `1e-3` are broken by (a) exact
/// variant match, (b) exact birth-year/U-age token match, (c) club
/// similarity >= 0.95, and finally a stable ordering by `master_id` so
/// repeated runs are fully deterministic.
fn compare_candidates(a: &(f64, &Candidate), b: &(f64, &Candidate), request_distinction: &Option<Distinction>) -> Ordering {
    const EPSILON: f64 = 1e-3;

    if (a.0 - b.0).abs() > EPSILON {
        return b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal);
    }

    if let Some(req_d) = request_distinction {
        let a_variant_exact = req_d.coach_name.is_some() && req_d.coach_name == a.1.distinction.as_ref().and_then(|d| d.coach_name.clone());
        let b_variant_exact = req_d.coach_name.is_some() && req_d.coach_name == b.1.distinction.as_ref().and_then(|d| d.coach_name.clone());
        if a_variant_exact != b_variant_exact {
            return b_variant_exact.cmp(&a_variant_exact);
        }

        let a_age_exact = !req_d.age_tokens.is_empty() && Some(&req_d.age_tokens) == a.1.distinction.as_ref().map(|d| &d.age_tokens);
        let b_age_exact = !req_d.age_tokens.is_empty() && Some(&req_d.age_tokens) == b.1.distinction.as_ref().map(|d| &d.age_tokens);
        if a_age_exact != b_age_exact {
            return b_age_exact.cmp(&a_age_exact);
        }
    }

    let a_club_high = a.1.club_match.confidence >= 0.95;
    let b_club_high = b.1.club_match.confidence >= 0.95;
    if a_club_high != b_club_high {
        return b_club_high.cmp(&a_club_high);
    }

    // Final deterministic tie-break: stable ordering by master id string.
    a.1.master.master_id.to_string().cmp(&b.1.master.master_id.to_string())
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
        masters: StdMutex<Vec<MasterTeam>>,
        aliases: StdMutex<Vec<Alias>>,
        reviews: StdMutex<Vec<ReviewEntry>>,
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
            Ok(self.masters.lock().unwrap().clone())
        }
        async fn replace_rankings(&self, _: crate::ids::Cohort, _: Vec<RankedTeam>) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn enqueue_review(&self, entry: ReviewEntry) -> Result<(), RepositoryError> {
            self.reviews.lock().unwrap().push(entry);
            Ok(())
        }
        async fn scan_approved_aliases(&self, _: usize) -> Result<Vec<Alias>, RepositoryError> {
            Ok(self.aliases.lock().unwrap().clone())
        }
    }

    fn master(name: &str, club: &str, age: u8, gender: Gender) -> MasterTeam {
        MasterTeam {
            master_id: MasterId::new(),
            team_name: name.to_string(),
            club_name: Some(club.to_string()),
            age_group: AgeGroup::new(age),
            gender,
            state_code: Some("TX".to_string()),
            is_deprecated: false,
        }
    }

    fn base_request(name: &str) -> MatchRequest {
        MatchRequest {
            provider_id: ProviderId(1),
            provider_team_id: Some("9001".to_string()),
            team_name: name.to_string(),
            age_group: AgeGroup::new(12),
            gender: Gender::Male,
            club_name: Some("FC Dallas".to_string()),
            state_code: Some("TX".to_string()),
            current_season_start_year: 2025,
        }
    }

    async fn harness() -> (TeamMatcher<FakeRepo>, Arc<FakeRepo>) {
        let repo = Arc::new(FakeRepo::default());
        let cache = Arc::new(AliasCache::load(Arc::clone(&repo), 100, 1000).await.unwrap());
        let mut registry = ClubRegistry::new();
        registry.register(
            crate::club::ClubId("fc-dallas".into()),
            vec!["FC Dallas".to_string()],
        );
        let registry = Arc::new(registry);
        let queue = Arc::new(ReviewQueue::new(Arc::clone(&repo)));
        (TeamMatcher::new(cache, registry, queue, Arc::clone(&repo)), repo)
    }

    #[tokio::test]
    async fn direct_id_match_returns_full_confidence() {
        let (matcher, repo) = harness().await;
        let m = master("FC Dallas 2014 Blue", "FC Dallas", 12, Gender::Male);
        repo.masters.lock().unwrap().push(m.clone());

        let alias = Alias {
            provider_id: ProviderId(1),
            provider_team_id: "126693".to_string(),
            master_id: m.master_id,
            match_method: MatchMethod::DirectId,
            confidence: 1.0,
            review_status: ReviewStatus::Approved,
            raw_name: "FC Dallas 2014 Blue".to_string(),
        };
        matcher.alias_cache.upsert(alias).await.unwrap();

        let mut request = base_request("FC Dallas - B2014 Blue Boys");
        request.provider_team_id = Some("126693".to_string());
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let candidates = repo.all_masters().await.unwrap();

        let outcome = matcher.match_team(&request, &config, &candidates).await.unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                master_id: m.master_id,
                method: MatchMethod::DirectId,
                confidence: 1.0
            }
        );
    }

    #[tokio::test]
    async fn fuzzy_auto_approve_creates_approved_alias() {
        let (matcher, repo) = harness().await;
        let m = master("FC Dallas 2014 Blue", "FC Dallas", 12, Gender::Male);
        repo.masters.lock().unwrap().push(m.clone());

        let request = base_request("FC Dallas - B2014 Blue Boys");
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let candidates = repo.all_masters().await.unwrap();

        let outcome = matcher.match_team(&request, &config, &candidates).await.unwrap();
        match outcome {
            MatchOutcome::Matched { master_id, confidence, .. } => {
                assert_eq!(master_id, m.master_id);
                assert!(confidence >= config.policy.threshold_auto_approve);
                assert!(confidence <= 0.99);
            }
            other => panic!("expected a fuzzy match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn variant_mismatch_never_matches_the_wrong_sibling() {
        let (matcher, repo) = harness().await;
        let davis = master("Atletico Dallas 15G Davis", "Atletico Dallas", 15, Gender::Female);
        let riedell = master("Atletico Dallas 15G Riedell", "Atletico Dallas", 15, Gender::Female);
        repo.masters.lock().unwrap().push(davis.clone());
        repo.masters.lock().unwrap().push(riedell.clone());

        let mut registry = ClubRegistry::new();
        registry.register(crate::club::ClubId("atletico-dallas".into()), vec!["Atletico Dallas".to_string()]);

        let mut request = base_request("Atletico Dallas G15 Davis");
        request.age_group = AgeGroup::new(15);
        request.gender = Gender::Female;
        request.club_name = Some("Atletico Dallas".to_string());

        let matcher = TeamMatcher::new(
            Arc::clone(&matcher.alias_cache),
            Arc::new(registry),
            Arc::clone(&matcher.review_queue),
            Arc::clone(&repo),
        );
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let candidates = repo.all_masters().await.unwrap();

        let outcome = matcher.match_team(&request, &config, &candidates).await.unwrap();
        match outcome {
            MatchOutcome::Matched { master_id, .. } => assert_eq!(master_id, davis.master_id),
            other => panic!("expected a match on Davis, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_candidate_and_may_create_team_creates_a_new_master() {
        let (matcher, repo) = harness().await;
        let request = base_request("Totally New Club 2014 Blue");
        let config: ProviderMatchConfig = MatchingPolicy::default().into();

        let outcome = matcher.match_team(&request, &config, &[]).await.unwrap();
        match outcome {
            MatchOutcome::Created { .. } => {}
            other => panic!("expected team creation, got {other:?}"),
        }
        assert_eq!(repo.masters.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_candidate_and_may_not_create_team_queues_review() {
        let (matcher, repo) = harness().await;
        let request = base_request("Totally New Club 2014 Blue");
        let mut policy = MatchingPolicy::default();
        policy.may_create_team = false;
        let config: ProviderMatchConfig = policy.into();

        let outcome = matcher.match_team(&request, &config, &[]).await.unwrap();
        assert_eq!(outcome, MatchOutcome::Review { suggested_master_id: None, confidence: 0.0 });
        assert_eq!(repo.reviews.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deterministic_ties_break_the_same_way_on_repeated_runs() {
        let (matcher, repo) = harness().await;
        let a = master("FC Dallas 2014 Blue North", "FC Dallas", 12, Gender::Male);
        let b = master("FC Dallas 2014 Blue South", "FC Dallas", 12, Gender::Male);
        repo.masters.lock().unwrap().push(a.clone());
        repo.masters.lock().unwrap().push(b.clone());

        let request = base_request("FC Dallas 2014 Blue");
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let candidates = repo.all_masters().await.unwrap();

        let first = matcher.match_team(&request, &config, &candidates).await.unwrap();
        // Re-running against the identical candidate pool must choose the
        // exact same outcome (deterministic tie-break, §8).
        let second_candidates: Vec<MasterTeam> = candidates.clone();
        let second = matcher.match_team(&request, &config, &second_candidates).await.unwrap();
        assert_eq!(std::mem::discriminant(&first), std::mem::discriminant(&second));
    }

    #[tokio::test]
    async fn pre_filter_state_excludes_out_of_state_candidates_from_gate_1() {
        let (matcher, repo) = harness().await;
        let mut out_of_state = master("FC Dallas 2014 Blue", "FC Dallas", 12, Gender::Male);
        out_of_state.state_code = Some("CA".to_string());
        repo.masters.lock().unwrap().push(out_of_state.clone());

        let request = base_request("FC Dallas - B2014 Blue Boys"); // state_code "TX"
        let mut policy = MatchingPolicy::default();
        policy.pre_filter_state = true;
        let config: ProviderMatchConfig = policy.into();
        let candidates = repo.all_masters().await.unwrap();

        // The CA candidate would otherwise auto-approve; with
        // `pre_filter_state` on it never reaches Gate 1's pool, so the
        // request creates a brand-new master instead.
        let outcome = matcher.match_team(&request, &config, &candidates).await.unwrap();
        match outcome {
            MatchOutcome::Created { master_id } => assert_ne!(master_id, out_of_state.master_id),
            other => panic!("expected team creation (out-of-state candidate filtered out), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_filter_state_off_still_matches_out_of_state_candidates() {
        let (matcher, repo) = harness().await;
        let mut out_of_state = master("FC Dallas 2014 Blue", "FC Dallas", 12, Gender::Male);
        out_of_state.state_code = Some("CA".to_string());
        repo.masters.lock().unwrap().push(out_of_state.clone());

        let request = base_request("FC Dallas - B2014 Blue Boys");
        let config: ProviderMatchConfig = MatchingPolicy::default().into();
        let candidates = repo.all_masters().await.unwrap();

        let outcome = matcher.match_team(&request, &config, &candidates).await.unwrap();
        match outcome {
            MatchOutcome::Matched { master_id, .. } => assert_eq!(master_id, out_of_state.master_id),
            other => panic!("expected a match across states when pre_filter_state is off, got {other:?}"),
        }
    }
}
