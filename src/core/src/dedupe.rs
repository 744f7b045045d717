//! C6 — Game Deduper. Normalizes either reporting perspective of a fixture
//! into neutral form, derives the perspective-invariant `game_uid`, and
//! performs the two-level dedup described in §4.6.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::{MasterId, ProviderId};
use crate::repository::{Game, GameCompositeKey};

/// A single-perspective record: `{team_id, opponent_id, home_away,
/// goals_for, goals_against}` (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveGame {
    pub provider_id: ProviderId,
    pub provider_code: String,
    pub team_master_id: MasterId,
    pub team_provider_id: String,
    pub opponent_master_id: MasterId,
    pub opponent_provider_id: String,
    pub home_away: HomeAway,
    pub goals_for: Option<u16>,
    pub goals_against: Option<u16>,
    pub game_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomeAway {
    Home,
    Away,
}

/// Step 1 of §4.6: normalize a single-perspective record into the neutral
/// `home_*`/`away_*` form by swapping on `home_away`.
pub fn to_neutral(p: &PerspectiveGame) -> Game {
    let (home_master, home_pid, away_master, away_pid, home_score, away_score) = match p.home_away {
        HomeAway::Home => (
            p.team_master_id,
            p.team_provider_id.clone(),
            p.opponent_master_id,
            p.opponent_provider_id.clone(),
            p.goals_for,
            p.goals_against,
        ),
        HomeAway::Away => (
            p.opponent_master_id,
            p.opponent_provider_id.clone(),
            p.team_master_id,
            p.team_provider_id.clone(),
            p.goals_against,
            p.goals_for,
        ),
    };

    let game_uid = compute_game_uid(&p.provider_code, p.game_date, &home_pid, &away_pid);

    Game {
        game_uid,
        provider_id: p.provider_id,
        home_master_id: home_master,
        away_master_id: away_master,
        home_provider_id: home_pid,
        away_provider_id: away_pid,
        home_score,
        away_score,
        game_date: p.game_date,
    }
}

/// `game_uid = provider_code ":" date ":" min(t1,t2) ":" max(t1,t2)` —
/// scores are excluded and the two provider-team-ids are sorted so both
/// reporting perspectives of the same fixture collapse onto one uid (§3).
pub fn compute_game_uid(provider_code: &str, game_date: NaiveDate, t1: &str, t2: &str) -> String {
    let (lo, hi) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
    format!("{provider_code}:{game_date}:{lo}:{hi}")
}

/// Outcome of running a batch of neutral-form games through the two-level
/// dedup of §4.6.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub to_insert: Vec<Game>,
    /// Dropped because `game_uid` already existed in storage or earlier in
    /// this same batch.
    pub uid_duplicates: usize,
    /// Survived the uid check but matched an existing composite key
    /// (different uid spelling, identical tuple) — a true storage-level
    /// duplicate.
    pub composite_duplicates: usize,
}

/// Two-level dedup (§4.6 step 3-4). The uid check is a cheap pre-filter: a
/// brand-new uid is always new and skips straight to insertion. A uid that
/// already exists is *not* automatically dropped — it falls through to the
/// composite-key check, which is authoritative: identical composite key
/// means a true duplicate (same uid spelling or not), while a differing key
/// under the same uid means a later correction that must persist alongside
/// the first report (§4.6 step 4). `existing_uids`/`existing_keys` reflect
/// storage state as of the start of the batch; callers are expected to
/// have already bulk-checked these against the repository.
pub fn dedupe_batch(
    games: Vec<Game>,
    existing_uids: &std::collections::HashSet<String>,
    existing_keys: &std::collections::HashSet<GameCompositeKey>,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut seen_keys_this_batch: std::collections::HashSet<GameCompositeKey> = std::collections::HashSet::new();

    for game in games {
        let key = GameCompositeKey::from_scores(
            game.provider_id,
            game.home_provider_id.clone(),
            game.away_provider_id.clone(),
            game.game_date,
            game.home_score,
            game.away_score,
        );

        if existing_keys.contains(&key) || seen_keys_this_batch.contains(&key) {
            outcome.composite_duplicates += 1;
            continue;
        }

        if existing_uids.contains(&game.game_uid) {
            // Same uid, different composite key: a correction. Counted so
            // `ImportMetrics` can distinguish it from a fresh fixture, but
            // it still gets inserted.
            outcome.uid_duplicates += 1;
        }

        seen_keys_this_batch.insert(key);
        outcome.to_insert.push(game);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(n: u128) -> MasterId {
        MasterId(uuid::Uuid::from_u128(n))
    }

    fn perspective(home_away: HomeAway, gf: u16, ga: u16) -> PerspectiveGame {
        PerspectiveGame {
            provider_id: ProviderId(1),
            provider_code: "gotsport".into(),
            team_master_id: master(1),
            team_provider_id: "126693".into(),
            opponent_master_id: master(2),
            opponent_provider_id: "128456".into(),
            home_away,
            goals_for: Some(gf),
            goals_against: Some(ga),
            game_date: NaiveDate::from_ymd_opt(2025, 3, 15).unwrap(),
        }
    }

    #[test]
    fn game_uid_is_invariant_under_perspective_swap() {
        let home_view = to_neutral(&perspective(HomeAway::Home, 3, 1));
        let away_view = to_neutral(&perspective(HomeAway::Away, 1, 3));
        assert_eq!(home_view.game_uid, away_view.game_uid);
        assert_eq!(home_view.home_master_id, away_view.home_master_id);
        assert_eq!(home_view.home_score, Some(3));
        assert_eq!(away_view.home_score, Some(3));
    }

    #[test]
    fn two_perspectives_of_the_same_match_collapse_to_one_game() {
        let games = vec![
            to_neutral(&perspective(HomeAway::Home, 3, 1)),
            to_neutral(&perspective(HomeAway::Away, 1, 3)),
        ];
        let outcome = dedupe_batch(games, &Default::default(), &Default::default());
        assert_eq!(outcome.to_insert.len(), 1);
        assert_eq!(outcome.composite_duplicates, 1);
    }

    #[test]
    fn score_correction_with_same_uid_but_different_composite_key_both_persist() {
        let first = to_neutral(&perspective(HomeAway::Home, 3, 1));
        let first_key = GameCompositeKey::from_scores(
            first.provider_id,
            first.home_provider_id.clone(),
            first.away_provider_id.clone(),
            first.game_date,
            first.home_score,
            first.away_score,
        );
        let mut existing_uids = std::collections::HashSet::new();
        existing_uids.insert(first.game_uid.clone());
        let mut existing_keys = std::collections::HashSet::new();
        existing_keys.insert(first_key);

        let corrected = to_neutral(&perspective(HomeAway::Home, 4, 1));
        // Same uid (scores excluded) but a different composite key.
        assert_eq!(first.game_uid, corrected.game_uid);

        let outcome = dedupe_batch(vec![corrected], &existing_uids, &existing_keys);
        assert_eq!(outcome.to_insert.len(), 1, "a correction must persist alongside the first report");
        assert_eq!(outcome.uid_duplicates, 1, "still counted as a uid-level repeat for metrics");
        assert_eq!(outcome.composite_duplicates, 0);
    }

    #[test]
    fn true_composite_duplicate_is_dropped() {
        let game = to_neutral(&perspective(HomeAway::Home, 3, 1));
        let key = GameCompositeKey::from_scores(
            game.provider_id,
            game.home_provider_id.clone(),
            game.away_provider_id.clone(),
            game.game_date,
            game.home_score,
            game.away_score,
        );
        let mut existing_keys = std::collections::HashSet::new();
        existing_keys.insert(key);

        let outcome = dedupe_batch(vec![game], &Default::default(), &existing_keys);
        assert_eq!(outcome.to_insert.len(), 0);
        assert_eq!(outcome.composite_duplicates, 1);
    }
}
