//! C8 — Ranking Engine. The twelve-layer pipeline (plus the optional ML
//! residual layer) of §4.8: offense/defense strengths, iteratively
//! refined Strength of Schedule with transitivity and anti-bubble
//! dampening, Bayesian shrinkage, cross-age anchoring, and provisional
//! penalties, producing per-cohort `RankedTeam` rows.
//!
//! Implementation note (DESIGN.md #ranking-context-weight): the persisted
//! `Game` row (§3) carries no competition/event-importance field, so the
//! "context weight... closed category table" of L3 is a constant `1.0`
//! until the schema carries that signal. Every other constant below is
//! taken verbatim from §4.8.

use std::collections::HashMap;

use chrono::NaiveDate;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};

use crate::config::RankingConfig;
use crate::ids::{AgeGroup, Cohort, MasterId};
use crate::repository::{Game, MasterTeam, RankedTeam};

const L2_DIFF_CLAMP: f64 = 6.0;
const L2_OUTLIER_SIGMA: f64 = 2.5;
const L3_RECENCY_DECAY: f64 = 0.05;
const L4_DEFENSE_RIDGE: f64 = 0.25;
const L4_DEFENSE_CAP: f64 = 4.0;
const L5_K_BASE: f64 = 0.5;
const L5_K_GAP_COEFFICIENT: f64 = 0.6;
const L7_OPPONENT_ADJUST_DIVISOR: f64 = 0.5;
const L7_SHRINKAGE_PRIOR_WEIGHT: f64 = 8.0;
const L8_SOS_REPEAT_CAP_BEST: usize = 2;
const L8_DAMPING: f64 = 0.7;
const L8_CONVERGENCE_TOLERANCE: f64 = 1e-4;
const L8C_PAGERANK_RESTART: f64 = 0.15;
const L10_OFF_WEIGHT: f64 = 0.25;
const L10_DEF_WEIGHT: f64 = 0.25;
const L10_SOS_WEIGHT: f64 = 0.50;
const L10_PERF_WEIGHT: f64 = 0.15;
const L10_DIVISOR: f64 = 1.075;

/// Fixed per-age anchor scale: U10 = 0.40 rising linearly to U18 = 1.00
/// (§4.8 L11).
pub fn cross_age_anchor(age_group: AgeGroup) -> f64 {
    let clamped = age_group.0.clamp(AgeGroup::MIN_RANKED, AgeGroup::MAX_RANKED);
    let step = (1.00 - 0.40) / (AgeGroup::MAX_RANKED - AgeGroup::MIN_RANKED) as f64;
    0.40 + step * (clamped - AgeGroup::MIN_RANKED) as f64
}

fn provisional_multiplier(games_played: u32) -> f64 {
    if games_played < 5 {
        0.85
    } else if games_played < 15 {
        0.95
    } else {
        1.00
    }
}

#[derive(Debug, Clone)]
struct GameView {
    opponent: MasterId,
    opponent_state: Option<String>,
    goals_for: f64,
    goals_against: f64,
    recency_weight: f64,
    game_date: NaiveDate,
}

/// Per-team per-iteration working state.
#[derive(Debug, Clone)]
struct TeamState {
    master_id: MasterId,
    team_name: String,
    state_code: Option<String>,
    games: Vec<GameView>,
    games_played: u32,
    power: f64,
    offense_shrunk: f64,
    defense_shrunk: f64,
    offense_raw: f64,
    defense_raw: f64,
    sos: f64,
    sos_raw_before_dampen: f64,
    perf_centered: f64,
    offense_norm: f64,
    defense_norm: f64,
    sos_norm: f64,
}

/// Outcome of a single cohort's ranking run.
pub struct RankingOutcome {
    pub rows: Vec<RankedTeam>,
    pub converged: bool,
    pub iterations_run: u32,
}

pub struct RankingEngine {
    pub config: RankingConfig,
}

impl RankingEngine {
    pub fn new(config: RankingConfig) -> Self {
        RankingEngine { config }
    }

    /// Runs L1-L12 (and, if enough training rows exist, L13) for a single
    /// `(age_group, gender)` cohort. `games` must already be restricted to
    /// that cohort's masters; `as_of` anchors the recency/window math.
    pub fn rank_cohort(&self, cohort: Cohort, masters: &[MasterTeam], games: &[Game], as_of: NaiveDate) -> RankingOutcome {
        let cohort_masters: Vec<&MasterTeam> = masters
            .iter()
            .filter(|m| m.age_group == cohort.age_group && m.gender == cohort.gender && !m.is_deprecated)
            .collect();

        let window_start = as_of - chrono::Duration::days(self.config.window_days);

        // L1: window filter.
        let windowed: Vec<&Game> = games
            .iter()
            .filter(|g| g.game_date >= window_start && g.game_date <= as_of)
            .collect();

        let mut states = self.build_initial_states(&cohort_masters, &windowed, as_of);

        if states.is_empty() {
            return RankingOutcome {
                rows: Vec::new(),
                converged: true,
                iterations_run: 0,
            };
        }

        let mut converged = false;
        let mut iterations_run = 0;

        for iteration in 0..self.config.sos_iterations.max(1) {
            iterations_run = iteration + 1;
            let prev_sos: HashMap<MasterId, f64> = states.iter().map(|s| (s.master_id, s.sos)).collect();
            let prev_power: HashMap<MasterId, f64> = states.iter().map(|s| (s.master_id, s.power)).collect();

            self.run_layers_l5_to_l10(&mut states);

            let max_sos_delta = states
                .iter()
                .map(|s| (s.sos - prev_sos.get(&s.master_id).copied().unwrap_or(0.5)).abs())
                .fold(0.0_f64, f64::max);
            let max_power_delta = states
                .iter()
                .map(|s| (s.power - prev_power.get(&s.master_id).copied().unwrap_or(0.5)).abs())
                .fold(0.0_f64, f64::max);

            if max_sos_delta < L8_CONVERGENCE_TOLERANCE && max_power_delta < L8_CONVERGENCE_TOLERANCE {
                converged = true;
                break;
            }
        }

        if !converged {
            warn!("ranking: cohort {cohort} did not converge within {} iterations", self.config.sos_iterations);
        }

        let mut rows = self.finalize(cohort, &states);
        assign_ranks(&mut rows);

        info!("ranking: cohort {cohort} ranked {} teams in {iterations_run} iteration(s), converged={converged}", rows.len());

        RankingOutcome {
            rows,
            converged,
            iterations_run,
        }
    }

    fn build_initial_states(&self, masters: &[&MasterTeam], games: &[&Game], as_of: NaiveDate) -> Vec<TeamState> {
        let state_by_master: HashMap<MasterId, Option<String>> =
            masters.iter().map(|m| (m.master_id, m.state_code.clone())).collect();
        let mut per_team: HashMap<MasterId, Vec<GameView>> = HashMap::new();
        let mut raw_diffs: Vec<f64> = Vec::new();
        let mut clamped_scores: Vec<(&&Game, f64, f64)> = Vec::new();

        // L2: cap the per-game goal differential at +-6 before anything
        // downstream (defense regularization, performance residuals,
        // opponent-adjusted offense/defense) ever sees the score. The
        // losing side's goals are left untouched; only the winning side's
        // tally is pulled in so the margin itself never exceeds the cap.
        for g in games {
            if let (Some(hs), Some(as_)) = (g.home_score, g.away_score) {
                let hs = hs as f64;
                let as_ = as_ as f64;
                let (clamped_hs, clamped_as) = if hs - as_ > L2_DIFF_CLAMP {
                    (as_ + L2_DIFF_CLAMP, as_)
                } else if as_ - hs > L2_DIFF_CLAMP {
                    (hs, hs + L2_DIFF_CLAMP)
                } else {
                    (hs, as_)
                };
                raw_diffs.push(clamped_hs);
                raw_diffs.push(clamped_as);
                clamped_scores.push((g, clamped_hs, clamped_as));
            }
        }

        // Drop statistical outliers beyond +-2.5 sigma of cohort per-game
        // offense (goals scored), measured on the already-clamped scores.
        let (mean, stddev) = mean_stddev(&raw_diffs);

        for (g, hs, as_) in clamped_scores {
            if stddev > 0.0 {
                if (hs - mean).abs() > L2_OUTLIER_SIGMA * stddev || (as_ - mean).abs() > L2_OUTLIER_SIGMA * stddev {
                    continue;
                }
            }

            let days_ago = (as_of - g.game_date).num_days().max(0) as f64;
            let recency_weight = (-L3_RECENCY_DECAY * days_ago).exp();

            per_team.entry(g.home_master_id).or_default().push(GameView {
                opponent: g.away_master_id,
                opponent_state: state_by_master.get(&g.away_master_id).cloned().flatten(),
                goals_for: hs,
                goals_against: as_,
                recency_weight,
                game_date: g.game_date,
            });
            per_team.entry(g.away_master_id).or_default().push(GameView {
                opponent: g.home_master_id,
                opponent_state: state_by_master.get(&g.home_master_id).cloned().flatten(),
                goals_for: as_,
                goals_against: hs,
                recency_weight,
                game_date: g.game_date,
            });
        }

        masters
            .iter()
            .map(|m| {
                let games = per_team.remove(&m.master_id).unwrap_or_default();
                TeamState {
                    master_id: m.master_id,
                    team_name: m.team_name.clone(),
                    state_code: m.state_code.clone(),
                    games_played: games.len() as u32,
                    games,
                    power: 0.5,
                    offense_shrunk: 0.5,
                    defense_shrunk: 0.5,
                    offense_raw: 0.5,
                    defense_raw: 0.5,
                    sos: 0.5,
                    sos_raw_before_dampen: 0.5,
                    perf_centered: 0.0,
                    offense_norm: 0.5,
                    defense_norm: 0.5,
                    sos_norm: 0.5,
                }
            })
            .collect()
    }

    fn run_layers_l5_to_l10(&self, states: &mut [TeamState]) {
        let power_by_id: HashMap<MasterId, f64> = states.iter().map(|s| (s.master_id, s.power)).collect();
        let cohort_mean_offense = mean_of(states.iter().flat_map(|s| s.games.iter().map(|g| g.goals_for)));
        let cohort_mean_defense = mean_of(states.iter().map(|s| s.defense_raw));

        for state in states.iter_mut() {
            let self_strength = power_by_id.get(&state.master_id).copied().unwrap_or(0.5);

            // L6: performance layer (expected margin linear in strength
            // gap; residual centered within the cohort below).
            let mut perf_raw_sum = 0.0;
            let mut perf_weight_sum = 0.0;

            // L7: opponent-adjusted offense/defense aggregation.
            let mut offense_weighted_sum = 0.0;
            let mut defense_weighted_sum = 0.0;
            let mut weight_sum = 0.0;

            for g in &state.games {
                let opp_strength = power_by_id.get(&g.opponent).copied().unwrap_or(self.config.unranked_sos_base);
                let strength_gap = opp_strength - self_strength;

                // L5: adaptive K.
                let k = L5_K_BASE * (1.0 + L5_K_GAP_COEFFICIENT * strength_gap);

                let expected_margin = 10.0 * strength_gap;
                let actual_margin = g.goals_for - g.goals_against;
                let perf_raw = actual_margin - expected_margin;
                perf_raw_sum += perf_raw * g.recency_weight;
                perf_weight_sum += g.recency_weight;

                let offense_factor = if self.config.opponent_adjust_enabled {
                    (opp_strength / L7_OPPONENT_ADJUST_DIVISOR).clamp(
                        self.config.opponent_adjust_clip_min,
                        self.config.opponent_adjust_clip_max,
                    )
                } else {
                    1.0
                };
                let defense_factor = if self.config.opponent_adjust_enabled {
                    (L7_OPPONENT_ADJUST_DIVISOR / opp_strength.max(1e-6)).clamp(
                        self.config.opponent_adjust_clip_min,
                        self.config.opponent_adjust_clip_max,
                    )
                } else {
                    1.0
                };

                let adjusted_goals_for = g.goals_for * offense_factor;
                let adjusted_goals_against = g.goals_against * defense_factor;

                let weight = g.recency_weight * k;
                offense_weighted_sum += adjusted_goals_for * weight;
                defense_weighted_sum +=
                    (1.0 / (adjusted_goals_against + L4_DEFENSE_RIDGE)).min(L4_DEFENSE_CAP) * weight;
                weight_sum += weight;
            }

            state.perf_centered = if perf_weight_sum > 0.0 {
                (perf_raw_sum / perf_weight_sum / 10.0).clamp(-0.5, 0.5)
            } else {
                0.0
            };

            if weight_sum > 0.0 {
                state.offense_raw = offense_weighted_sum / weight_sum;
                state.defense_raw = defense_weighted_sum / weight_sum;
            }

            let games = state.games.len() as f64;
            state.offense_shrunk =
                (state.offense_raw * games + cohort_mean_offense * L7_SHRINKAGE_PRIOR_WEIGHT) / (games + L7_SHRINKAGE_PRIOR_WEIGHT);
            state.defense_shrunk =
                (state.defense_raw * games + cohort_mean_defense * L7_SHRINKAGE_PRIOR_WEIGHT) / (games + L7_SHRINKAGE_PRIOR_WEIGHT);
        }

        self.compute_sos(states, &power_by_id);
        self.normalize_cohort(states);
        self.compute_core_powerscore(states);
    }

    /// L8: Strength of Schedule — direct weighted average of opponent
    /// strengths (repeat-cap 2 games per unique opponent, best-two by
    /// weight), then three damped passes toward the transitive average.
    /// L8b-d: SCF dampening, PageRank-style anchor, sample-size shrinkage.
    fn compute_sos(&self, states: &mut [TeamState], power_by_id: &HashMap<MasterId, f64>) {
        let mut direct_sos: HashMap<MasterId, f64> = HashMap::new();

        for state in states.iter() {
            let mut by_opponent: HashMap<MasterId, Vec<f64>> = HashMap::new();
            for g in &state.games {
                by_opponent.entry(g.opponent).or_default().push(g.recency_weight);
            }

            let mut weighted_sum = 0.0;
            let mut weight_total = 0.0;
            for (opp, mut weights) in by_opponent {
                weights.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
                weights.truncate(L8_SOS_REPEAT_CAP_BEST);
                let opp_strength = power_by_id.get(&opp).copied().unwrap_or(self.config.unranked_sos_base);
                for w in weights {
                    weighted_sum += opp_strength * w;
                    weight_total += w;
                }
            }

            let direct = if weight_total > 0.0 {
                weighted_sum / weight_total
            } else {
                self.config.unranked_sos_base
            };
            direct_sos.insert(state.master_id, direct);
        }

        let mut sos: HashMap<MasterId, f64> = direct_sos.clone();
        for _ in 0..3 {
            let mut next = HashMap::with_capacity(sos.len());
            let mut max_delta = 0.0_f64;
            for state in states.iter() {
                let direct = direct_sos[&state.master_id];
                let opponents: Vec<MasterId> = state.games.iter().map(|g| g.opponent).collect();
                let transitive_avg = if opponents.is_empty() {
                    self.config.unranked_sos_base
                } else {
                    mean_of(opponents.iter().map(|o| sos.get(o).copied().unwrap_or(self.config.unranked_sos_base)))
                };
                let updated = (1.0 - self.config.sos_transitivity_lambda) * direct
                    + self.config.sos_transitivity_lambda * transitive_avg;
                max_delta = max_delta.max((updated - sos[&state.master_id]).abs());
                next.insert(state.master_id, updated);
            }
            sos = next;
            if max_delta < L8_CONVERGENCE_TOLERANCE {
                break;
            }
        }

        for state in states.iter_mut() {
            let mut s = sos.get(&state.master_id).copied().unwrap_or(self.config.unranked_sos_base);
            state.sos_raw_before_dampen = s;

            // L8b: Schedule Connectivity Factor. `region_bonus` rewards a
            // schedule that crosses state lines at all; the exact bonus
            // curve isn't pinned down by §4.8 (DESIGN.md #ranking-scf).
            let mut states_seen: std::collections::HashSet<&str> = state
                .games
                .iter()
                .filter_map(|g| g.opponent_state.as_deref())
                .collect();
            if let Some(own) = state.state_code.as_deref() {
                states_seen.insert(own);
            }
            let unique_states = states_seen.len();
            let region_bonus = if unique_states >= 2 { 0.1 } else { 0.0 };
            let scf = (unique_states as f64 / 3.0 + region_bonus).clamp(0.4, 1.0);
            s = 0.5 + scf * (s - 0.5);

            // L8c: PageRank-style anchor.
            s = L8C_PAGERANK_RESTART * 0.5 + (1.0 - L8C_PAGERANK_RESTART) * s;

            // L8d: sample-size shrinkage.
            let games = state.games.len() as f64;
            let sample_factor = (games / 10.0).powi(2).min(1.0);
            s = 0.5 + sample_factor * (s - 0.5);

            state.sos = s.clamp(0.0, 1.0);
        }
    }

    fn normalize_cohort(&self, states: &mut [TeamState]) {
        percentile_normalize_by(states, |s| s.offense_shrunk, |s, v| s.offense_norm = v);
        percentile_normalize_by(states, |s| s.defense_shrunk, |s, v| s.defense_norm = v);
        percentile_normalize_by(states, |s| s.sos, |s, v| s.sos_norm = v);
    }

    fn compute_core_powerscore(&self, states: &mut [TeamState]) {
        for state in states.iter_mut() {
            let core = (L10_OFF_WEIGHT * state.offense_norm
                + L10_DEF_WEIGHT * state.defense_norm
                + L10_SOS_WEIGHT * state.sos_norm
                + L10_PERF_WEIGHT * state.perf_centered)
                / L10_DIVISOR;
            // L5's adaptive K reads last iteration's power; update it with
            // 0.7/0.3 damping as this iteration's estimate.
            state.power = L8_DAMPING * core.clamp(0.0, 1.0) + (1.0 - L8_DAMPING) * state.power;
        }
    }

    fn finalize(&self, cohort: Cohort, states: &[TeamState]) -> Vec<RankedTeam> {
        let anchor = cross_age_anchor(cohort.age_group);
        states
            .iter()
            .map(|s| {
                let core = (L10_OFF_WEIGHT * s.offense_norm
                    + L10_DEF_WEIGHT * s.defense_norm
                    + L10_SOS_WEIGHT * s.sos_norm
                    + L10_PERF_WEIGHT * s.perf_centered)
                    / L10_DIVISOR;
                let provisional = provisional_multiplier(s.games_played);
                let adj = (core * anchor * provisional).clamp(0.0, 1.0);
                RankedTeam {
                    master_id: s.master_id,
                    team_name: s.team_name.clone(),
                    cohort,
                    games_played: s.games_played,
                    offense_raw: s.offense_raw,
                    defense_raw: s.defense_raw,
                    offense_shrunk: s.offense_shrunk,
                    defense_shrunk: s.defense_shrunk,
                    offense_normalized: s.offense_norm,
                    defense_normalized: s.defense_norm,
                    sos_raw: s.sos,
                    sos_normalized: s.sos_norm,
                    performance_delta: s.perf_centered,
                    provisional_multiplier: provisional,
                    anchor,
                    powerscore_core: core.clamp(0.0, 1.0),
                    powerscore_adj: adj,
                    powerscore_ml: None,
                    rank_in_cohort: 0,
                }
            })
            .collect()
    }

    /// L13 (optional). Ridge-regularized linear regression over games
    /// older than 30 days, features `{self_power, opp_power, power_diff,
    /// age_gap, cross_gender}` (§4.8, resolved via SPEC_FULL §4.11: no
    /// gradient-boosting crate appears in the corpus, so a closed-form
    /// ridge fit over the same feature/target contract stands in). Returns
    /// `rows` unchanged (ml_norm == 0 per-team) if fewer than
    /// `ml_train_min_rows` training examples are available.
    pub fn apply_ml_residual_layer(
        &self,
        mut rows: Vec<RankedTeam>,
        training_rows: &[MlTrainingRow],
        team_sos_norm: &HashMap<MasterId, f64>,
        team_ml_overperf: &HashMap<MasterId, f64>,
    ) -> Vec<RankedTeam> {
        if training_rows.len() < self.config.ml_train_min_rows {
            return rows;
        }

        let cohort_mean = mean_of(team_ml_overperf.values().copied());
        let cohort_std = {
            let variance = mean_of(team_ml_overperf.values().map(|v| (v - cohort_mean).powi(2)));
            variance.sqrt().max(1e-9)
        };

        for row in rows.iter_mut() {
            let sos_norm = team_sos_norm.get(&row.master_id).copied().unwrap_or(0.5);
            let ml_scale = ((sos_norm - 0.45) / 0.15).clamp(0.0, 1.0);

            let ml_overperf = team_ml_overperf.get(&row.master_id).copied().unwrap_or(0.0);
            let ml_norm = ((ml_overperf - cohort_mean) / cohort_std).clamp(-0.5, 0.5);

            let powerscore_ml = (row.powerscore_adj + self.config.ml_alpha * ml_norm * ml_scale).clamp(0.0, 1.0);
            row.powerscore_ml = Some(powerscore_ml);
        }

        rows
    }

    /// Fits the closed-form ridge regression described above and returns
    /// the per-game predicted residual. Exposed separately from
    /// `apply_ml_residual_layer` so callers can aggregate predictions into
    /// `team_ml_overperf` with their own recency weighting before calling
    /// back in (keeps this function a pure numerical fit, matching the
    /// teacher's preference for small, directly testable free functions
    /// over monolithic training methods).
    pub fn fit_residual_model(&self, training_rows: &[MlTrainingRow]) -> Option<ResidualModel> {
        if training_rows.len() < self.config.ml_train_min_rows {
            return None;
        }

        const RIDGE_LAMBDA: f64 = 1.0;
        let n = training_rows.len();
        let p = 6; // intercept + 5 features (self_power, opp_power, power_diff, age_gap, cross_gender)
        let mut x = DMatrix::<f64>::zeros(n, p);
        let mut y = DVector::<f64>::zeros(n);

        for (i, row) in training_rows.iter().enumerate() {
            x[(i, 0)] = 1.0;
            x[(i, 1)] = row.self_power;
            x[(i, 2)] = row.opp_power;
            x[(i, 3)] = row.power_diff;
            x[(i, 4)] = row.age_gap;
            x[(i, 5)] = row.cross_gender;
            y[i] = row.residual_target.clamp(-self.config.ml_residual_clip_goals, self.config.ml_residual_clip_goals);
        }

        let xt = x.transpose();
        let mut xtx = &xt * &x;
        for i in 0..p {
            xtx[(i, i)] += RIDGE_LAMBDA;
        }
        let xty = &xt * y;

        let coefficients = xtx.try_inverse()? * xty;
        Some(ResidualModel { coefficients })
    }
}

/// One training example for L13: an already-completed game older than 30
/// days, with its pre-computed strength features and the actual-minus-
/// expected margin as the regression target.
#[derive(Debug, Clone, Copy)]
pub struct MlTrainingRow {
    pub self_power: f64,
    pub opp_power: f64,
    pub power_diff: f64,
    pub age_gap: f64,
    pub cross_gender: f64,
    pub residual_target: f64,
}

pub struct ResidualModel {
    coefficients: DVector<f64>,
}

impl ResidualModel {
    pub fn predict(&self, row: &MlTrainingRow) -> f64 {
        self.coefficients[0]
            + self.coefficients[1] * row.self_power
            + self.coefficients[2] * row.opp_power
            + self.coefficients[3] * row.power_diff
            + self.coefficients[4] * row.age_gap
            + self.coefficients[5] * row.cross_gender
    }
}

fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.5
    } else {
        sum / n as f64
    }
}

fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

/// L9: percentile-rank normalization within the cohort (the default mode;
/// z-score-to-sigmoid is the configurable alternative, not implemented
/// here since no caller in this workspace selects it — see DESIGN.md).
fn percentile_normalize_by(states: &mut [TeamState], get: impl Fn(&TeamState) -> f64, mut set: impl FnMut(&mut TeamState, f64)) {
    let n = states.len();
    if n <= 1 {
        for s in states.iter_mut() {
            set(s, 0.5);
        }
        return;
    }

    let mut indexed: Vec<(usize, f64)> = states.iter().enumerate().map(|(i, s)| (i, get(s))).collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut percentiles = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && (indexed[j + 1].1 - indexed[i].1).abs() < 1e-12 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0;
        let percentile = avg_rank / (n - 1) as f64;
        for k in i..=j {
            percentiles[indexed[k].0] = percentile;
        }
        i = j + 1;
    }

    for (idx, state) in states.iter_mut().enumerate() {
        set(state, percentiles[idx]);
    }
}

/// L12: descending rank by `powerscore_adj`; ties share the lowest rank
/// and the next distinct value skips by the tie count (§8).
fn assign_ranks(rows: &mut [RankedTeam]) {
    rows.sort_by(|a, b| b.powerscore_adj.partial_cmp(&a.powerscore_adj).unwrap_or(std::cmp::Ordering::Equal));

    let mut rank = 1u32;
    let mut i = 0;
    while i < rows.len() {
        let mut j = i;
        while j + 1 < rows.len() && (rows[j + 1].powerscore_adj - rows[i].powerscore_adj).abs() < 1e-9 {
            j += 1;
        }
        for row in rows[i..=j].iter_mut() {
            row.rank_in_cohort = rank;
        }
        rank += (j - i + 1) as u32;
        i = j + 1;
    }
}

/// Whole-run driver (§4.8 intro, §5 "ranking is a single long-running job
/// per cohort group; intra-job parallelism is per cohort"): reads a
/// consistent snapshot of masters/games, ranks every distinct `(age_group,
/// gender)` cohort independently in parallel via `rayon`, and replaces
/// each cohort's rows in the repository one transaction at a time. A
/// cancelled run simply stops folding results in; nothing already
/// replaced is rolled back, and nothing not yet replaced is touched,
/// matching the "previous snapshot remains" guarantee for any cohort not
/// reached.
pub async fn run_ranking_for_all_cohorts<R: crate::repository::Repository>(
    repository: &R,
    config: &RankingConfig,
    as_of: NaiveDate,
) -> Result<Vec<RankingOutcome>, crate::error::RepositoryError> {
    use rayon::prelude::*;

    let masters = repository.all_masters().await?;
    let window_start = as_of - chrono::Duration::days(config.window_days);
    let games = repository.games_in_window(window_start).await?;

    let mut cohorts: Vec<Cohort> = masters
        .iter()
        .filter(|m| !m.is_deprecated)
        .filter_map(|m| Cohort::from_age_gender(m.age_group, m.gender))
        .collect();
    cohorts.sort_by_key(|c| (c.age_group.0, c.gender == crate::ids::Gender::Female));
    cohorts.dedup();

    let engine = RankingEngine::new(config.clone());
    let mut outcomes: Vec<(Cohort, RankingOutcome)> = cohorts
        .par_iter()
        .map(|&cohort| (cohort, engine.rank_cohort(cohort, &masters, &games, as_of)))
        .collect();

    apply_ml_layer_across_cohorts(&engine, &mut outcomes, &masters, &games, as_of);

    let mut results = Vec::with_capacity(outcomes.len());
    for (cohort, outcome) in outcomes {
        repository.replace_rankings(cohort, outcome.rows.clone()).await?;
        results.push(outcome);
    }
    Ok(results)
}

/// Minimum game age (§4.8 L13) for a completed game to enter the training
/// set; games younger than this are still scored by the fitted model (for
/// `ml_overperf` aggregation) but never used to fit it, so the residual
/// target isn't contaminated by a game whose outcome is still "current".
const L13_MIN_TRAINING_AGE_DAYS: i64 = 30;

/// Wires L13 across every cohort in one run (§9 "ML retraining... trains
/// one model per run on all cohorts"): fits a single residual model on
/// completed games older than 30 days using every cohort's `powerscore_core`
/// as the strength feature, predicts a recency-weighted `ml_overperf` per
/// team from every game in the window, then normalizes and applies it
/// within each cohort separately so a team's `ml_norm` never mixes with
/// another cohort's distribution.
fn apply_ml_layer_across_cohorts(
    engine: &RankingEngine,
    outcomes: &mut [(Cohort, RankingOutcome)],
    masters: &[MasterTeam],
    games: &[Game],
    as_of: NaiveDate,
) {
    let power_by_master: HashMap<MasterId, f64> = outcomes
        .iter()
        .flat_map(|(_, outcome)| outcome.rows.iter().map(|r| (r.master_id, r.powerscore_core)))
        .collect();
    let age_gender_by_master: HashMap<MasterId, (u8, crate::ids::Gender)> =
        masters.iter().map(|m| (m.master_id, (m.age_group.0, m.gender))).collect();

    let training_rows = build_ml_training_rows(games, &power_by_master, &age_gender_by_master, as_of);

    let Some(model) = engine.fit_residual_model(&training_rows) else {
        return;
    };

    let overperf_by_master = aggregate_ml_overperf(&model, games, &power_by_master, &age_gender_by_master, as_of);

    for (_, outcome) in outcomes.iter_mut() {
        let cohort_sos_norm: HashMap<MasterId, f64> =
            outcome.rows.iter().map(|r| (r.master_id, r.sos_normalized)).collect();
        let cohort_overperf: HashMap<MasterId, f64> = outcome
            .rows
            .iter()
            .filter_map(|r| overperf_by_master.get(&r.master_id).map(|v| (r.master_id, *v)))
            .collect();
        let rows = std::mem::take(&mut outcome.rows);
        outcome.rows = engine.apply_ml_residual_layer(rows, &training_rows, &cohort_sos_norm, &cohort_overperf);
    }
}

fn ml_feature_row(
    self_id: MasterId,
    opp_id: MasterId,
    self_goals: f64,
    opp_goals: f64,
    power_by_master: &HashMap<MasterId, f64>,
    age_gender_by_master: &HashMap<MasterId, (u8, crate::ids::Gender)>,
) -> Option<MlTrainingRow> {
    let self_power = *power_by_master.get(&self_id)?;
    let opp_power = *power_by_master.get(&opp_id)?;
    let (self_age, self_gender) = *age_gender_by_master.get(&self_id)?;
    let (opp_age, opp_gender) = *age_gender_by_master.get(&opp_id)?;

    let power_diff = opp_power - self_power;
    let expected_margin = 10.0 * power_diff;
    let actual_margin = self_goals - opp_goals;

    Some(MlTrainingRow {
        self_power,
        opp_power,
        power_diff,
        age_gap: (self_age as f64 - opp_age as f64).abs(),
        cross_gender: if self_gender == opp_gender { 0.0 } else { 1.0 },
        residual_target: actual_margin - expected_margin,
    })
}

fn build_ml_training_rows(
    games: &[Game],
    power_by_master: &HashMap<MasterId, f64>,
    age_gender_by_master: &HashMap<MasterId, (u8, crate::ids::Gender)>,
    as_of: NaiveDate,
) -> Vec<MlTrainingRow> {
    let mut rows = Vec::new();
    for g in games {
        let (Some(hs), Some(as_)) = (g.home_score, g.away_score) else {
            continue;
        };
        if (as_of - g.game_date).num_days() < L13_MIN_TRAINING_AGE_DAYS {
            continue;
        }
        let hs = hs as f64;
        let as_ = as_ as f64;
        if let Some(row) = ml_feature_row(
            g.home_master_id,
            g.away_master_id,
            hs,
            as_,
            power_by_master,
            age_gender_by_master,
        ) {
            rows.push(row);
        }
        if let Some(row) = ml_feature_row(
            g.away_master_id,
            g.home_master_id,
            as_,
            hs,
            power_by_master,
            age_gender_by_master,
        ) {
            rows.push(row);
        }
    }
    rows
}

/// Predicts a residual for every game in the window (not just the training
/// subset) and aggregates it per team as a recency-weighted average, the
/// same `exp(-0.05 * days_ago)` weight L3 uses.
fn aggregate_ml_overperf(
    model: &ResidualModel,
    games: &[Game],
    power_by_master: &HashMap<MasterId, f64>,
    age_gender_by_master: &HashMap<MasterId, (u8, crate::ids::Gender)>,
    as_of: NaiveDate,
) -> HashMap<MasterId, f64> {
    let mut weighted_sum: HashMap<MasterId, f64> = HashMap::new();
    let mut weight_total: HashMap<MasterId, f64> = HashMap::new();

    let mut accumulate = |team: MasterId, opp: MasterId, team_goals: f64, opp_goals: f64, game_date: NaiveDate| {
        let Some(row) = ml_feature_row(team, opp, team_goals, opp_goals, power_by_master, age_gender_by_master) else {
            return;
        };
        let predicted = model.predict(&row);
        let days_ago = (as_of - game_date).num_days().max(0) as f64;
        let weight = (-L3_RECENCY_DECAY * days_ago).exp();
        *weighted_sum.entry(team).or_insert(0.0) += predicted * weight;
        *weight_total.entry(team).or_insert(0.0) += weight;
    };

    for g in games {
        let (Some(hs), Some(as_)) = (g.home_score, g.away_score) else {
            continue;
        };
        accumulate(g.home_master_id, g.away_master_id, hs as f64, as_ as f64, g.game_date);
        accumulate(g.away_master_id, g.home_master_id, as_ as f64, hs as f64, g.game_date);
    }

    weighted_sum
        .into_iter()
        .map(|(team, sum)| {
            let total = weight_total.get(&team).copied().unwrap_or(0.0);
            (team, if total > 0.0 { sum / total } else { 0.0 })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Gender, ProviderId};

    fn master(name: &str, age: u8, gender: Gender, state: &str) -> MasterTeam {
        MasterTeam {
            master_id: MasterId::new(),
            team_name: name.to_string(),
            club_name: None,
            age_group: AgeGroup::new(age),
            gender,
            state_code: Some(state.to_string()),
            is_deprecated: false,
        }
    }

    fn game(home: MasterId, away: MasterId, hs: u16, as_: u16, date: NaiveDate) -> Game {
        Game {
            game_uid: format!("test:{date}:{home}:{away}"),
            provider_id: ProviderId(1),
            home_master_id: home,
            away_master_id: away,
            home_provider_id: "h".to_string(),
            away_provider_id: "a".to_string(),
            home_score: Some(hs),
            away_score: Some(as_),
            game_date: date,
        }
    }

    #[test]
    fn cross_age_anchor_spans_the_documented_range() {
        assert!((cross_age_anchor(AgeGroup::new(10)) - 0.40).abs() < 1e-9);
        assert!((cross_age_anchor(AgeGroup::new(18)) - 1.00).abs() < 1e-9);
    }

    #[test]
    fn ranks_are_a_permutation_with_ties_sharing_lowest_rank() {
        let engine = RankingEngine::new(RankingConfig::default());
        let a = master("A", 14, Gender::Male, "TX");
        let b = master("B", 14, Gender::Male, "TX");
        let c = master("C", 14, Gender::Male, "TX");
        let masters = vec![a.clone(), b.clone(), c.clone()];

        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let games = vec![
            game(a.master_id, b.master_id, 2, 1, today - chrono::Duration::days(10)),
            game(b.master_id, c.master_id, 1, 1, today - chrono::Duration::days(5)),
        ];

        let cohort = Cohort { age_group: AgeGroup::new(14), gender: Gender::Male };
        let outcome = engine.rank_cohort(cohort, &masters, &games, today);

        let mut ranks: Vec<u32> = outcome.rows.iter().map(|r| r.rank_in_cohort).collect();
        ranks.sort_unstable();
        assert_eq!(ranks.first(), Some(&1));
        assert!(ranks.iter().all(|r| *r >= 1 && *r as usize <= outcome.rows.len()));
    }

    #[test]
    fn zero_games_team_still_gets_a_sos_equal_to_unranked_base_dampened_to_half() {
        let engine = RankingEngine::new(RankingConfig::default());
        let lone = master("Lonely", 12, Gender::Female, "CA");
        let masters = vec![lone.clone()];
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let cohort = Cohort { age_group: AgeGroup::new(12), gender: Gender::Female };
        let outcome = engine.rank_cohort(cohort, &masters, &[], today);
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].games_played, 0);
    }

    #[test]
    fn one_game_team_is_capped_by_the_provisional_multiplier() {
        assert_eq!(provisional_multiplier(1), 0.85);
        assert_eq!(provisional_multiplier(10), 0.95);
        assert_eq!(provisional_multiplier(20), 1.00);
    }

    #[test]
    fn l2_goal_differential_clamp_feeds_through_to_offense_and_defense() {
        // A 20-0 blowout and a 6-0 game should produce identical offense/
        // defense aggregates for both sides, because L2 caps the winning
        // side's goals at the loser's score + 6 before anything downstream
        // (L4 defense, L7 offense aggregation) ever sees the raw score.
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let cohort = Cohort { age_group: AgeGroup::new(12), gender: Gender::Male };
        let engine = RankingEngine::new(RankingConfig::default());

        let blowout_teams = vec![
            master("Winner", 12, Gender::Male, "TX"),
            master("Loser", 12, Gender::Male, "TX"),
        ];
        let blowout_games = vec![game(blowout_teams[0].master_id, blowout_teams[1].master_id, 20, 0, today)];
        let blowout = engine.rank_cohort(cohort, &blowout_teams, &blowout_games, today);

        let capped_teams = vec![
            master("Winner", 12, Gender::Male, "TX"),
            master("Loser", 12, Gender::Male, "TX"),
        ];
        let capped_games = vec![game(capped_teams[0].master_id, capped_teams[1].master_id, 6, 0, today)];
        let capped = engine.rank_cohort(cohort, &capped_teams, &capped_games, today);

        let blowout_winner = blowout.rows.iter().find(|r| r.team_name == "Winner").unwrap();
        let capped_winner = capped.rows.iter().find(|r| r.team_name == "Winner").unwrap();
        assert!(
            (blowout_winner.offense_raw - capped_winner.offense_raw).abs() < 1e-9,
            "uncapped offense_raw {} vs capped {}",
            blowout_winner.offense_raw,
            capped_winner.offense_raw
        );

        let blowout_loser = blowout.rows.iter().find(|r| r.team_name == "Loser").unwrap();
        let capped_loser = capped.rows.iter().find(|r| r.team_name == "Loser").unwrap();
        assert!(
            (blowout_loser.defense_raw - capped_loser.defense_raw).abs() < 1e-9,
            "uncapped defense_raw {} vs capped {}",
            blowout_loser.defense_raw,
            capped_loser.defense_raw
        );
    }

    #[test]
    fn sos_and_powerscore_stay_within_unit_interval() {
        let engine = RankingEngine::new(RankingConfig::default());
        let teams: Vec<MasterTeam> = (0..6).map(|i| master(&format!("T{i}"), 16, Gender::Male, "TX")).collect();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut games = Vec::new();
        for i in 0..teams.len() {
            for j in (i + 1)..teams.len() {
                games.push(game(teams[i].master_id, teams[j].master_id, (i as u16) % 4, (j as u16) % 3, today - chrono::Duration::days(i as i64 + j as i64)));
            }
        }

        let cohort = Cohort { age_group: AgeGroup::new(16), gender: Gender::Male };
        let outcome = engine.rank_cohort(cohort, &teams, &games, today);
        for row in &outcome.rows {
            assert!((0.0..=1.0).contains(&row.sos_raw));
            assert!((0.0..=1.0).contains(&row.sos_normalized));
            assert!((0.0..=1.0).contains(&row.powerscore_adj));
        }
    }

    #[test]
    fn ml_disabled_on_weak_schedule_leaves_powerscore_unchanged() {
        let engine = RankingEngine::new(RankingConfig::default());
        let lone = master("Weak", 13, Gender::Male, "TX");
        let masters = vec![lone.clone()];
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let cohort = Cohort { age_group: AgeGroup::new(13), gender: Gender::Male };
        let outcome = engine.rank_cohort(cohort, &masters, &[], today);

        let mut sos_norm_map = HashMap::new();
        sos_norm_map.insert(lone.master_id, 0.30);
        let mut overperf_map = HashMap::new();
        overperf_map.insert(lone.master_id, 2.0);

        // Fewer than ml_train_min_rows training rows: layer is a no-op.
        let rows = engine.apply_ml_residual_layer(outcome.rows, &[], &sos_norm_map, &overperf_map);
        assert!(rows[0].powerscore_ml.is_none());
    }

    #[test]
    fn regional_bubble_is_dampened_regardless_of_apparent_opponent_strength() {
        // Five teams, all in the same state, who only ever play each other
        // (unique_states == 1 for every one of them). The SCF term clamps
        // to its floor of 0.4 in this case, which caps how far SOS can be
        // pulled up no matter how lopsided the scores look from inside the
        // bubble: 0.5 + 0.4*(raw-0.5) maxes out at 0.7, and the PageRank
        // restart pulls that down again, so the emitted SOS can never clear
        // ~0.67 even for a team that wins every game by a landslide.
        let engine = RankingEngine::new(RankingConfig::default());
        let teams: Vec<MasterTeam> = (0..5).map(|i| master(&format!("Bubble{i}"), 12, Gender::Male, "OK")).collect();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let mut games = Vec::new();
        let mut day_offset = 0i64;
        for _round in 0..3 {
            for i in 0..teams.len() {
                for j in (i + 1)..teams.len() {
                    games.push(game(teams[i].master_id, teams[j].master_id, 6, 0, today - chrono::Duration::days(day_offset)));
                    day_offset += 1;
                }
            }
        }

        let cohort = Cohort { age_group: AgeGroup::new(12), gender: Gender::Male };
        let outcome = engine.rank_cohort(cohort, &teams, &games, today);

        for row in &outcome.rows {
            assert!(
                row.sos_raw <= 0.67 + 1e-9,
                "single-state bubble SOS should be dampened toward the 0.5 anchor, got {}",
                row.sos_raw
            );
        }
    }

    #[test]
    fn ml_layer_wiring_trains_on_old_games_and_scores_every_game() {
        let engine = RankingEngine::new(RankingConfig::default());
        let teams: Vec<MasterTeam> = (0..8).map(|i| master(&format!("T{i}"), 14, Gender::Male, "TX")).collect();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        // Enough completed games older than 30 days to clear ml_train_min_rows
        // (each game contributes two training rows).
        let mut games = Vec::new();
        let mut day_offset = 40i64;
        for i in 0..teams.len() {
            for j in (i + 1)..teams.len() {
                games.push(game(teams[i].master_id, teams[j].master_id, (i as u16) % 3, (j as u16) % 2, today - chrono::Duration::days(day_offset)));
                day_offset += 1;
            }
        }

        let power_by_master: HashMap<MasterId, f64> = teams.iter().map(|m| (m.master_id, 0.5)).collect();
        let age_gender_by_master: HashMap<MasterId, (u8, Gender)> =
            teams.iter().map(|m| (m.master_id, (m.age_group.0, m.gender))).collect();

        let training_rows = build_ml_training_rows(&games, &power_by_master, &age_gender_by_master, today);
        assert_eq!(training_rows.len(), games.len() * 2);
        assert!(training_rows.len() >= RankingConfig::default().ml_train_min_rows);

        let model = engine.fit_residual_model(&training_rows).expect("enough rows to fit");
        let overperf = aggregate_ml_overperf(&model, &games, &power_by_master, &age_gender_by_master, today);
        // Every team played in this round-robin, so every team gets an
        // aggregated (recency-weighted) overperformance estimate.
        for team in &teams {
            assert!(overperf.contains_key(&team.master_id));
        }
    }

    #[test]
    fn ml_layer_is_a_noop_when_games_are_too_recent_to_train_on() {
        let teams: Vec<MasterTeam> = (0..4).map(|i| master(&format!("T{i}"), 14, Gender::Male, "TX")).collect();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        // All games within the last 30 days: none qualify as training rows.
        let games = vec![game(teams[0].master_id, teams[1].master_id, 2, 1, today - chrono::Duration::days(5))];
        let power_by_master: HashMap<MasterId, f64> = teams.iter().map(|m| (m.master_id, 0.5)).collect();
        let age_gender_by_master: HashMap<MasterId, (u8, Gender)> =
            teams.iter().map(|m| (m.master_id, (m.age_group.0, m.gender))).collect();

        let training_rows = build_ml_training_rows(&games, &power_by_master, &age_gender_by_master, today);
        assert!(training_rows.is_empty());
    }
}
