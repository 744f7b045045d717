//! Ambient configuration layer (SPEC_FULL §1.1, §6). Reads the enumerated
//! environment variables into a single immutable `RankingConfig` /
//! `MatchingPolicy` pair; any missing/invalid required variable raises
//! `ConfigError` before ingestion or ranking starts (§7 `FatalConfigError`).

use std::env;
use std::str::FromStr;

use crate::error::ConfigError;

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
            reason: "failed to parse".to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: raw,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

/// Ranking-engine knobs exposed as environment variables (§6). Every field
/// has a spec-documented default; `from_env` never fails on an unset
/// variable, only on one present with an unparseable value.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingConfig {
    pub window_days: i64,
    pub opponent_adjust_enabled: bool,
    pub opponent_adjust_clip_min: f64,
    pub opponent_adjust_clip_max: f64,
    pub sos_iterations: u32,
    pub sos_transitivity_lambda: f64,
    pub sos_repeat_cap: u32,
    pub unranked_sos_base: f64,
    pub ml_alpha: f64,
    pub ml_residual_clip_goals: f64,
    pub ml_train_min_rows: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        RankingConfig {
            window_days: 365,
            opponent_adjust_enabled: true,
            opponent_adjust_clip_min: 0.4,
            opponent_adjust_clip_max: 1.6,
            sos_iterations: 3,
            sos_transitivity_lambda: 0.20,
            sos_repeat_cap: 2,
            unranked_sos_base: 0.35,
            ml_alpha: 0.15,
            ml_residual_clip_goals: 6.0,
            ml_train_min_rows: 30,
        }
    }
}

impl RankingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = RankingConfig::default();
        Ok(RankingConfig {
            window_days: parse_var("RANKING_WINDOW_DAYS", d.window_days)?,
            opponent_adjust_enabled: parse_bool("OPPONENT_ADJUST_ENABLED", d.opponent_adjust_enabled)?,
            opponent_adjust_clip_min: parse_var("OPPONENT_ADJUST_CLIP_MIN", d.opponent_adjust_clip_min)?,
            opponent_adjust_clip_max: parse_var("OPPONENT_ADJUST_CLIP_MAX", d.opponent_adjust_clip_max)?,
            sos_iterations: parse_var("SOS_ITERATIONS", d.sos_iterations)?,
            sos_transitivity_lambda: parse_var("SOS_TRANSITIVITY_LAMBDA", d.sos_transitivity_lambda)?,
            sos_repeat_cap: parse_var("SOS_REPEAT_CAP", d.sos_repeat_cap)?,
            unranked_sos_base: parse_var("UNRANKED_SOS_BASE", d.unranked_sos_base)?,
            ml_alpha: parse_var("ML_ALPHA", d.ml_alpha)?,
            ml_residual_clip_goals: parse_var("ML_RESIDUAL_CLIP_GOALS", d.ml_residual_clip_goals)?,
            ml_train_min_rows: parse_var("ML_TRAIN_MIN_ROWS", d.ml_train_min_rows)?,
        })
    }
}

/// Per-provider matcher policy (§4.5 table). Constructed by config/provider
/// registration, not solely from environment variables — most deployments
/// have several providers, each with its own thresholds — but the handful
/// of matching-wide defaults still read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingPolicy {
    pub threshold_fuzzy: f64,
    pub threshold_auto_approve: f64,
    pub threshold_review: f64,
    pub may_create_team: bool,
    pub strict_age_on_id: bool,
    pub club_boost: f64,
    pub club_variant_boost: f64,
    pub league_match_bonus: f64,
    pub league_mismatch_penalty: f64,
    pub pre_filter_state: bool,
    pub fuzzy_confidence_ceiling: f64,
    pub age_validation_from_name: bool,
    pub connection_refresh_interval: u64,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        MatchingPolicy {
            threshold_fuzzy: 0.70,
            threshold_auto_approve: 0.90,
            threshold_review: 0.70,
            may_create_team: true,
            strict_age_on_id: true,
            club_boost: 0.15,
            club_variant_boost: 0.25,
            league_match_bonus: 0.05,
            league_mismatch_penalty: -0.08,
            pre_filter_state: false,
            fuzzy_confidence_ceiling: 0.99,
            age_validation_from_name: true,
            connection_refresh_interval: 1000,
        }
    }
}

impl MatchingPolicy {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = MatchingPolicy::default();
        Ok(MatchingPolicy {
            club_variant_boost: parse_var("MATCHING_CLUB_VARIANT_BOOST", d.club_variant_boost)?,
            fuzzy_confidence_ceiling: parse_var("MATCHING_FUZZY_CONFIDENCE_CEILING", d.fuzzy_confidence_ceiling)?,
            age_validation_from_name: parse_bool("MATCHING_AGE_VALIDATION_FROM_NAME", d.age_validation_from_name)?,
            connection_refresh_interval: parse_var(
                "MATCHING_CONNECTION_REFRESH_INTERVAL",
                d.connection_refresh_interval,
            )?,
            ..d
        })
    }

    /// Validates the threshold ordering invariant relied on by the
    /// cascade's outcome rules (§4.5): auto-approve must sit at or above
    /// the review band, which must sit at or above the fuzzy floor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold_review <= self.threshold_auto_approve) {
            return Err(ConfigError::Invalid {
                name: "MATCHING_THRESHOLDS",
                value: format!("{}/{}", self.threshold_review, self.threshold_auto_approve),
                reason: "threshold_review must be <= threshold_auto_approve".to_string(),
            });
        }
        if !(self.threshold_fuzzy <= self.threshold_review) {
            return Err(ConfigError::Invalid {
                name: "MATCHING_THRESHOLDS",
                value: format!("{}/{}", self.threshold_fuzzy, self.threshold_review),
                reason: "threshold_fuzzy must be <= threshold_review".to_string(),
            });
        }
        Ok(())
    }
}
