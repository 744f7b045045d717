use thiserror::Error;

/// Raised only on null/empty input (§4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot normalize an empty team name")]
pub struct NormalizationError;

/// A batch record that cannot be persisted at all; the record is
/// quarantined and the batch continues (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid game_date {raw:?}, expected YYYY-MM-DD")]
    BadDate { raw: String },
    #[error("non-numeric score {raw:?} for field {field}")]
    NonNumericScore { field: &'static str, raw: String },
    #[error("missing provider_team_id for provider {provider_code}")]
    MissingProviderTeamId { provider_code: String },
    #[error("unrecognized gender {raw:?}")]
    UnrecognizedGender { raw: String },
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
}

/// Raised by the repository boundary. Transient errors are retried with
/// jittered backoff by the caller (§5, §7); `Permanent` escalates to
/// `BatchFailure` after the retry budget is exhausted.
#[derive(Debug, Error, Clone)]
pub enum RepositoryError {
    #[error("transient storage error after {attempts} attempt(s): {message}")]
    Transient { attempts: u8, message: String },
    #[error("permanent storage error: {message}")]
    Permanent { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
}

/// A whole batch could not be completed and is recorded in the run's
/// failed-batches list; the run reports but does not abort (§7).
#[derive(Debug, Error, Clone)]
#[error("batch {batch_index} failed after exhausting retries: {source}")]
pub struct BatchFailure {
    pub batch_index: usize,
    pub source: RepositoryError,
}

/// Missing or invalid enumerated configuration aborts the process before
/// any work begins (§6, §7).
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for environment variable {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Non-fatal: emitted alongside a ranking run whose last iteration did not
/// reach the convergence tolerance within the iteration budget (§4.8, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingConvergenceWarning {
    pub cohort_iterations_run: u32,
}

/// Errors surfaced while pulling records from the injected scraper
/// collaborator or while an ingestion batch is being assembled.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("scraper collaborator failed: {0}")]
    Scraper(String),
}
