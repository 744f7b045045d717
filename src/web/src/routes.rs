use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use core::ids::{AgeGroup, Cohort, Gender};

use crate::{ApiError, ApiResult, AppState};

/// Read-only ranking/review surface (spec §6 "Ranking output view"). No
/// route here ever writes through `repository` — ingestion and matching
/// are driven by the orchestrator, not the HTTP layer.
pub struct ServerRoutes;

impl ServerRoutes {
    pub fn create() -> Router<AppState> {
        Router::<AppState>::new()
            .route("/health", get(health_action))
            .route("/cohorts", get(list_cohorts_action))
            .route("/rankings/{age_group}/{gender}", get(rankings_action))
            .route("/review-queue", get(review_queue_action))
    }
}

async fn health_action(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "storage_handle_refreshes": state.repository.refresh_call_count(),
    }))
}

async fn list_cohorts_action(State(state): State<AppState>) -> impl IntoResponse {
    let cohorts: Vec<String> = state.repository.all_cohorts().await.iter().map(Cohort::to_string).collect();
    Json(json!({ "cohorts": cohorts }))
}

#[derive(Deserialize)]
pub struct RankingsPathParams {
    pub age_group: u8,
    pub gender: String,
}

/// `age_group` is the bare U-age number (e.g. `14` for `u14`); `gender` is
/// any surface form `Gender::parse` accepts (`Male`, `Boys`, `m`, ...).
async fn rankings_action(
    State(state): State<AppState>,
    Path(params): Path<RankingsPathParams>,
) -> ApiResult<impl IntoResponse> {
    let age_group = AgeGroup::new(params.age_group);
    let gender = Gender::parse(&params.gender)
        .ok_or_else(|| ApiError::BadRequest(format!("unrecognized gender '{}'", params.gender)))?;

    let cohort = Cohort::from_age_gender(age_group, gender)
        .ok_or_else(|| ApiError::BadRequest(format!("{age_group} is not a ranked cohort")))?;

    let rows = state.repository.rankings_for(cohort).await;
    if rows.is_empty() {
        return Err(ApiError::NotFound(format!("no rankings published yet for {cohort}")));
    }

    Ok(Json(rows))
}

async fn review_queue_action(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.repository.pending_review_entries().await)
}
