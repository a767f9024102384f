// Candidate-facing handlers

use assessor_common::results::SubmissionMode;
use assessor_common::types::{Challenge, Exercise};
use assessor_engine::catalog::{ExerciseFilter, Page};
use assessor_engine::submission::Submission;
use assessor_engine::tracker::{ChallengeView, SaveResponse, StartResponse, StepView, SubmissionResponse};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::SessionToken;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default, alias = "anonymousIdentifier")]
    pub anonymous_identifier: Option<String>,
}

/// GET /api/exercises
pub async fn list_exercises(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ExerciseFilter>,
) -> Json<Page<Exercise>> {
    Json(state.catalog.snapshot().list_exercises(&filter, true))
}

/// GET /api/exercises/:id/challenges
pub async fn list_challenges(
    State(state): State<Arc<AppState>>,
    Path(exercise_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Challenge>>> {
    let snapshot = state.catalog.snapshot();
    let exercise = snapshot.exercise(exercise_id)?;
    if !exercise.status.is_public() {
        return Err(assessor_common::error::AssessError::not_found("exercise", exercise_id).into());
    }
    Ok(Json(
        snapshot
            .challenges_of(exercise_id)
            .into_iter()
            .filter(|c| c.status.is_public())
            .cloned()
            .collect(),
    ))
}

/// GET /api/challenges/:id
pub async fn get_challenge(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<Uuid>,
    token: SessionToken,
) -> ApiResult<Json<ChallengeView>> {
    Ok(Json(state.grading.challenge_view(challenge_id, token.as_deref()).await?))
}

/// POST /api/challenges/:id/start
pub async fn start_challenge(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<Uuid>,
    token: SessionToken,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Json<StartResponse>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let started = state
        .grading
        .start_challenge(challenge_id, token.as_deref(), request.anonymous_identifier.as_deref())
        .await?;
    info!(
        challenge_id = %challenge_id,
        user_challenge_id = %started.user_challenge.id,
        resumed = started.resumed,
        "session issued"
    );
    Ok(Json(started))
}

/// GET /api/steps/:id/load
pub async fn load_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    token: SessionToken,
) -> ApiResult<Json<StepView>> {
    Ok(Json(state.grading.load_step(step_id, token.as_deref()).await?))
}

/// POST /api/steps/:id/save
pub async fn save_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    token: SessionToken,
    Json(submission): Json<Submission>,
) -> ApiResult<Json<SaveResponse>> {
    Ok(Json(state.grading.save_step(step_id, token.as_deref(), &submission).await?))
}

/// POST /api/steps/:id/test
pub async fn test_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    token: SessionToken,
    Json(submission): Json<Submission>,
) -> ApiResult<Json<SubmissionResponse>> {
    run(&state, step_id, token, submission, SubmissionMode::Test).await
}

/// POST /api/steps/:id/submit
pub async fn submit_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    token: SessionToken,
    Json(submission): Json<Submission>,
) -> ApiResult<Json<SubmissionResponse>> {
    run(&state, step_id, token, submission, SubmissionMode::Submit).await
}

async fn run(
    state: &AppState,
    step_id: Uuid,
    token: SessionToken,
    submission: Submission,
    mode: SubmissionMode,
) -> ApiResult<Json<SubmissionResponse>> {
    let timer = metrics::SUBMISSION_SECONDS
        .with_label_values(&[mode.as_str()])
        .start_timer();
    let result = match mode {
        SubmissionMode::Test => state.grading.test_step(step_id, token.as_deref(), &submission).await,
        SubmissionMode::Submit => state.grading.submit_step(step_id, token.as_deref(), &submission).await,
    };
    timer.observe_duration();
    metrics::record_run(mode, &result);
    result.map(Json).map_err(ApiError::from)
}

/// GET /api/languages
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.grading.languages().list_languages())
}
