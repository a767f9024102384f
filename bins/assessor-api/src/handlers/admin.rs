// Admin handlers. Authentication is enforced upstream of this service.

use assessor_common::types::{Challenge, ChallengeStep, Exercise, TestCase};
use assessor_engine::catalog::{CatalogDocument, ExerciseFilter, Page};
use assessor_engine::harness::DryRunReport;
use assessor_engine::submission::Submission;
use assessor_engine::tracker::ReviewResolution;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::metrics;
use crate::state::AppState;

type Created<T> = (StatusCode, Json<T>);

fn created<T>(value: T) -> Created<T> {
    (StatusCode::CREATED, Json(value))
}

// Exercises

pub async fn list_exercises(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ExerciseFilter>,
) -> Json<Page<Exercise>> {
    Json(state.catalog.snapshot().list_exercises(&filter, false))
}

pub async fn create_exercise(
    State(state): State<Arc<AppState>>,
    Json(exercise): Json<Exercise>,
) -> ApiResult<Created<Exercise>> {
    let exercise = state.catalog.create_exercise(exercise)?;
    info!(exercise_id = %exercise.id, "exercise created");
    Ok(created(exercise))
}

pub async fn get_exercise(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Exercise>> {
    Ok(Json(state.catalog.snapshot().exercise(id)?.clone()))
}

pub async fn update_exercise(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(exercise): Json<Exercise>,
) -> ApiResult<Json<Exercise>> {
    Ok(Json(state.catalog.update_exercise(id, exercise)?))
}

pub async fn delete_exercise(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.catalog.delete_exercise(id)?;
    info!(exercise_id = %id, "exercise deleted");
    Ok(StatusCode::NO_CONTENT)
}

// Challenges

pub async fn list_challenges(
    State(state): State<Arc<AppState>>,
    Path(exercise_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Challenge>>> {
    let snapshot = state.catalog.snapshot();
    snapshot.exercise(exercise_id)?;
    Ok(Json(snapshot.challenges_of(exercise_id).into_iter().cloned().collect()))
}

pub async fn create_challenge(
    State(state): State<Arc<AppState>>,
    Path(exercise_id): Path<Uuid>,
    Json(challenge): Json<Challenge>,
) -> ApiResult<Created<Challenge>> {
    let challenge = state.catalog.create_challenge(exercise_id, challenge)?;
    info!(challenge_id = %challenge.id, exercise_id = %exercise_id, "challenge created");
    Ok(created(challenge))
}

pub async fn get_challenge(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Challenge>> {
    Ok(Json(state.catalog.snapshot().challenge(id)?.clone()))
}

pub async fn update_challenge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(challenge): Json<Challenge>,
) -> ApiResult<Json<Challenge>> {
    Ok(Json(state.catalog.update_challenge(id, challenge)?))
}

pub async fn delete_challenge(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.catalog.delete_challenge(id)?;
    info!(challenge_id = %id, "challenge deleted");
    Ok(StatusCode::NO_CONTENT)
}

// Steps

pub async fn list_steps(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ChallengeStep>>> {
    let snapshot = state.catalog.snapshot();
    snapshot.challenge(challenge_id)?;
    Ok(Json(snapshot.steps_of(challenge_id).into_iter().cloned().collect()))
}

pub async fn create_step(
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<Uuid>,
    Json(step): Json<ChallengeStep>,
) -> ApiResult<Created<ChallengeStep>> {
    let step = state.catalog.create_step(challenge_id, step)?;
    info!(step_id = %step.id, challenge_id = %challenge_id, "step created");
    Ok(created(step))
}

pub async fn get_step(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<ChallengeStep>> {
    Ok(Json(state.catalog.snapshot().step(id)?.clone()))
}

pub async fn update_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(step): Json<ChallengeStep>,
) -> ApiResult<Json<ChallengeStep>> {
    Ok(Json(state.catalog.update_step(id, step)?))
}

pub async fn delete_step(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.catalog.delete_step(id)?;
    info!(step_id = %id, "step deleted");
    Ok(StatusCode::NO_CONTENT)
}

// Test cases

pub async fn list_testcases(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
) -> ApiResult<Json<Vec<TestCase>>> {
    let snapshot = state.catalog.snapshot();
    snapshot.step(step_id)?;
    Ok(Json(snapshot.testcases_of(step_id).into_iter().cloned().collect()))
}

pub async fn create_testcase(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    Json(testcase): Json<TestCase>,
) -> ApiResult<Created<TestCase>> {
    let testcase = state.catalog.create_testcase(step_id, testcase)?;
    info!(
        testcase_id = %testcase.id,
        step_id = %step_id,
        testcase_type = %testcase.testcase_type(),
        "test case created"
    );
    Ok(created(testcase))
}

pub async fn get_testcase(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<TestCase>> {
    Ok(Json(state.catalog.snapshot().testcase(id)?.clone()))
}

pub async fn update_testcase(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(testcase): Json<TestCase>,
) -> ApiResult<Json<TestCase>> {
    Ok(Json(state.catalog.update_testcase(id, testcase)?))
}

pub async fn delete_testcase(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.catalog.delete_testcase(id)?;
    info!(testcase_id = %id, "test case deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub rows: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub imported: usize,
    pub test_cases: Vec<TestCase>,
}

/// POST /api/admin/steps/:id/testcases/import
pub async fn import_testcases(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<Created<ImportResponse>> {
    let test_cases = state.harness.import_testcases(step_id, request.rows)?;
    Ok(created(ImportResponse {
        imported: test_cases.len(),
        test_cases,
    }))
}

// Harness

/// POST /api/admin/steps/:id/test
pub async fn dry_run(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    Json(submission): Json<Submission>,
) -> ApiResult<Json<DryRunReport>> {
    let report = state.harness.dry_run(step_id, &submission).await?;
    metrics::record_results(&report.execution_results);
    Ok(Json(report))
}

/// POST /api/admin/steps/:id/validate
pub async fn validate_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
) -> ApiResult<Json<DryRunReport>> {
    let report = state.harness.validate_step(step_id).await?;
    metrics::record_results(&report.execution_results);
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub testcase_id: Uuid,
    pub passed: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// POST /api/admin/user-challenges/:id/steps/:step_id/reviews
pub async fn resolve_review(
    State(state): State<Arc<AppState>>,
    Path((user_challenge_id, step_id)): Path<(Uuid, Uuid)>,
    Json(review): Json<ReviewRequest>,
) -> ApiResult<Json<ReviewResolution>> {
    let resolution = state
        .grading
        .resolve_review(user_challenge_id, step_id, review.testcase_id, review.passed, review.note)
        .await?;
    Ok(Json(resolution))
}

/// GET /api/admin/catalog/export
pub async fn export_catalog(State(state): State<Arc<AppState>>) -> Json<CatalogDocument> {
    Json(state.catalog.snapshot().to_document())
}
