//! Candidate-facing grading flow: start, load, autosave, practice runs and
//! graded submissions, plus admin review resolution.
//!
//! Graded writes for one user challenge are serialized through the store's
//! submission lock; autosave goes around it and only touches editor content.

use assessor_common::error::{AssessError, AssessResult};
use assessor_common::progress::{StoredExecution, UserChallenge, UserChallengeStatus, UserProgress};
use assessor_common::results::{Audience, ExecutionResult, Outcome, SubmissionMode, Summary};
use assessor_common::types::{Challenge, ChallengeStep, ExecutionEnvironment, TestCase, TestcaseType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, StepBundle};
use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::languages::LanguageRegistry;
use crate::scorer::{final_step_id, next_step, score_step};
use crate::session::{generate_token, SessionManager};
use crate::store::ProgressStore;
use crate::submission::{map_artifact, Submission};

/// Added to the submission budget so the lock outlives any evaluation.
const LOCK_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRef {
    pub id: Uuid,
    pub title: String,
    pub order_index: u32,
}

impl StepRef {
    fn of(step: &ChallengeStep) -> Self {
        Self {
            id: step.id,
            title: step.title.clone(),
            order_index: step.order_index,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub session_token: String,
    pub anonymous_identifier: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub resumed: bool,
    pub previous_status: UserChallengeStatus,
    pub user_challenge: UserChallenge,
    pub current_step: Option<StepRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub id: Uuid,
    pub title: String,
    pub order_index: u32,
    pub is_final_step: bool,
    pub test_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeView {
    pub challenge: Challenge,
    pub steps: Vec<StepSummary>,
    /// Present only when a valid session for this challenge was presented.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_challenge: Option<UserChallenge>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastExecutionView {
    pub mode: SubmissionMode,
    pub evaluated_at: DateTime<Utc>,
    pub summary: Summary,
    pub execution_results: Vec<ExecutionResult>,
}

/// Stored progress as a candidate may see it.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    pub step_id: Uuid,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub is_completed: bool,
    pub score: Option<f64>,
    pub last_edited: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<LastExecutionView>,
}

impl ProgressView {
    fn of(progress: &UserProgress, testcases: &[TestCase], audience: Audience) -> Self {
        let last_execution = progress.last_execution_result.as_ref().map(|exec| LastExecutionView {
            mode: exec.mode,
            evaluated_at: exec.evaluated_at,
            summary: exec.summary,
            execution_results: present_all(testcases, &exec.outcomes, audience),
        });
        Self {
            step_id: progress.step_id,
            tests_passed: progress.tests_passed,
            tests_total: progress.tests_total,
            is_completed: progress.is_completed,
            score: progress.score,
            last_edited: progress.last_edited,
            last_execution,
        }
    }

    fn counts_only(progress: &UserProgress) -> Self {
        Self {
            step_id: progress.step_id,
            tests_passed: progress.tests_passed,
            tests_total: progress.tests_total,
            is_completed: progress.is_completed,
            score: progress.score,
            last_edited: progress.last_edited,
            last_execution: None,
        }
    }
}

/// A visible test case as shown in the editor.
#[derive(Debug, Clone, Serialize)]
pub struct TestCasePreview {
    pub id: Uuid,
    pub name: String,
    pub order_index: u32,
    pub testcase_type: TestcaseType,
    pub is_example: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub expected_output: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub challenge_id: Uuid,
    pub environment: ExecutionEnvironment,
    /// The step without its reference solution or scoring weights.
    pub step: ChallengeStep,
    pub content: String,
    pub language: Option<String>,
    pub test_cases: Vec<TestCasePreview>,
    pub hidden_test_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveResponse {
    pub step_id: Uuid,
    pub saved: bool,
    pub last_edited: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResponse {
    pub mode: SubmissionMode,
    pub execution_results: Vec<ExecutionResult>,
    pub summary: Summary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_progress: Option<ProgressView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_challenge: Option<UserChallenge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<StepRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResolution {
    pub step_progress: ProgressView,
    pub user_challenge: UserChallenge,
    pub summary: Summary,
}

/// Present outcomes in test-case order; outcomes for cases no longer in the
/// catalog are dropped.
fn present_all(testcases: &[TestCase], outcomes: &[Outcome], audience: Audience) -> Vec<ExecutionResult> {
    outcomes
        .iter()
        .filter_map(|outcome| {
            testcases
                .iter()
                .find(|tc| tc.id == outcome.testcase_id)
                .map(|tc| ExecutionResult::present(tc, outcome, audience))
        })
        .collect()
}

/// Advance the attempt after a completed step. Returns the next step and
/// whether this call completed the challenge.
fn advance(uc: &mut UserChallenge, bundle: &StepBundle, now: DateTime<Utc>) -> (Option<StepRef>, bool) {
    let next = next_step(&bundle.steps, &bundle.step).map(StepRef::of);
    if let Some(next) = &next {
        if uc.current_step_id.map_or(true, |current| current == bundle.step.id) {
            uc.current_step_id = Some(next.id);
        }
    }
    let is_final = final_step_id(&bundle.steps) == Some(bundle.step.id);
    if is_final && !uc.is_completed() {
        uc.status = UserChallengeStatus::Completed;
        if uc.completed_at.is_none() {
            uc.completed_at = Some(now);
        }
        return (next, true);
    }
    (next, false)
}

/// Holds the per-attempt submission slot. Released explicitly; a dropped
/// guard (cancelled request) releases in the background.
struct SubmissionLock {
    store: Arc<dyn ProgressStore>,
    user_challenge_id: Uuid,
    owner: String,
    held: bool,
}

impl SubmissionLock {
    async fn acquire(store: &Arc<dyn ProgressStore>, user_challenge_id: Uuid, ttl: Duration) -> AssessResult<Self> {
        let owner = generate_token();
        if !store.try_lock_submission(user_challenge_id, &owner, ttl).await? {
            return Err(AssessError::SubmissionInProgress(user_challenge_id));
        }
        Ok(Self {
            store: store.clone(),
            user_challenge_id,
            owner,
            held: true,
        })
    }

    async fn release(mut self) {
        self.held = false;
        if let Err(e) = self.store.unlock_submission(self.user_challenge_id, &self.owner).await {
            warn!(user_challenge_id = %self.user_challenge_id, error = %e, "failed to release submission lock");
        }
    }
}

impl Drop for SubmissionLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let store = self.store.clone();
        let id = self.user_challenge_id;
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.unlock_submission(id, &owner).await {
                    warn!(user_challenge_id = %id, error = %e, "failed to release abandoned submission lock");
                }
            });
        }
    }
}

pub struct GradingService {
    catalog: Arc<Catalog>,
    store: Arc<dyn ProgressStore>,
    sessions: SessionManager,
    dispatcher: Arc<Dispatcher>,
    languages: Arc<LanguageRegistry>,
    clock: Arc<dyn Clock>,
}

impl GradingService {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn ProgressStore>,
        sessions: SessionManager,
        dispatcher: Arc<Dispatcher>,
        languages: Arc<LanguageRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            store,
            sessions,
            dispatcher,
            languages,
            clock,
        }
    }

    pub fn languages(&self) -> &Arc<LanguageRegistry> {
        &self.languages
    }

    /// Step bundle for the candidate surface; unpublished challenges do not
    /// exist there.
    fn public_bundle(&self, step_id: Uuid) -> AssessResult<StepBundle> {
        let bundle = self.catalog.snapshot().step_bundle(step_id)?;
        if !bundle.challenge.status.is_public() {
            return Err(AssessError::not_found("step", step_id));
        }
        Ok(bundle)
    }

    fn public_challenge(&self, challenge_id: Uuid) -> AssessResult<(Challenge, Vec<ChallengeStep>)> {
        let snapshot = self.catalog.snapshot();
        let challenge = snapshot.challenge(challenge_id)?;
        if !challenge.status.is_public() {
            return Err(AssessError::not_found("challenge", challenge_id));
        }
        let steps = snapshot.steps_of(challenge_id).into_iter().cloned().collect();
        Ok((challenge.clone(), steps))
    }

    pub async fn start_challenge(
        &self,
        challenge_id: Uuid,
        token: Option<&str>,
        anonymous_identifier: Option<&str>,
    ) -> AssessResult<StartResponse> {
        let (_, steps) = self.public_challenge(challenge_id)?;
        let first = steps.first().map(|s| s.id);
        let started = self
            .sessions
            .start(challenge_id, token, anonymous_identifier, first)
            .await?;
        let uc = started.context.user_challenge;
        let current_step = uc
            .current_step_id
            .and_then(|id| steps.iter().find(|s| s.id == id))
            .map(StepRef::of);
        Ok(StartResponse {
            session_token: started.context.session.token,
            anonymous_identifier: uc.anonymous_identifier.clone(),
            expires_at: started.context.session.expires_at,
            resumed: started.resumed,
            previous_status: started.previous_status,
            user_challenge: uc,
            current_step,
        })
    }

    /// Challenge detail; progress is included when the token is valid for
    /// this challenge and silently omitted otherwise.
    pub async fn challenge_view(&self, challenge_id: Uuid, token: Option<&str>) -> AssessResult<ChallengeView> {
        let (challenge, steps) = self.public_challenge(challenge_id)?;
        let snapshot = self.catalog.snapshot();
        let summaries = steps
            .iter()
            .map(|s| StepSummary {
                id: s.id,
                title: s.title.clone(),
                order_index: s.order_index,
                is_final_step: s.is_final_step,
                test_count: snapshot.testcases_of(s.id).len(),
            })
            .collect();

        let (user_challenge, progress) = match self.sessions.peek(token, challenge_id).await {
            Some(ctx) => {
                let mut progress: Vec<ProgressView> = self
                    .store
                    .list_progress(ctx.user_challenge.id)
                    .await?
                    .iter()
                    .map(ProgressView::counts_only)
                    .collect();
                progress.sort_by_key(|p| {
                    steps
                        .iter()
                        .position(|s| s.id == p.step_id)
                        .unwrap_or(usize::MAX)
                });
                (Some(ctx.user_challenge), progress)
            }
            None => (None, Vec::new()),
        };

        Ok(ChallengeView {
            challenge,
            steps: summaries,
            user_challenge,
            progress,
        })
    }

    pub async fn load_step(&self, step_id: Uuid, token: Option<&str>) -> AssessResult<StepView> {
        let bundle = self.public_bundle(step_id)?;
        let ctx = self.sessions.resolve(token, bundle.challenge.id).await?;
        let progress = self.store.get_progress(ctx.user_challenge.id, step_id).await?;

        let (content, language) = match &progress {
            Some(p) if !p.content.is_empty() => (p.content.clone(), p.language.clone()),
            _ => (bundle.step.starter_content(), None),
        };
        let test_cases = bundle
            .testcases
            .iter()
            .filter(|tc| !tc.is_hidden)
            .map(|tc| TestCasePreview {
                id: tc.id,
                name: tc.display_name(),
                order_index: tc.order_index,
                testcase_type: tc.testcase_type(),
                is_example: tc.is_example,
                input: tc.expectation.input_preview(),
                expected_output: tc.expectation.expected_preview(),
            })
            .collect();
        let hidden_test_count = bundle.testcases.iter().filter(|tc| tc.is_hidden).count();
        let progress = progress
            .as_ref()
            .map(|p| ProgressView::of(p, &bundle.testcases, Audience::Candidate));

        let step = ChallengeStep {
            solution_code: None,
            evaluation_criteria: None,
            ..bundle.step
        };
        Ok(StepView {
            challenge_id: bundle.challenge.id,
            environment: bundle.challenge.execution_environment,
            step,
            content,
            language,
            test_cases,
            hidden_test_count,
            progress,
        })
    }

    /// Autosave. Never graded, never locked; the latest write wins.
    pub async fn save_step(&self, step_id: Uuid, token: Option<&str>, submission: &Submission) -> AssessResult<SaveResponse> {
        let bundle = self.public_bundle(step_id)?;
        let ctx = self.sessions.resolve(token, bundle.challenge.id).await?;
        let now = self.clock.now();
        let saved = self
            .store
            .save_content(
                ctx.user_challenge.id,
                step_id,
                &submission.raw_text(),
                submission.language.as_deref(),
                now,
            )
            .await?;
        Ok(SaveResponse {
            step_id,
            saved: true,
            last_edited: saved.last_edited,
        })
    }

    /// Practice run over the visible cases. Stores content and the last
    /// result but leaves counts, score and completion alone.
    pub async fn test_step(
        &self,
        step_id: Uuid,
        token: Option<&str>,
        submission: &Submission,
    ) -> AssessResult<SubmissionResponse> {
        self.run(step_id, token, submission, SubmissionMode::Test).await
    }

    /// Graded run over every case.
    pub async fn submit_step(
        &self,
        step_id: Uuid,
        token: Option<&str>,
        submission: &Submission,
    ) -> AssessResult<SubmissionResponse> {
        self.run(step_id, token, submission, SubmissionMode::Submit).await
    }

    async fn run(
        &self,
        step_id: Uuid,
        token: Option<&str>,
        submission: &Submission,
        mode: SubmissionMode,
    ) -> AssessResult<SubmissionResponse> {
        let bundle = self.public_bundle(step_id)?;
        let ctx = self.sessions.resolve(token, bundle.challenge.id).await?;
        let artifact = map_artifact(bundle.challenge.execution_environment, submission, &self.languages)?;
        let testcases: Vec<TestCase> = match mode {
            SubmissionMode::Test => bundle.testcases.iter().filter(|tc| !tc.is_hidden).cloned().collect(),
            SubmissionMode::Submit => bundle.testcases.clone(),
        };

        let uc_id = ctx.user_challenge.id;
        let ttl = self.dispatcher.submission_budget(&testcases) + LOCK_MARGIN;
        let lock = SubmissionLock::acquire(&self.store, uc_id, ttl).await?;
        let result = match self
            .dispatcher
            .evaluate_all(&bundle.challenge, &bundle.step, &testcases, &artifact)
            .await
        {
            Ok(outcomes) => {
                self.record(ctx.session, uc_id, &bundle, &testcases, outcomes, submission, mode)
                    .await
            }
            Err(e) => Err(e),
        };
        lock.release().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        mut session: assessor_common::progress::Session,
        uc_id: Uuid,
        bundle: &StepBundle,
        testcases: &[TestCase],
        outcomes: Vec<Outcome>,
        submission: &Submission,
        mode: SubmissionMode,
    ) -> AssessResult<SubmissionResponse> {
        let now = self.clock.now();
        let step_id = bundle.step.id;
        let summary = Summary::from_outcomes(&outcomes);
        let execution_results = present_all(testcases, &outcomes, Audience::Candidate);

        let mut progress = self
            .store
            .get_progress(uc_id, step_id)
            .await?
            .unwrap_or_else(|| UserProgress::new(uc_id, step_id, now));
        progress.content = submission.raw_text();
        if submission.language.is_some() {
            progress.language = submission.language.clone();
        }
        progress.last_edited = now;

        // Re-read under the lock; the session copy may be stale.
        let mut uc = self
            .store
            .get_user_challenge(uc_id)
            .await?
            .ok_or_else(|| AssessError::not_found("user_challenge", uc_id))?;
        uc.last_activity_at = now;

        let mut next = None;
        let mut completed_now = false;
        if mode == SubmissionMode::Submit {
            let score = score_step(&outcomes, bundle.step.evaluation_criteria.as_ref());
            progress.tests_passed = score.tests_passed;
            progress.tests_total = score.tests_total;
            progress.score = Some(score.score);
            progress.is_completed |= score.completed;
            if score.completed {
                (next, completed_now) = advance(&mut uc, bundle, now);
            }
            info!(
                mode = mode.as_str(),
                challenge_id = %bundle.challenge.id,
                step_id = %step_id,
                user_challenge_id = %uc_id,
                passed = score.tests_passed,
                total = score.tests_total,
                pending_review = score.pending_review,
                score = score.score,
                step_completed = progress.is_completed,
                "submission graded"
            );
        } else {
            info!(
                mode = mode.as_str(),
                step_id = %step_id,
                user_challenge_id = %uc_id,
                passed = summary.passed,
                total = summary.total,
                "practice run evaluated"
            );
        }
        progress.last_execution_result = Some(StoredExecution {
            mode,
            evaluated_at: now,
            outcomes,
            summary,
        });

        self.store.put_progress(&progress).await?;
        self.store.put_user_challenge(&uc).await?;
        if completed_now {
            info!(user_challenge_id = %uc_id, challenge_id = %uc.challenge_id, "challenge completed");
            self.sessions.pin(&mut session, now).await?;
        }

        Ok(SubmissionResponse {
            mode,
            execution_results,
            summary,
            step_progress: Some(ProgressView::counts_only(&progress)),
            user_challenge: Some(uc),
            next_step: next,
        })
    }

    /// Settle a review-pending case in the latest graded result of a step.
    pub async fn resolve_review(
        &self,
        user_challenge_id: Uuid,
        step_id: Uuid,
        testcase_id: Uuid,
        passed: bool,
        note: Option<String>,
    ) -> AssessResult<ReviewResolution> {
        let bundle = self.catalog.snapshot().step_bundle(step_id)?;
        let uc = self
            .store
            .get_user_challenge(user_challenge_id)
            .await?
            .ok_or_else(|| AssessError::not_found("user_challenge", user_challenge_id))?;
        if uc.challenge_id != bundle.challenge.id {
            return Err(AssessError::validation("step does not belong to this user challenge"));
        }

        let lock = SubmissionLock::acquire(&self.store, user_challenge_id, LOCK_MARGIN).await?;
        let result = self
            .apply_review(user_challenge_id, &bundle, testcase_id, passed, note)
            .await;
        lock.release().await;
        result
    }

    async fn apply_review(
        &self,
        uc_id: Uuid,
        bundle: &StepBundle,
        testcase_id: Uuid,
        passed: bool,
        note: Option<String>,
    ) -> AssessResult<ReviewResolution> {
        let now = self.clock.now();
        let mut progress = self
            .store
            .get_progress(uc_id, bundle.step.id)
            .await?
            .ok_or_else(|| AssessError::not_found("progress", bundle.step.id))?;
        let execution = progress
            .last_execution_result
            .as_mut()
            .filter(|e| e.mode == SubmissionMode::Submit)
            .ok_or_else(|| AssessError::Conflict("no graded submission for this step".into()))?;
        let outcome = execution
            .outcomes
            .iter_mut()
            .find(|o| o.testcase_id == testcase_id)
            .ok_or_else(|| AssessError::not_found("testcase", testcase_id))?;
        if !outcome.is_pending() {
            return Err(AssessError::Conflict("test case is not awaiting review".into()));
        }
        outcome.resolve(passed, note);
        execution.summary = Summary::from_outcomes(&execution.outcomes);
        let summary = execution.summary;
        let score = score_step(&execution.outcomes, bundle.step.evaluation_criteria.as_ref());

        progress.tests_passed = score.tests_passed;
        progress.tests_total = score.tests_total;
        progress.score = Some(score.score);
        progress.is_completed |= score.completed;

        let mut uc = self
            .store
            .get_user_challenge(uc_id)
            .await?
            .ok_or_else(|| AssessError::not_found("user_challenge", uc_id))?;
        let mut completed_now = false;
        if score.completed {
            (_, completed_now) = advance(&mut uc, bundle, now);
        }

        self.store.put_progress(&progress).await?;
        self.store.put_user_challenge(&uc).await?;
        info!(
            user_challenge_id = %uc_id,
            step_id = %bundle.step.id,
            testcase_id = %testcase_id,
            passed,
            step_completed = progress.is_completed,
            "review resolved"
        );
        if completed_now {
            if let Some(mut session) = self.store.get_session(&uc.session_token).await? {
                self.sessions.pin(&mut session, now).await?;
            }
            info!(user_challenge_id = %uc_id, challenge_id = %uc.challenge_id, "challenge completed after review");
        }

        Ok(ReviewResolution {
            step_progress: ProgressView::of(&progress, &bundle.testcases, Audience::Admin),
            user_challenge: uc,
            summary,
        })
    }

    pub async fn sweep_idle(&self) -> AssessResult<usize> {
        self.sessions.sweep_idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fixtures;
    use crate::sandbox::{CodeSandbox, ScriptedSandbox};
    use crate::store::MemoryStore;
    use assessor_common::config::{DispatchSettings, SessionSettings};
    use assessor_common::payload::{DocumentSpec, DocumentStructure, Expectation};
    use assessor_common::results::Verdict;
    use assessor_common::types::{ExerciseCategory, PublicationStatus};

    struct Harness {
        service: Arc<GradingService>,
        clock: Arc<ManualClock>,
        challenge: Challenge,
        steps: Vec<ChallengeStep>,
    }

    fn build(
        env: ExecutionEnvironment,
        sandbox: Arc<dyn CodeSandbox>,
        steps_and_cases: Vec<(ChallengeStep, Vec<TestCase>)>,
        challenge: Challenge,
    ) -> Harness {
        let mut exercise = fixtures::exercise();
        exercise.category = ExerciseCategory::Developer;
        let challenge = Challenge {
            exercise_id: exercise.id,
            execution_environment: env,
            ..challenge
        };
        let catalog = Arc::new(Catalog::default());
        catalog.create_exercise(exercise.clone()).unwrap();
        catalog.create_challenge(exercise.id, challenge.clone()).unwrap();
        let mut steps = Vec::new();
        for (step, cases) in steps_and_cases {
            let step = catalog.create_step(challenge.id, step).unwrap();
            catalog.insert_testcases(step.id, cases).unwrap();
            steps.push(step);
        }

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let sessions = SessionManager::new(store.clone(), clock.clone(), SessionSettings::default());
        let dispatcher = Arc::new(Dispatcher::new(sandbox, DispatchSettings::default()));
        let service = Arc::new(GradingService::new(
            catalog,
            store,
            sessions,
            dispatcher,
            Arc::new(LanguageRegistry::builtin()),
            clock.clone(),
        ));
        Harness {
            service,
            clock,
            challenge,
            steps,
        }
    }

    /// One code step with three unit tests, the last hidden.
    fn code_challenge(sandbox: Arc<dyn CodeSandbox>) -> Harness {
        let challenge = fixtures::challenge(ExecutionEnvironment::CodeExecutor);
        let step = fixtures::step(challenge.id, 0, true);
        let cases = vec![
            fixtures::unit_case(0, "1", "1", false),
            fixtures::unit_case(1, "2", "2", false),
            fixtures::unit_case(2, "hidden-in", "hidden-in", true),
        ];
        build(ExecutionEnvironment::CodeExecutor, sandbox, vec![(step, cases)], challenge)
    }

    fn document_case(order: u32, manual: bool) -> TestCase {
        fixtures::case(
            order,
            Expectation::DocumentTest(DocumentSpec {
                structure: DocumentStructure {
                    required_headings: vec!["Summary".into()],
                    ..Default::default()
                },
                formatting: Default::default(),
                rubric: vec![],
                requires_manual_review: manual,
            }),
        )
    }

    #[tokio::test]
    async fn test_correct_submission_completes_challenge() {
        let h = code_challenge(Arc::new(ScriptedSandbox::echo()));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        assert_eq!(started.previous_status, UserChallengeStatus::NotStarted);
        assert_eq!(started.user_challenge.status, UserChallengeStatus::InProgress);
        assert_eq!(started.current_step.as_ref().map(|s| s.id), Some(h.steps[0].id));

        let token = started.session_token.as_str();
        let response = h
            .service
            .submit_step(h.steps[0].id, Some(token), &Submission::code("echo", "python"))
            .await
            .unwrap();

        assert_eq!(response.summary.passed, 3);
        assert_eq!(response.summary.total, 3);
        assert_eq!(response.summary.success_rate, 100.0);
        assert!(response.summary.all_passed);
        let progress = response.step_progress.unwrap();
        assert!(progress.is_completed);
        assert_eq!(progress.score, Some(100.0));
        let uc = response.user_challenge.unwrap();
        assert_eq!(uc.status, UserChallengeStatus::Completed);
        assert!(uc.completed_at.is_some());
        assert!(response.next_step.is_none());
    }

    #[tokio::test]
    async fn test_completed_at_set_once() {
        let h = code_challenge(Arc::new(ScriptedSandbox::echo()));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let submission = Submission::code("echo", "python");

        let first = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        let completed_at = first.user_challenge.unwrap().completed_at;

        h.clock.advance(chrono::Duration::minutes(5));
        let again = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        let uc = again.user_challenge.unwrap();
        assert_eq!(uc.status, UserChallengeStatus::Completed);
        assert_eq!(uc.completed_at, completed_at);
    }

    #[tokio::test]
    async fn test_hidden_payload_never_reaches_candidate() {
        let sandbox = ScriptedSandbox::new(|_| {
            Ok(crate::sandbox::RunOutput {
                stdout: "wrong".into(),
                exit_code: Some(0),
                ..Default::default()
            })
        });
        let h = code_challenge(Arc::new(sandbox));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let submission = Submission::code("whatever", "python");

        let practice = h.service.test_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        assert_eq!(practice.summary.total, 2);
        assert!(practice.execution_results.iter().all(|r| !r.is_hidden));

        let graded = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        assert_eq!(graded.summary.total, 3);
        let hidden = graded.execution_results.iter().find(|r| r.is_hidden).unwrap();
        assert_eq!(hidden.verdict, Verdict::Failed);
        let json = serde_json::to_string(&graded).unwrap();
        assert!(!json.contains("hidden-in"));

        let loaded = h.service.load_step(h.steps[0].id, Some(token)).await.unwrap();
        let json = serde_json::to_string(&loaded).unwrap();
        assert!(!json.contains("hidden-in"));
        assert_eq!(loaded.hidden_test_count, 1);
        assert_eq!(loaded.test_cases.len(), 2);
    }

    #[tokio::test]
    async fn test_practice_run_leaves_counts() {
        let h = code_challenge(Arc::new(ScriptedSandbox::echo()));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let response = h
            .service
            .test_step(h.steps[0].id, Some(token), &Submission::code("print 1", "python"))
            .await
            .unwrap();
        assert!(response.summary.all_passed);
        let progress = response.step_progress.unwrap();
        assert_eq!(progress.tests_total, 0);
        assert!(!progress.is_completed);
        assert_eq!(response.user_challenge.unwrap().status, UserChallengeStatus::InProgress);

        let loaded = h.service.load_step(h.steps[0].id, Some(token)).await.unwrap();
        assert_eq!(loaded.content, "print 1");
    }

    #[tokio::test]
    async fn test_validation_before_dispatch() {
        let sandbox = ScriptedSandbox::echo();
        let h = code_challenge(Arc::new(sandbox.clone()));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let err = h
            .service
            .submit_step(h.steps[0].id, Some(token), &Submission::code("x", "cobol"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssessError::Validation(_)));
        assert_eq!(sandbox.calls(), 0);
    }

    #[tokio::test]
    async fn test_requires_session() {
        let h = code_challenge(Arc::new(ScriptedSandbox::echo()));
        let err = h
            .service
            .submit_step(h.steps[0].id, None, &Submission::code("x", "python"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssessError::SessionInvalid(_)));
    }

    #[tokio::test]
    async fn test_concurrent_submits_one_rejected() {
        let sandbox = ScriptedSandbox::echo().with_delay(Duration::from_millis(300));
        let h = code_challenge(Arc::new(sandbox));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.clone();
        let step_id = h.steps[0].id;

        let a = {
            let service = h.service.clone();
            let token = token.clone();
            tokio::spawn(async move {
                service
                    .submit_step(step_id, Some(&token), &Submission::code("echo", "python"))
                    .await
            })
        };
        let b = {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .submit_step(step_id, Some(&token), &Submission::code("echo", "python"))
                    .await
            })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(AssessError::SubmissionInProgress(_))))
            .count();
        assert_eq!((accepted, rejected), (1, 1));
    }

    #[tokio::test]
    async fn test_autosave_and_load() {
        let h = code_challenge(Arc::new(ScriptedSandbox::echo()));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();

        let fresh = h.service.load_step(h.steps[0].id, Some(token)).await.unwrap();
        assert!(fresh.progress.is_none());
        assert!(fresh.step.solution_code.is_none());

        let draft = Submission::code("print draft", "python");
        h.service.save_step(h.steps[0].id, Some(token), &draft).await.unwrap();
        h.service.save_step(h.steps[0].id, Some(token), &draft).await.unwrap();
        let loaded = h.service.load_step(h.steps[0].id, Some(token)).await.unwrap();
        assert_eq!(loaded.content, "print draft");
        assert_eq!(loaded.language.as_deref(), Some("python"));
    }

    #[tokio::test]
    async fn test_multi_step_advances() {
        let challenge = fixtures::challenge(ExecutionEnvironment::CodeExecutor);
        let first = fixtures::step(challenge.id, 0, false);
        let last = fixtures::step(challenge.id, 1, true);
        let h = build(
            ExecutionEnvironment::CodeExecutor,
            Arc::new(ScriptedSandbox::echo()),
            vec![
                (first, vec![fixtures::unit_case(0, "a", "a", false)]),
                (last, vec![fixtures::unit_case(0, "b", "b", false)]),
            ],
            challenge,
        );
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let submission = Submission::code("echo", "python");

        let r1 = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        assert_eq!(r1.next_step.map(|s| s.id), Some(h.steps[1].id));
        let uc = r1.user_challenge.unwrap();
        assert_eq!(uc.status, UserChallengeStatus::InProgress);
        assert_eq!(uc.current_step_id, Some(h.steps[1].id));

        let r2 = h.service.submit_step(h.steps[1].id, Some(token), &submission).await.unwrap();
        assert_eq!(r2.user_challenge.unwrap().status, UserChallengeStatus::Completed);

        let view = h.service.challenge_view(h.challenge.id, Some(token)).await.unwrap();
        assert_eq!(view.progress.len(), 2);
        assert_eq!(view.progress[0].step_id, h.steps[0].id);
        let anonymous = h.service.challenge_view(h.challenge.id, None).await.unwrap();
        assert!(anonymous.user_challenge.is_none());
    }

    #[tokio::test]
    async fn test_review_pending_blocks_then_resolves() {
        let challenge = fixtures::challenge(ExecutionEnvironment::TextEditor);
        let step = fixtures::step(challenge.id, 0, true);
        let h = build(
            ExecutionEnvironment::TextEditor,
            Arc::new(ScriptedSandbox::echo()),
            vec![(step, vec![document_case(0, false), document_case(1, true)])],
            challenge,
        );
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let submission = Submission::content("# Report\n\n## Summary\n\nAll good.");

        let graded = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        assert_eq!(graded.summary.passed, 1);
        assert_eq!(graded.summary.pending_review, 1);
        assert!(!graded.step_progress.unwrap().is_completed);
        let uc = graded.user_challenge.unwrap();
        assert_eq!(uc.status, UserChallengeStatus::InProgress);

        let pending = graded
            .execution_results
            .iter()
            .find(|r| r.requires_manual_review)
            .unwrap()
            .testcase_id;
        let resolved = h
            .service
            .resolve_review(uc.id, h.steps[0].id, pending, true, Some("clear and concise".into()))
            .await
            .unwrap();
        assert!(resolved.step_progress.is_completed);
        assert_eq!(resolved.summary.passed, 2);
        assert_eq!(resolved.user_challenge.status, UserChallengeStatus::Completed);

        let again = h
            .service
            .resolve_review(uc.id, h.steps[0].id, pending, false, None)
            .await
            .unwrap_err();
        assert!(matches!(again, AssessError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unpublished_challenge_hidden() {
        let challenge = Challenge {
            status: PublicationStatus::Draft,
            ..fixtures::challenge(ExecutionEnvironment::CodeExecutor)
        };
        let step = fixtures::step(challenge.id, 0, true);
        let h = build(
            ExecutionEnvironment::CodeExecutor,
            Arc::new(ScriptedSandbox::echo()),
            vec![(step, vec![])],
            challenge,
        );
        let err = h.service.start_challenge(h.challenge.id, None, None).await.unwrap_err();
        assert!(matches!(err, AssessError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_identical_resubmission_identical_results() {
        let h = code_challenge(Arc::new(ScriptedSandbox::echo()));
        let started = h.service.start_challenge(h.challenge.id, None, None).await.unwrap();
        let token = started.session_token.as_str();
        let submission = Submission::code("echo", "python");
        let a = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        let b = h.service.submit_step(h.steps[0].id, Some(token), &submission).await.unwrap();
        assert_eq!(a.execution_results, b.execution_results);
    }
}
