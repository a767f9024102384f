//! Fans a submission out over its test cases.
//!
//! Cases run concurrently up to `max_parallel_tests`, results come back in
//! test-case order, and each case is bounded by the earlier of its own
//! timeout (plus a grace second) and the submission deadline.

use assessor_common::artifact::Artifact;
use assessor_common::config::DispatchSettings;
use assessor_common::error::{AssessError, AssessResult};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::{Challenge, ChallengeStep, TestCase};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::evaluator::{self, EvalContext};
use crate::sandbox::{CodeSandbox, SandboxError, SqlSandbox};

const EVALUATION_GRACE: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    sandbox: Arc<dyn CodeSandbox>,
    sql: SqlSandbox,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(sandbox: Arc<dyn CodeSandbox>, settings: DispatchSettings) -> Self {
        Self {
            sandbox,
            sql: SqlSandbox::new(),
            settings,
        }
    }

    /// max(per-case timeout) + fixed overhead; never the sum.
    pub fn submission_budget(&self, testcases: &[TestCase]) -> Duration {
        let longest = testcases
            .iter()
            .map(|tc| tc.timeout_seconds)
            .max()
            .unwrap_or(0);
        Duration::from_secs(longest as u64) + self.settings.submission_overhead
    }

    /// Fail fast on any pair outside the compatibility table.
    pub fn check_compatibility(&self, challenge: &Challenge, testcases: &[TestCase]) -> AssessResult<()> {
        let env = challenge.execution_environment;
        match testcases.iter().find(|tc| !env.supports(tc.testcase_type())) {
            Some(tc) => {
                error!(
                    challenge_id = %challenge.id,
                    step_id = %tc.step_id,
                    testcase_id = %tc.id,
                    testcase_type = %tc.testcase_type(),
                    environment = %env,
                    "unsupported testcase type for environment; catalog is inconsistent"
                );
                Err(AssessError::UnsupportedTestcaseType {
                    environment: env,
                    testcase_type: tc.testcase_type(),
                })
            }
            None => Ok(()),
        }
    }

    pub async fn evaluate_all(
        &self,
        challenge: &Challenge,
        step: &ChallengeStep,
        testcases: &[TestCase],
        artifact: &Artifact,
    ) -> AssessResult<Vec<Outcome>> {
        self.check_compatibility(challenge, testcases)?;
        let ctx = EvalContext {
            challenge,
            step,
            sandbox: self.sandbox.as_ref(),
            sql: &self.sql,
        };
        let deadline = Instant::now() + self.submission_budget(testcases);

        // built eagerly: a lazy map over borrowed cases is not Send
        let pending: Vec<_> = testcases
            .iter()
            .map(|tc| self.evaluate_one(&ctx, tc, artifact, deadline))
            .collect();
        stream::iter(pending)
            .buffered(self.settings.max_parallel_tests.max(1))
            .try_collect()
            .await
    }

    async fn evaluate_one(
        &self,
        ctx: &EvalContext<'_>,
        testcase: &TestCase,
        artifact: &Artifact,
        deadline: Instant,
    ) -> AssessResult<Outcome> {
        let own = Instant::now() + Duration::from_secs(testcase.timeout_seconds as u64) + EVALUATION_GRACE;
        let until = own.min(deadline);
        let max_attempts = self.settings.infra_max_retries.max(1);
        let mut attempt = 0;
        let mut last_infra_error: Option<String> = None;

        loop {
            attempt += 1;
            match timeout_at(until, evaluator::evaluate(ctx, testcase, artifact)).await {
                Ok(Ok(outcome)) => {
                    debug!(
                        testcase_id = %testcase.id,
                        testcase_type = %testcase.testcase_type(),
                        verdict = outcome.verdict.as_str(),
                        "test case evaluated"
                    );
                    return Ok(outcome);
                }
                Ok(Err(SandboxError::Rejected(message))) => {
                    return Ok(Outcome::fail(testcase, FailureKind::InvalidArtifact, message, None));
                }
                Ok(Err(SandboxError::Unavailable(message))) => {
                    if attempt >= max_attempts {
                        return Err(AssessError::EvaluationInfrastructure {
                            attempts: attempt,
                            message,
                        });
                    }
                    let backoff = self.settings.infra_retry_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        testcase_id = %testcase.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %message,
                        "sandbox unavailable, retrying"
                    );
                    if Instant::now() + backoff >= until {
                        return Err(AssessError::EvaluationInfrastructure {
                            attempts: attempt,
                            message,
                        });
                    }
                    last_infra_error = Some(message);
                    sleep(backoff).await;
                }
                Err(_) => {
                    if let Some(message) = last_infra_error {
                        return Err(AssessError::EvaluationInfrastructure {
                            attempts: attempt,
                            message,
                        });
                    }
                    return Ok(Outcome::fail(
                        testcase,
                        FailureKind::Timeout,
                        "evaluation exceeded its time budget",
                        None,
                    ));
                }
            }
        }
    }
}
