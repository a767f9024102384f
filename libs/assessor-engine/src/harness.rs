//! Admin tooling: dry runs against the candidate evaluation path and bulk
//! test-case import.

use assessor_common::error::{AssessError, AssessResult};
use assessor_common::results::{Audience, ExecutionResult, Summary};
use assessor_common::types::{ExecutionEnvironment, TestCase};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogSnapshot, StepBundle};
use crate::dispatcher::Dispatcher;
use crate::languages::LanguageRegistry;
use crate::scorer::score_step;
use crate::submission::{map_artifact, Submission};

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub challenge_id: Uuid,
    pub step_id: Uuid,
    pub environment: ExecutionEnvironment,
    pub execution_results: Vec<ExecutionResult>,
    pub summary: Summary,
    pub score: f64,
    pub step_completed: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    pub index: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("{} of the imported rows are invalid", .0.len())]
    Rows(Vec<RowError>),

    #[error(transparent)]
    Assess(#[from] AssessError),
}

pub struct AdminHarness {
    catalog: Arc<Catalog>,
    dispatcher: Arc<Dispatcher>,
    languages: Arc<LanguageRegistry>,
}

impl AdminHarness {
    pub fn new(catalog: Arc<Catalog>, dispatcher: Arc<Dispatcher>, languages: Arc<LanguageRegistry>) -> Self {
        Self {
            catalog,
            dispatcher,
            languages,
        }
    }

    /// Evaluate a submission against every case of a step, hidden ones
    /// included, through the same dispatcher candidates use. Nothing is
    /// stored.
    pub async fn dry_run(&self, step_id: Uuid, submission: &Submission) -> AssessResult<DryRunReport> {
        let bundle = self.catalog.snapshot().step_bundle(step_id)?;
        self.run_bundle(&bundle, submission).await
    }

    /// Dry-run the step's stored reference solution.
    pub async fn validate_step(&self, step_id: Uuid) -> AssessResult<DryRunReport> {
        let snapshot = self.catalog.snapshot();
        let bundle = snapshot.step_bundle(step_id)?;
        let submission = solution_submission(&snapshot, &bundle)?;
        self.run_bundle(&bundle, &submission).await
    }

    async fn run_bundle(&self, bundle: &StepBundle, submission: &Submission) -> AssessResult<DryRunReport> {
        let artifact = map_artifact(bundle.challenge.execution_environment, submission, &self.languages)?;
        let started = Instant::now();
        let outcomes = self
            .dispatcher
            .evaluate_all(&bundle.challenge, &bundle.step, &bundle.testcases, &artifact)
            .await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let score = score_step(&outcomes, bundle.step.evaluation_criteria.as_ref());
        let execution_results = bundle
            .testcases
            .iter()
            .zip(&outcomes)
            .map(|(tc, outcome)| ExecutionResult::present(tc, outcome, Audience::Admin))
            .collect();
        info!(
            step_id = %bundle.step.id,
            passed = score.tests_passed,
            total = score.tests_total,
            elapsed_ms,
            "admin dry run finished"
        );
        Ok(DryRunReport {
            challenge_id: bundle.challenge.id,
            step_id: bundle.step.id,
            environment: bundle.challenge.execution_environment,
            execution_results,
            summary: Summary::from_outcomes(&outcomes),
            score: score.score,
            step_completed: score.completed,
            elapsed_ms,
        })
    }

    /// Validate every row, then insert all of them in one catalog swap.
    /// Any invalid row rejects the whole batch.
    pub fn import_testcases(&self, step_id: Uuid, rows: Vec<Value>) -> Result<Vec<TestCase>, ImportError> {
        let snapshot = self.catalog.snapshot();
        let testcases = check_rows(&snapshot, step_id, rows)?;
        let inserted = self.catalog.insert_testcases(step_id, testcases)?;
        info!(step_id = %step_id, count = inserted.len(), "test cases imported");
        Ok(inserted)
    }
}

/// The reference solution as a submission in the environment's shape.
fn solution_submission(snapshot: &CatalogSnapshot, bundle: &StepBundle) -> AssessResult<Submission> {
    let solution = bundle
        .step
        .solution_code
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AssessError::validation("step has no solution_code to validate"))?;
    Ok(match bundle.challenge.execution_environment {
        ExecutionEnvironment::CodeExecutor => {
            let language = bundle
                .challenge
                .environment_config
                .get("language")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    snapshot
                        .exercise(bundle.challenge.exercise_id)
                        .ok()
                        .and_then(|e| e.language.clone())
                })
                .ok_or_else(|| AssessError::validation("no language configured for the solution"))?;
            Submission::code(solution, language)
        }
        ExecutionEnvironment::SqlDatabase => Submission {
            code: Some(solution),
            ..Default::default()
        },
        _ => Submission::content(solution),
    })
}

/// Parse and check import rows against a snapshot. Rows without an
/// `order_index` are appended after the step's existing cases.
pub fn check_rows(snapshot: &CatalogSnapshot, step_id: Uuid, rows: Vec<Value>) -> Result<Vec<TestCase>, ImportError> {
    snapshot.step(step_id)?;
    let existing = snapshot.testcases_of(step_id);
    let mut used_orders: HashSet<u32> = existing.iter().map(|tc| tc.order_index).collect();
    let mut used_ids: HashSet<Uuid> = snapshot.testcases.keys().copied().collect();
    let mut next_order = existing.iter().map(|tc| tc.order_index + 1).max().unwrap_or(0);

    let mut parsed = Vec::with_capacity(rows.len());
    let mut failures = Vec::new();

    for (index, mut row) in rows.into_iter().enumerate() {
        let Some(object) = row.as_object_mut() else {
            failures.push(RowError {
                index,
                errors: vec!["row must be a JSON object".into()],
            });
            continue;
        };
        if !object.contains_key("order_index") {
            while used_orders.contains(&next_order) {
                next_order += 1;
            }
            object.insert("order_index".into(), Value::from(next_order));
        }
        object.insert("step_id".into(), Value::String(step_id.to_string()));

        let tc: TestCase = match serde_json::from_value(row) {
            Ok(tc) => tc,
            Err(e) => {
                failures.push(RowError {
                    index,
                    errors: vec![e.to_string()],
                });
                continue;
            }
        };
        let mut errors = snapshot.check_testcase(&tc);
        if !used_orders.insert(tc.order_index) {
            errors.push(format!("order_index {} is already taken", tc.order_index));
        }
        if !used_ids.insert(tc.id) {
            errors.push(format!("testcase id {} already exists", tc.id));
        }
        if errors.is_empty() {
            parsed.push(tc);
        } else {
            failures.push(RowError { index, errors });
        }
    }

    if failures.is_empty() {
        Ok(parsed)
    } else {
        warn!(step_id = %step_id, invalid = failures.len(), "import rejected");
        Err(ImportError::Rows(failures))
    }
}
