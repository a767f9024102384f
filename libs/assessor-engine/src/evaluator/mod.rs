//! Evaluators: comparison logic, one module per test-case family.
//!
//! Selection is an exhaustive `match` over [`Expectation`]; a new family
//! does not compile until it is routed here. Evaluators only fail with a
//! [`SandboxError`] when a backend could not run; every judgement about the
//! artifact, including timeouts, is an [`Outcome`].

mod chart;
mod code;
mod notebook;
mod review;
mod sql;
mod stats;

pub use code::normalize_output;
pub use stats::compute_statistic;

use assessor_common::artifact::Artifact;
use assessor_common::payload::{Expectation, Tolerance};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::{Challenge, ChallengeStep, TestCase};
use serde_json::Value;

use crate::sandbox::{CodeSandbox, SandboxError, SqlSandbox};

/// Everything an evaluator may consult besides the case and the artifact.
pub struct EvalContext<'a> {
    pub challenge: &'a Challenge,
    pub step: &'a ChallengeStep,
    pub sandbox: &'a dyn CodeSandbox,
    pub sql: &'a SqlSandbox,
}

pub async fn evaluate(
    ctx: &EvalContext<'_>,
    testcase: &TestCase,
    artifact: &Artifact,
) -> Result<Outcome, SandboxError> {
    match &testcase.expectation {
        Expectation::UnitTest(spec) => code::evaluate(ctx, testcase, spec, artifact).await,
        Expectation::SqlQueryTest(spec) => sql::evaluate(ctx, testcase, spec, artifact).await,
        Expectation::StatisticalTest(spec) => Ok(stats::evaluate(testcase, spec, artifact)),
        Expectation::VisualizationTest(spec) => Ok(chart::evaluate(testcase, spec, artifact)),
        Expectation::NotebookCellTest(spec) => {
            notebook::evaluate(ctx, testcase, spec, artifact).await
        }
        Expectation::DiagramTest(spec) => Ok(review::evaluate_diagram(testcase, spec, artifact)),
        Expectation::DocumentTest(spec) => Ok(review::evaluate_document(testcase, spec, artifact)),
        Expectation::FinancialTest(spec) => {
            Ok(review::evaluate_financial(testcase, spec, artifact))
        }
    }
}

pub(crate) fn wrong_artifact(testcase: &TestCase, expected: &str, artifact: &Artifact) -> Outcome {
    Outcome::fail(
        testcase,
        FailureKind::InvalidArtifact,
        format!(
            "{} expects a {expected} submission, got a {}",
            testcase.testcase_type(),
            artifact.kind()
        ),
        None,
    )
}

pub(crate) fn tolerance_of(testcase: &TestCase) -> Tolerance {
    testcase.numerical_tolerance.unwrap_or_else(Tolerance::exact)
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Structural comparison; numbers (and numeric strings facing numbers) use
/// the tolerance, everything else compares exactly.
pub(crate) fn json_matches(expected: &Value, actual: &Value, tolerance: Tolerance) -> bool {
    match (expected, actual) {
        (Value::Null, Value::Null) => true,
        (Value::String(e), Value::String(a)) => e == a,
        (Value::Array(e), Value::Array(a)) => {
            e.len() == a.len()
                && e.iter()
                    .zip(a.iter())
                    .all(|(e, a)| json_matches(e, a, tolerance))
        }
        (Value::Object(e), Value::Object(a)) => {
            e.len() == a.len()
                && e.iter().all(|(key, ev)| {
                    a.get(key)
                        .map(|av| json_matches(ev, av, tolerance))
                        .unwrap_or(false)
                })
        }
        (Value::Number(_), _) | (_, Value::Number(_)) | (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            match (as_number(expected), as_number(actual)) {
                (Some(e), Some(a)) => tolerance.within(e, a),
                _ => false,
            }
        }
        _ => false,
    }
}

/// Keeps messages readable when a program dumps a lot to stderr.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... [truncated]")
}
