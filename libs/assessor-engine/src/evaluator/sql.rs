use assessor_common::artifact::Artifact;
use assessor_common::payload::{SqlQuerySpec, Tolerance};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::TestCase;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::warn;

use super::{json_matches, tolerance_of, wrong_artifact, EvalContext};
use crate::sandbox::{QueryResult, SandboxError, SqlFailure, SqlJob};

pub(super) async fn evaluate(
    ctx: &EvalContext<'_>,
    testcase: &TestCase,
    spec: &SqlQuerySpec,
    artifact: &Artifact,
) -> Result<Outcome, SandboxError> {
    let Artifact::Query(query) = artifact else {
        return Ok(wrong_artifact(testcase, "query", artifact));
    };

    let job = SqlJob {
        schema_sql: ctx
            .step
            .template
            .as_ref()
            .and_then(|t| t.schema_sql())
            .map(String::from),
        setup_sql: spec.setup_sql.clone(),
        query: query.clone(),
        timeout: Duration::from_secs(testcase.timeout_seconds as u64),
    };

    let started = Instant::now();
    let outcome = match ctx.sql.execute(job).await {
        Ok(result) => compare(testcase, spec, &result),
        Err(SqlFailure::Query(message)) => {
            Outcome::fail(testcase, FailureKind::SqlError, message, None)
        }
        Err(SqlFailure::Setup(message)) => {
            warn!(testcase_id = %testcase.id, step_id = %testcase.step_id, error = %message, "SQL fixture failed to load");
            Outcome::fail(
                testcase,
                FailureKind::SqlError,
                format!("test fixture failed to load: {message}"),
                None,
            )
        }
        Err(SqlFailure::Timeout) => Outcome::fail(
            testcase,
            FailureKind::Timeout,
            format!("query exceeded time limit of {}s", testcase.timeout_seconds),
            None,
        ),
        Err(SqlFailure::Infrastructure(err)) => return Err(err),
    };
    Ok(outcome.with_elapsed(started.elapsed().as_millis() as u64))
}

fn rows_match(expected: &[Value], actual: &[Value], tolerance: Tolerance) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(e, a)| json_matches(e, a, tolerance))
}

/// Compare a result set: column set first, then row count, then values.
pub(super) fn compare(testcase: &TestCase, spec: &SqlQuerySpec, result: &QueryResult) -> Outcome {
    let tolerance = tolerance_of(testcase);
    let actual = Some(json!({ "columns": result.columns, "rows": result.rows }));

    let rows: Vec<Vec<Value>> = if spec.expected_columns.is_empty() {
        result.rows.clone()
    } else {
        let positions: Vec<Option<usize>> = spec
            .expected_columns
            .iter()
            .map(|col| {
                result
                    .columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(col))
            })
            .collect();
        if result.columns.len() != spec.expected_columns.len() || positions.iter().any(Option::is_none) {
            return Outcome::fail(
                testcase,
                FailureKind::ColumnMismatch,
                format!(
                    "expected columns [{}], got [{}]",
                    spec.expected_columns.join(", "),
                    result.columns.join(", ")
                ),
                actual,
            );
        }
        // Project into the expected column order.
        result
            .rows
            .iter()
            .map(|row| {
                positions
                    .iter()
                    .flatten()
                    .map(|&idx| row.get(idx).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect()
    };

    if rows.len() != spec.expected_rows.len() {
        return Outcome::fail(
            testcase,
            FailureKind::RowCountMismatch,
            format!("expected {} rows, got {}", spec.expected_rows.len(), rows.len()),
            actual,
        );
    }

    if spec.order_matters {
        for (idx, (expected, got)) in spec.expected_rows.iter().zip(&rows).enumerate() {
            if !rows_match(expected, got, tolerance) {
                return Outcome::fail(
                    testcase,
                    FailureKind::ValueMismatch,
                    format!("row {} differs: expected {}, got {}", idx + 1, Value::from(expected.clone()), Value::from(got.clone())),
                    actual,
                );
            }
        }
    } else {
        let mut unmatched: Vec<&Vec<Value>> = rows.iter().collect();
        for expected in &spec.expected_rows {
            match unmatched
                .iter()
                .position(|got| rows_match(expected, got, tolerance))
            {
                Some(idx) => {
                    unmatched.swap_remove(idx);
                }
                None => {
                    return Outcome::fail(
                        testcase,
                        FailureKind::ValueMismatch,
                        format!("expected row {} not found in result", Value::from(expected.clone())),
                        actual,
                    );
                }
            }
        }
    }

    Outcome::pass(testcase, actual)
}
