//! Unit-test evaluator: run the program with the case's stdin and compare
//! captured stdout.
//!
//! Normalization (`comparison = normalized`):
//! - `\r\n` becomes `\n`
//! - trailing whitespace is stripped from every line
//! - leading and trailing blank space of the whole output is trimmed
//!
//! Case and internal whitespace are preserved. Resource failures are judged
//! before output, so a killed program never "passes" on partial output.

use assessor_common::artifact::Artifact;
use assessor_common::payload::{OutputComparison, UnitTestSpec};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::TestCase;
use serde_json::Value;
use std::time::Duration;

use super::{truncate, wrong_artifact, EvalContext};
use crate::sandbox::{RunOutput, RunRequest, SandboxError};

const MAX_STDERR_CHARS: usize = 2000;

pub fn normalize_output(output: &str) -> String {
    output
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub(super) async fn evaluate(
    ctx: &EvalContext<'_>,
    testcase: &TestCase,
    spec: &UnitTestSpec,
    artifact: &Artifact,
) -> Result<Outcome, SandboxError> {
    let Artifact::Source { language, code } = artifact else {
        return Ok(wrong_artifact(testcase, "source", artifact));
    };

    let output = ctx
        .sandbox
        .run(RunRequest {
            language: language.clone(),
            source: code.clone(),
            stdin: spec.input.clone(),
            timeout: Duration::from_secs(testcase.timeout_seconds as u64),
            memory_limit_mb: testcase.memory_limit_mb,
        })
        .await?;

    Ok(judge(testcase, spec, &output))
}

/// Classify one run. Priority: timeout, memory, compilation, runtime error,
/// then output comparison.
pub(super) fn judge(testcase: &TestCase, spec: &UnitTestSpec, output: &RunOutput) -> Outcome {
    let stdout = Some(Value::String(output.stdout.clone()));
    let outcome = if output.timed_out {
        Outcome::fail(
            testcase,
            FailureKind::Timeout,
            format!("exceeded time limit of {}s", testcase.timeout_seconds),
            None,
        )
    } else if output.memory_exceeded {
        Outcome::fail(
            testcase,
            FailureKind::MemoryExceeded,
            format!("exceeded memory limit of {} MB", testcase.memory_limit_mb),
            None,
        )
    } else if output.compilation_failed {
        Outcome::fail(
            testcase,
            FailureKind::CompilationError,
            truncate(output.stderr.trim(), MAX_STDERR_CHARS),
            None,
        )
    } else if output.runtime_error {
        Outcome::fail(
            testcase,
            FailureKind::RuntimeError,
            truncate(output.stderr.trim(), MAX_STDERR_CHARS),
            stdout,
        )
    } else {
        let matched = match spec.comparison {
            OutputComparison::Exact => output.stdout == spec.expected_output,
            OutputComparison::Normalized => {
                normalize_output(&output.stdout) == normalize_output(&spec.expected_output)
            }
        };
        if matched {
            Outcome::pass(testcase, stdout)
        } else {
            Outcome::fail(
                testcase,
                FailureKind::OutputMismatch,
                "output did not match the expected output",
                stdout,
            )
        }
    };
    outcome.with_elapsed(output.execution_time_ms)
}
