//! Notebook cell checks.
//!
//! Recorded outputs are trusted when present. A code cell without outputs is
//! executed with the challenge kernel in a single run: the sources of every
//! earlier code cell come first as a prelude, then a line printing a random
//! boundary marker, then the target cell. Stdout up to and including the
//! marker line is dropped so only the target cell's output remains.
//! Markdown and raw cells are never executed.

use assessor_common::artifact::{Artifact, CellOutput, CellType, Notebook, NotebookCell, OutputType};
use assessor_common::payload::{NotebookCellSpec, Tolerance};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::TestCase;
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use super::{json_matches, normalize_output, tolerance_of, truncate, wrong_artifact, EvalContext};
use crate::sandbox::{RunRequest, SandboxError};

const MAX_ERROR_CHARS: usize = 2000;

/// Outputs of a cell plus whether they came from a fresh run.
struct CellRun {
    outputs: Vec<CellOutput>,
    executed: bool,
    elapsed_ms: u64,
}

fn needs_outputs(spec: &NotebookCellSpec) -> bool {
    spec.expected_output_type.is_some() || !spec.expected_data.is_empty()
}

/// Statement that prints `marker` on its own line in the given kernel.
fn boundary_statement(kernel: &str, marker: &str) -> Option<String> {
    match kernel.to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => Some(format!("print(\"{marker}\")")),
        "javascript" | "js" | "node" => Some(format!("console.log(\"{marker}\")")),
        _ => None,
    }
}

/// Output printed after the marker line; everything when the marker never
/// appeared because the prelude failed first.
fn after_marker<'a>(stdout: &'a str, marker: &str) -> &'a str {
    match stdout.find(marker) {
        Some(at) => {
            let rest = &stdout[at + marker.len()..];
            rest.find('\n').map_or("", |nl| &rest[nl + 1..])
        }
        None => "",
    }
}

fn prelude_of(notebook: &Notebook, index: usize) -> String {
    notebook.cells[..index]
        .iter()
        .filter(|cell| cell.cell_type == CellType::Code)
        .map(|cell| cell.source.joined())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn execute(
    ctx: &EvalContext<'_>,
    testcase: &TestCase,
    notebook: &Notebook,
    index: usize,
) -> Result<Result<CellRun, Outcome>, SandboxError> {
    let kernel = ctx.challenge.notebook_kernel();
    let prelude = prelude_of(notebook, index);
    let target = notebook.cells[index].source.joined();
    let marker = format!("assessor-cell-{}", Uuid::new_v4().simple());
    let boundary = if prelude.trim().is_empty() {
        None
    } else {
        boundary_statement(kernel, &marker)
    };
    let source = match &boundary {
        Some(statement) => format!("{prelude}\n{statement}\n{target}"),
        None if prelude.is_empty() => target,
        None => format!("{prelude}\n{target}"),
    };
    let run = ctx
        .sandbox
        .run(RunRequest {
            language: kernel.to_string(),
            source,
            stdin: String::new(),
            timeout: Duration::from_secs(testcase.timeout_seconds as u64),
            memory_limit_mb: testcase.memory_limit_mb,
        })
        .await?;

    if run.timed_out {
        return Ok(Err(Outcome::fail(
            testcase,
            FailureKind::Timeout,
            format!("cell {index} exceeded time limit of {}s", testcase.timeout_seconds),
            None,
        )));
    }
    if run.memory_exceeded {
        return Ok(Err(Outcome::fail(
            testcase,
            FailureKind::MemoryExceeded,
            format!("cell {index} exceeded memory limit of {} MB", testcase.memory_limit_mb),
            None,
        )));
    }

    let stdout = match boundary {
        Some(_) => after_marker(&run.stdout, &marker).to_string(),
        None => run.stdout.clone(),
    };
    let mut outputs = Vec::new();
    if !stdout.is_empty() {
        outputs.push(CellOutput::stream("stdout", stdout));
    }
    if run.runtime_error || run.compilation_failed {
        outputs.push(CellOutput::error(
            "ExecutionError",
            truncate(run.stderr.trim(), MAX_ERROR_CHARS),
        ));
    }
    Ok(Ok(CellRun {
        outputs,
        executed: true,
        elapsed_ms: run.execution_time_ms,
    }))
}

/// A fresh run only sees stdout, so a stream stands in for a result.
fn type_matches(expected: OutputType, output: &CellOutput, executed: bool) -> bool {
    output.output_type == expected
        || (executed
            && output.output_type == OutputType::Stream
            && matches!(expected, OutputType::ExecuteResult | OutputType::DisplayData))
}

fn payload_matches(expected: &Value, actual: &Value, tolerance: Tolerance) -> bool {
    match (expected, actual) {
        (Value::String(e), Value::String(a)) => {
            normalize_output(e) == normalize_output(a)
                || (e.trim().parse::<f64>().is_ok() && json_matches(expected, &Value::String(a.trim().into()), tolerance))
        }
        (_, Value::String(a)) if !expected.is_object() && !expected.is_array() => {
            json_matches(expected, &Value::String(a.trim().into()), tolerance)
        }
        _ => json_matches(expected, actual, tolerance),
    }
}

fn metadata_subset(expected: &Map<String, Value>, cell: &NotebookCell, outputs: &[CellOutput]) -> Vec<String> {
    expected
        .iter()
        .filter(|(key, want)| {
            let found = std::iter::once(&cell.metadata)
                .chain(outputs.iter().map(|o| &o.metadata))
                .filter_map(|meta| meta.get(*key))
                .any(|got| json_matches(want, got, Tolerance::exact()));
            !found
        })
        .map(|(key, _)| format!("metadata {key} does not match"))
        .collect()
}

fn check_outputs(
    testcase: &TestCase,
    spec: &NotebookCellSpec,
    run: &CellRun,
) -> Result<(), (FailureKind, String)> {
    let errored = run
        .outputs
        .iter()
        .find(|o| o.output_type == OutputType::Error);
    if let Some(error) = errored {
        if spec.expected_output_type != Some(OutputType::Error) {
            return Err((
                FailureKind::RuntimeError,
                format!(
                    "cell {} raised {}: {}",
                    spec.cell_index,
                    error.ename.as_deref().unwrap_or("an error"),
                    error.evalue.as_deref().unwrap_or_default()
                ),
            ));
        }
    }

    if let Some(expected) = spec.expected_output_type {
        if !run.outputs.iter().any(|o| type_matches(expected, o, run.executed)) {
            return Err((
                FailureKind::OutputMismatch,
                format!("cell {} produced no {expected:?} output", spec.cell_index),
            ));
        }
    }

    let tolerance = tolerance_of(testcase);
    for (mime, expected) in &spec.expected_data {
        let matched = run
            .outputs
            .iter()
            .filter_map(|o| o.payload(mime))
            .any(|actual| payload_matches(expected, &actual, tolerance));
        if !matched {
            return Err((
                FailureKind::OutputMismatch,
                format!("cell {} output for {mime} did not match", spec.cell_index),
            ));
        }
    }
    Ok(())
}

pub(super) async fn evaluate(
    ctx: &EvalContext<'_>,
    testcase: &TestCase,
    spec: &NotebookCellSpec,
    artifact: &Artifact,
) -> Result<Outcome, SandboxError> {
    let Artifact::Notebook(notebook) = artifact else {
        return Ok(wrong_artifact(testcase, "notebook", artifact));
    };
    let Some(cell) = notebook.cells.get(spec.cell_index) else {
        return Ok(Outcome::fail(
            testcase,
            FailureKind::RequirementUnmet,
            format!(
                "notebook has {} cells, cell {} is missing",
                notebook.cells.len(),
                spec.cell_index
            ),
            None,
        ));
    };
    if cell.cell_type != spec.cell_type {
        return Ok(Outcome::fail(
            testcase,
            FailureKind::RequirementUnmet,
            format!(
                "cell {} should be {:?}, found {:?}",
                spec.cell_index, spec.cell_type, cell.cell_type
            ),
            None,
        ));
    }

    let source = cell.source.joined();
    let missing: Vec<&str> = spec
        .source_contains
        .iter()
        .map(String::as_str)
        .filter(|needle| !source.contains(needle))
        .collect();
    if !missing.is_empty() {
        return Ok(Outcome::fail(
            testcase,
            FailureKind::RequirementUnmet,
            format!("cell {} source lacks: {}", spec.cell_index, missing.join(", ")),
            None,
        ));
    }

    let run = if cell.cell_type == CellType::Code && cell.outputs.is_empty() && needs_outputs(spec) {
        match execute(ctx, testcase, notebook, spec.cell_index).await? {
            Ok(run) => run,
            Err(outcome) => return Ok(outcome),
        }
    } else {
        CellRun {
            outputs: cell.outputs.clone(),
            executed: false,
            elapsed_ms: 0,
        }
    };

    let actual = serde_json::to_value(&run.outputs).ok();
    let mut outcome = match check_outputs(testcase, spec, &run) {
        Err((kind, message)) => Outcome::fail(testcase, kind, message, actual),
        Ok(()) => {
            let unmet = metadata_subset(&spec.expected_metadata, cell, &run.outputs);
            if unmet.is_empty() {
                Outcome::pass(testcase, actual)
            } else {
                Outcome::fail(testcase, FailureKind::RequirementUnmet, unmet.join("; "), actual)
            }
        }
    };
    if run.executed {
        outcome = outcome.with_elapsed(run.elapsed_ms);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::sandbox::{RunOutput, ScriptedSandbox, SqlSandbox};
    use assessor_common::types::ExecutionEnvironment;
    use serde_json::json;

    fn notebook(cells: Value) -> Artifact {
        Artifact::Notebook(serde_json::from_value(json!({ "cells": cells })).unwrap())
    }

    fn spec(index: usize) -> NotebookCellSpec {
        NotebookCellSpec {
            cell_index: index,
            cell_type: CellType::Code,
            expected_output_type: None,
            expected_data: Map::new(),
            expected_metadata: Map::new(),
            source_contains: vec![],
        }
    }

    async fn run_with(sandbox: &ScriptedSandbox, spec: NotebookCellSpec, artifact: &Artifact) -> Outcome {
        let challenge = fixtures::challenge(ExecutionEnvironment::JupyterNotebook);
        let step = fixtures::step(challenge.id, 0, true);
        let tc = fixtures::notebook_case(0, spec.clone());
        let sql = SqlSandbox::new();
        let ctx = EvalContext {
            challenge: &challenge,
            step: &step,
            sandbox,
            sql: &sql,
        };
        evaluate(&ctx, &tc, &spec, artifact).await.unwrap()
    }

    #[tokio::test]
    async fn test_recorded_output_compared() {
        let nb = notebook(json!([
            { "cell_type": "code", "source": "6 * 7", "outputs": [
                { "output_type": "execute_result", "data": { "text/plain": ["42"] } }
            ]}
        ]));
        let mut s = spec(0);
        s.expected_output_type = Some(OutputType::ExecuteResult);
        s.expected_data.insert("text/plain".into(), json!("42"));
        let sandbox = ScriptedSandbox::printer();
        let out = run_with(&sandbox, s, &nb).await;
        assert!(out.passed, "{:?}", out.message);
        assert_eq!(sandbox.calls(), 0);
    }

    #[tokio::test]
    async fn test_unexecuted_cell_runs_with_prelude() {
        let nb = notebook(json!([
            { "cell_type": "markdown", "source": "# Intro" },
            { "cell_type": "code", "source": "print setup" },
            { "cell_type": "code", "source": "print 42" }
        ]));
        let mut s = spec(2);
        s.expected_data.insert("text/plain".into(), json!(42));
        let sandbox = ScriptedSandbox::printer();
        let out = run_with(&sandbox, s, &nb).await;
        assert!(out.passed, "{:?}", out.message);
        assert_eq!(sandbox.calls(), 1);
        assert_eq!(out.actual.unwrap()[0]["text"], "42\n");
    }

    #[tokio::test]
    async fn test_prelude_output_matching_target_is_dropped() {
        let nb = notebook(json!([
            { "cell_type": "code", "source": "print 42" },
            { "cell_type": "code", "source": "print 42" }
        ]));
        let mut s = spec(1);
        s.expected_data.insert("text/plain".into(), json!(42));
        let sandbox = ScriptedSandbox::printer();
        let out = run_with(&sandbox, s, &nb).await;
        assert!(out.passed, "{:?}", out.message);
        assert_eq!(sandbox.calls(), 1);
        assert_eq!(out.actual.unwrap()[0]["text"], "42\n");
    }

    #[test]
    fn test_after_marker() {
        assert_eq!(after_marker("a\nM\nb\n", "M"), "b\n");
        assert_eq!(after_marker("a\nM\n", "M"), "");
        assert_eq!(after_marker("a\n", "M"), "");
        assert!(boundary_statement("ruby", "M").is_none());
    }

    #[tokio::test]
    async fn test_markdown_presence_only() {
        let nb = notebook(json!([
            { "cell_type": "markdown", "source": ["## Findings\n", "Revenue grew."] }
        ]));
        let mut s = spec(0);
        s.cell_type = CellType::Markdown;
        s.source_contains = vec!["Findings".into()];
        let sandbox = ScriptedSandbox::printer();
        let out = run_with(&sandbox, s, &nb).await;
        assert!(out.passed);
        assert_eq!(sandbox.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_cell_and_wrong_type() {
        let nb = notebook(json!([{ "cell_type": "markdown", "source": "text" }]));
        let sandbox = ScriptedSandbox::printer();
        let out = run_with(&sandbox, spec(3), &nb).await;
        assert_eq!(out.error, Some(FailureKind::RequirementUnmet));
        let out = run_with(&sandbox, spec(0), &nb).await;
        assert!(out.message.unwrap().contains("should be"));
    }

    #[tokio::test]
    async fn test_runtime_error_reported() {
        let nb = notebook(json!([{ "cell_type": "code", "source": "1/0" }]));
        let sandbox = ScriptedSandbox::new(|_| {
            Ok(RunOutput {
                stderr: "ZeroDivisionError: division by zero".into(),
                exit_code: Some(1),
                runtime_error: true,
                ..Default::default()
            })
        });
        let mut s = spec(0);
        s.expected_data.insert("text/plain".into(), json!("1"));
        let out = run_with(&sandbox, s, &nb).await;
        assert_eq!(out.error, Some(FailureKind::RuntimeError));
        assert!(out.message.unwrap().contains("ZeroDivisionError"));
    }

    #[tokio::test]
    async fn test_expected_metadata_subset() {
        let nb = notebook(json!([
            { "cell_type": "code", "source": "plot()", "metadata": { "tags": ["chart"] }, "outputs": [
                { "output_type": "display_data", "data": { "image/png": "iVBOR" }, "metadata": { "width": 640 } }
            ]}
        ]));
        let mut s = spec(0);
        s.expected_output_type = Some(OutputType::DisplayData);
        s.expected_metadata.insert("width".into(), json!(640));
        let sandbox = ScriptedSandbox::printer();
        assert!(run_with(&sandbox, s.clone(), &nb).await.passed);

        s.expected_metadata.insert("height".into(), json!(480));
        let out = run_with(&sandbox, s, &nb).await;
        assert!(out.message.unwrap().contains("height"));
    }
}
