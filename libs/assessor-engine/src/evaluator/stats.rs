use assessor_common::artifact::{Artifact, CellType, Notebook};
use assessor_common::payload::{StatAssertion, Statistic, StatisticalSpec};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::TestCase;
use serde_json::{Map, Value};

use super::{as_number, tolerance_of, wrong_artifact};

/// Tabular records plus named scalars pulled out of an artifact.
#[derive(Debug, Default)]
struct Dataset {
    records: Vec<Map<String, Value>>,
    scalars: Map<String, Value>,
}

fn records_of(value: &Value) -> Option<Vec<Map<String, Value>>> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| item.as_object().cloned())
        .collect::<Option<Vec<_>>>()
        .filter(|records| !records.is_empty())
}

/// Notebook outputs are scanned in order: JSON arrays of objects replace the
/// record set, JSON objects contribute scalars. Stream text that parses as
/// JSON counts too.
fn notebook_dataset(notebook: &Notebook) -> Dataset {
    let mut dataset = Dataset::default();
    if let Some(records) = notebook.metadata.get("dataset").and_then(records_of) {
        dataset.records = records;
    }
    let code_outputs = notebook
        .cells
        .iter()
        .filter(|cell| cell.cell_type == CellType::Code)
        .flat_map(|cell| cell.outputs.iter());
    for output in code_outputs {
        let payload = output.payload("application/json").or_else(|| {
            output
                .payload("text/plain")
                .and_then(|text| text.as_str().and_then(|s| serde_json::from_str(s.trim()).ok()))
        });
        match payload {
            Some(Value::Object(map)) => dataset.scalars.extend(map),
            Some(other) => {
                if let Some(records) = records_of(&other) {
                    dataset.records = records;
                }
            }
            None => {}
        }
    }
    dataset
}

fn dataset_of(artifact: &Artifact) -> Option<Dataset> {
    match artifact {
        Artifact::Notebook(notebook) => Some(notebook_dataset(notebook)),
        Artifact::Chart(chart) => Some(Dataset {
            records: chart.data.values.clone(),
            scalars: Map::new(),
        }),
        _ => None,
    }
}

/// Sample statistics; `None` when the input cannot support the statistic.
pub fn compute_statistic(statistic: Statistic, values: &[f64]) -> Option<f64> {
    let n = values.len();
    if statistic == Statistic::Count {
        return Some(n as f64);
    }
    if n == 0 {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let mean = sum / n as f64;
    let variance = || {
        (n >= 2).then(|| values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64)
    };
    match statistic {
        Statistic::Count => Some(n as f64),
        Statistic::Value => (n == 1).then(|| values[0]),
        Statistic::Sum => Some(sum),
        Statistic::Mean => Some(mean),
        Statistic::Median => {
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let mid = n / 2;
            Some(if n % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            })
        }
        Statistic::Min => values.iter().copied().reduce(f64::min),
        Statistic::Max => values.iter().copied().reduce(f64::max),
        Statistic::Variance => variance(),
        Statistic::StdDev => variance().map(f64::sqrt),
    }
}

fn observe(dataset: &Dataset, assertion: &StatAssertion) -> Option<f64> {
    if assertion.statistic == Statistic::Value {
        if let Some(value) = dataset.scalars.get(&assertion.field) {
            return as_number(value);
        }
    }
    if assertion.statistic == Statistic::Count && assertion.field == "*" {
        return Some(dataset.records.len() as f64);
    }
    let values: Vec<f64> = dataset
        .records
        .iter()
        .filter_map(|record| record.get(&assertion.field))
        .filter_map(as_number)
        .collect();
    compute_statistic(assertion.statistic, &values)
}

pub(super) fn evaluate(testcase: &TestCase, spec: &StatisticalSpec, artifact: &Artifact) -> Outcome {
    let Some(dataset) = dataset_of(artifact) else {
        return wrong_artifact(testcase, "notebook or chart", artifact);
    };
    if dataset.records.is_empty() && dataset.scalars.is_empty() {
        return Outcome::fail(
            testcase,
            FailureKind::InvalidArtifact,
            "no dataset found in submission",
            None,
        );
    }

    let tolerance = tolerance_of(testcase);
    let mut observed = Map::new();
    let mut failures = Vec::new();
    for assertion in &spec.assertions {
        let label = assertion.describe();
        match observe(&dataset, assertion) {
            Some(actual) => {
                observed.insert(
                    label.clone(),
                    serde_json::Number::from_f64(actual)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                );
                if !tolerance.within(assertion.expected, actual) {
                    failures.push(format!("{label}: expected {}, got {actual}", assertion.expected));
                }
            }
            None => {
                observed.insert(label.clone(), Value::Null);
                failures.push(format!("{label}: no numeric values for field {}", assertion.field));
            }
        }
    }

    let actual = Some(Value::Object(observed));
    if failures.is_empty() {
        Outcome::pass(testcase, actual)
    } else {
        Outcome::fail(testcase, FailureKind::AssertionFailed, failures.join("; "), actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use assessor_common::artifact::ChartSpec;
    use assessor_common::payload::Tolerance;
    use serde_json::json;

    fn chart(values: Value) -> Artifact {
        let spec: ChartSpec = serde_json::from_value(json!({
            "mark": "bar",
            "data": { "values": values }
        }))
        .unwrap();
        Artifact::Chart(spec)
    }

    fn assertion(statistic: Statistic, field: &str, expected: f64) -> StatAssertion {
        StatAssertion {
            label: None,
            statistic,
            field: field.into(),
            expected,
        }
    }

    #[test]
    fn test_compute_statistics() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(compute_statistic(Statistic::Mean, &v), Some(5.0));
        assert_eq!(compute_statistic(Statistic::Median, &v), Some(4.5));
        assert_eq!(compute_statistic(Statistic::Min, &v), Some(2.0));
        assert_eq!(compute_statistic(Statistic::Max, &v), Some(9.0));
        assert_eq!(compute_statistic(Statistic::Count, &v), Some(8.0));
        let var = compute_statistic(Statistic::Variance, &v).unwrap();
        assert!((var - 32.0 / 7.0).abs() < 1e-9);
        assert_eq!(compute_statistic(Statistic::StdDev, &[1.0]), None);
        assert_eq!(compute_statistic(Statistic::Mean, &[]), None);
    }

    #[test]
    fn test_tolerance_boundary_on_mean() {
        let artifact = chart(json!([{ "x": 10.009 }]));
        let passing = fixtures::stats_case(0, vec![assertion(Statistic::Mean, "x", 10.0)], Tolerance::absolute(0.01));
        let StatisticalSpecCase(spec) = StatisticalSpecCase::of(&passing);
        assert!(evaluate(&passing, &spec, &artifact).passed);

        let artifact = chart(json!([{ "x": 10.02 }]));
        let out = evaluate(&passing, &spec, &artifact);
        assert_eq!(out.error, Some(FailureKind::AssertionFailed));

        let artifact = chart(json!([{ "x": 9.991 }]));
        assert!(evaluate(&passing, &spec, &artifact).passed);
        let artifact = chart(json!([{ "x": 9.98 }]));
        assert!(!evaluate(&passing, &spec, &artifact).passed);
    }

    #[test]
    fn test_notebook_scalars_and_records() {
        let notebook: Notebook = serde_json::from_value(json!({
            "cells": [
                { "cell_type": "code", "source": "df", "outputs": [
                    { "output_type": "execute_result", "data": { "application/json": [{ "sales": 10 }, { "sales": "20" }] } }
                ]},
                { "cell_type": "code", "source": "print(json.dumps(stats))", "outputs": [
                    { "output_type": "stream", "name": "stdout", "text": "{\"r2\": 0.87}\n" }
                ]}
            ]
        }))
        .unwrap();
        let tc = fixtures::stats_case(
            0,
            vec![
                assertion(Statistic::Sum, "sales", 30.0),
                assertion(Statistic::Value, "r2", 0.87),
                assertion(Statistic::Count, "*", 2.0),
            ],
            Tolerance::absolute(0.001),
        );
        let StatisticalSpecCase(spec) = StatisticalSpecCase::of(&tc);
        let out = evaluate(&tc, &spec, &Artifact::Notebook(notebook));
        assert!(out.passed, "{:?}", out.message);
    }

    #[test]
    fn test_missing_field_fails() {
        let tc = fixtures::stats_case(0, vec![assertion(Statistic::Mean, "y", 1.0)], Tolerance::absolute(0.1));
        let StatisticalSpecCase(spec) = StatisticalSpecCase::of(&tc);
        let out = evaluate(&tc, &spec, &chart(json!([{ "x": 1 }])));
        assert!(out.message.unwrap().contains("no numeric values"));
    }

    #[test]
    fn test_wrong_artifact() {
        let tc = fixtures::stats_case(0, vec![], Tolerance::absolute(0.1));
        let StatisticalSpecCase(spec) = StatisticalSpecCase::of(&tc);
        let out = evaluate(&tc, &spec, &Artifact::Document("text".into()));
        assert_eq!(out.error, Some(FailureKind::InvalidArtifact));
    }

    struct StatisticalSpecCase(StatisticalSpec);

    impl StatisticalSpecCase {
        fn of(tc: &TestCase) -> Self {
            match &tc.expectation {
                assessor_common::payload::Expectation::StatisticalTest(spec) => Self(spec.clone()),
                other => panic!("not a statistical case: {other:?}"),
            }
        }
    }
}
