use assessor_common::artifact::{Artifact, ChartSpec};
use assessor_common::payload::VisualizationSpec;
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::TestCase;
use serde_json::json;

use super::wrong_artifact;

fn check(spec: &VisualizationSpec, chart: &ChartSpec) -> Vec<String> {
    let mut problems = Vec::new();

    if let Some(expected) = &spec.chart_type {
        if !chart.mark.name().eq_ignore_ascii_case(expected) {
            problems.push(format!(
                "expected a {expected} chart, got {}",
                chart.mark.name()
            ));
        }
    }

    for required in &spec.required_encodings {
        let Some(encoding) = chart.encoding.get(&required.channel) else {
            problems.push(format!("missing {} encoding", required.channel));
            continue;
        };
        let Some(wanted) = &required.field else {
            continue;
        };
        if encoding.field.as_deref() != Some(wanted.as_str()) {
            problems.push(format!(
                "{} should encode field {wanted}, got {}",
                required.channel,
                encoding.field.as_deref().unwrap_or("nothing")
            ));
        } else if !chart.data.values.is_empty()
            && !chart.data.values.iter().any(|row| row.contains_key(wanted))
        {
            problems.push(format!("field {wanted} does not appear in the chart data"));
        }
    }

    let points = chart.data.values.len();
    if let Some(min) = spec.min_data_points {
        if points < min {
            problems.push(format!("expected at least {min} data points, got {points}"));
        }
    }
    if let Some(max) = spec.max_data_points {
        if points > max {
            problems.push(format!("expected at most {max} data points, got {points}"));
        }
    }

    if spec.require_title && chart.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
        problems.push("chart has no title".to_string());
    }

    problems
}

pub(super) fn evaluate(testcase: &TestCase, spec: &VisualizationSpec, artifact: &Artifact) -> Outcome {
    let Artifact::Chart(chart) = artifact else {
        return wrong_artifact(testcase, "chart", artifact);
    };
    let actual = Some(json!({
        "mark": chart.mark.name(),
        "encoding": chart.encoding,
        "data_points": chart.data.values.len(),
        "title": chart.title,
    }));
    let problems = check(spec, chart);
    if problems.is_empty() {
        Outcome::pass(testcase, actual)
    } else {
        Outcome::fail(testcase, FailureKind::RequirementUnmet, problems.join("; "), actual)
    }
}
