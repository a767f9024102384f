// Prometheus metrics for the grading surface

use assessor_common::error::AssessError;
use assessor_common::results::{ExecutionResult, SubmissionMode};
use assessor_engine::tracker::SubmissionResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "assessor_submissions_total",
        "Test and submit runs by outcome",
        &["mode", "result"]
    )
    .expect("metric definition is valid");
    pub static ref EVALUATIONS: IntCounterVec = register_int_counter_vec!(
        "assessor_evaluations_total",
        "Per test case verdicts",
        &["testcase_type", "verdict"]
    )
    .expect("metric definition is valid");
    pub static ref SUBMISSION_SECONDS: HistogramVec = register_histogram_vec!(
        "assessor_submission_seconds",
        "Wall-clock time of test and submit runs",
        &["mode"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("metric definition is valid");
    pub static ref REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "assessor_rejections_total",
        "Requests refused with an error, by error code",
        &["reason"]
    )
    .expect("metric definition is valid");
}

fn result_label(response: &SubmissionResponse) -> &'static str {
    if response.summary.pending_review > 0 {
        "pending_review"
    } else if response.summary.all_passed {
        "passed"
    } else {
        "failed"
    }
}

pub fn record_run(mode: SubmissionMode, result: &Result<SubmissionResponse, AssessError>) {
    match result {
        Ok(response) => {
            SUBMISSIONS
                .with_label_values(&[mode.as_str(), result_label(response)])
                .inc();
            record_results(&response.execution_results);
        }
        Err(e) => SUBMISSIONS.with_label_values(&[mode.as_str(), e.code()]).inc(),
    }
}

pub fn record_results(results: &[ExecutionResult]) {
    for r in results {
        EVALUATIONS
            .with_label_values(&[r.testcase_type.as_str(), r.verdict.as_str()])
            .inc();
    }
}

pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
