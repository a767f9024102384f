use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{TestCase, TestcaseType};

/// `Test` is ungraded practice over visible cases; `Submit` is graded over all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    Test,
    Submit,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMode::Test => "test",
            SubmissionMode::Submit => "submit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    /// Awaiting human judgement; neither pass nor fail.
    ReviewPending,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
            Verdict::ReviewPending => "review_pending",
        }
    }
}

/// Why a case did not pass. Resource exhaustion is kept apart from logic
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OutputMismatch,
    Timeout,
    MemoryExceeded,
    RuntimeError,
    CompilationError,
    ColumnMismatch,
    RowCountMismatch,
    ValueMismatch,
    SqlError,
    AssertionFailed,
    RequirementUnmet,
    InvalidArtifact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub execution_time_ms: u64,
    pub timeout_seconds: u32,
    pub memory_limit_mb: u32,
}

impl OutcomeMetrics {
    pub fn for_case(testcase: &TestCase) -> Self {
        Self {
            execution_time_ms: 0,
            timeout_seconds: testcase.timeout_seconds,
            memory_limit_mb: testcase.memory_limit_mb,
        }
    }
}

/// Result of one test case against one submission. Never persisted on its
/// own; only inside a step's stored execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub testcase_id: Uuid,
    pub testcase_type: TestcaseType,
    pub verdict: Verdict,
    pub passed: bool,
    #[serde(default)]
    pub actual: Option<Value>,
    #[serde(default)]
    pub error: Option<FailureKind>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub requires_manual_review: bool,
    pub metrics: OutcomeMetrics,
}

impl Outcome {
    fn base(testcase: &TestCase, verdict: Verdict) -> Self {
        Self {
            testcase_id: testcase.id,
            testcase_type: testcase.testcase_type(),
            verdict,
            passed: verdict == Verdict::Passed,
            actual: None,
            error: None,
            message: None,
            requires_manual_review: verdict == Verdict::ReviewPending,
            metrics: OutcomeMetrics::for_case(testcase),
        }
    }

    pub fn pass(testcase: &TestCase, actual: Option<Value>) -> Self {
        Self {
            actual,
            ..Self::base(testcase, Verdict::Passed)
        }
    }

    pub fn fail(
        testcase: &TestCase,
        error: FailureKind,
        message: impl Into<String>,
        actual: Option<Value>,
    ) -> Self {
        Self {
            actual,
            error: Some(error),
            message: Some(message.into()),
            ..Self::base(testcase, Verdict::Failed)
        }
    }

    pub fn pending_review(testcase: &TestCase, message: impl Into<String>, actual: Option<Value>) -> Self {
        Self {
            actual,
            message: Some(message.into()),
            ..Self::base(testcase, Verdict::ReviewPending)
        }
    }

    pub fn with_elapsed(mut self, execution_time_ms: u64) -> Self {
        self.metrics.execution_time_ms = execution_time_ms;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.verdict == Verdict::ReviewPending
    }

    /// Apply a reviewer's decision to a pending outcome.
    pub fn resolve(&mut self, passed: bool, note: Option<String>) {
        self.verdict = if passed { Verdict::Passed } else { Verdict::Failed };
        self.passed = passed;
        self.requires_manual_review = false;
        self.error = if passed {
            None
        } else {
            Some(FailureKind::RequirementUnmet)
        };
        if note.is_some() {
            self.message = note;
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Aggregate counters returned with every test/submit response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub passed: u32,
    pub total: u32,
    /// Percentage with one decimal; 0 when nothing was evaluated.
    pub success_rate: f64,
    pub all_passed: bool,
    pub pending_review: u32,
}

impl Summary {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let total = outcomes.len() as u32;
        let passed = outcomes.iter().filter(|o| o.passed).count() as u32;
        let pending_review = outcomes.iter().filter(|o| o.is_pending()).count() as u32;
        let success_rate = if total == 0 {
            0.0
        } else {
            round1(passed as f64 * 100.0 / total as f64)
        };
        Self {
            passed,
            total,
            success_rate,
            all_passed: total > 0 && passed == total,
            pending_review,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub timeout_seconds: u32,
    pub memory_limit_mb: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// Who is reading a result: candidates get redacted views, admins the raw
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Candidate,
    Admin,
}

/// Per-case entry of `execution_results[]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub testcase_id: Uuid,
    pub name: String,
    pub order_index: u32,
    pub testcase_type: TestcaseType,
    pub is_hidden: bool,
    pub is_example: bool,
    pub verdict: Verdict,
    pub passed: bool,
    pub requires_manual_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub metrics: ResultMetrics,
}

impl ExecutionResult {
    /// Render an outcome for an audience. Hidden cases shown to candidates
    /// lose every payload field; only the verdict, failure kind and limits
    /// survive.
    pub fn present(testcase: &TestCase, outcome: &Outcome, audience: Audience) -> Self {
        let redact = audience == Audience::Candidate && testcase.is_hidden;
        let metrics = ResultMetrics {
            timeout_seconds: outcome.metrics.timeout_seconds,
            memory_limit_mb: outcome.metrics.memory_limit_mb,
            execution_time_ms: match audience {
                Audience::Admin => Some(outcome.metrics.execution_time_ms),
                Audience::Candidate => None,
            },
        };
        let message = if redact {
            Some(match outcome.verdict {
                Verdict::Passed => "Hidden test passed".to_string(),
                Verdict::Failed => "Hidden test failed".to_string(),
                Verdict::ReviewPending => "Hidden test awaiting review".to_string(),
            })
        } else {
            outcome.message.clone()
        };

        Self {
            testcase_id: testcase.id,
            name: testcase.display_name(),
            order_index: testcase.order_index,
            testcase_type: testcase.testcase_type(),
            is_hidden: testcase.is_hidden,
            is_example: testcase.is_example,
            verdict: outcome.verdict,
            passed: outcome.passed,
            requires_manual_review: outcome.requires_manual_review,
            input: if redact {
                None
            } else {
                testcase.expectation.input_preview()
            },
            expected_output: if redact {
                None
            } else {
                Some(testcase.expectation.expected_preview())
            },
            actual_output: if redact { None } else { outcome.actual.clone() },
            error: outcome.error,
            message,
            metrics,
        }
    }
}
