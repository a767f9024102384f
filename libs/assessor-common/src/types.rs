use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::artifact::{NotebookCell, SpreadsheetCell};
use crate::payload::{Expectation, Tolerance};

pub const DEFAULT_TIMEOUT_SECONDS: u32 = 5;
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseCategory {
    Developer,
    DataAnalyst,
    BusinessAnalyst,
    Secretary,
    Accountant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

/// Lifecycle of authored content. Only `Published` is visible to candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl PublicationStatus {
    pub fn is_public(&self) -> bool {
        matches!(self, PublicationStatus::Published)
    }
}

/// Where a challenge's artifact is produced and judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEnvironment {
    CodeExecutor,
    JupyterNotebook,
    SqlDatabase,
    DataVisualization,
    DiagramEditor,
    TextEditor,
    SpreadsheetCalculator,
}

impl ExecutionEnvironment {
    pub const ALL: [ExecutionEnvironment; 7] = [
        ExecutionEnvironment::CodeExecutor,
        ExecutionEnvironment::JupyterNotebook,
        ExecutionEnvironment::SqlDatabase,
        ExecutionEnvironment::DataVisualization,
        ExecutionEnvironment::DiagramEditor,
        ExecutionEnvironment::TextEditor,
        ExecutionEnvironment::SpreadsheetCalculator,
    ];

    /// Test-case families that may appear under this environment.
    pub fn testcase_types(&self) -> &'static [TestcaseType] {
        match self {
            ExecutionEnvironment::CodeExecutor => &[TestcaseType::UnitTest],
            ExecutionEnvironment::JupyterNotebook => {
                &[TestcaseType::NotebookCellTest, TestcaseType::StatisticalTest]
            }
            ExecutionEnvironment::SqlDatabase => &[TestcaseType::SqlQueryTest],
            ExecutionEnvironment::DataVisualization => {
                &[TestcaseType::VisualizationTest, TestcaseType::StatisticalTest]
            }
            ExecutionEnvironment::DiagramEditor => &[TestcaseType::DiagramTest],
            ExecutionEnvironment::TextEditor => &[TestcaseType::DocumentTest],
            ExecutionEnvironment::SpreadsheetCalculator => &[TestcaseType::FinancialTest],
        }
    }

    pub fn supports(&self, testcase_type: TestcaseType) -> bool {
        self.testcase_types().contains(&testcase_type)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEnvironment::CodeExecutor => "code_executor",
            ExecutionEnvironment::JupyterNotebook => "jupyter_notebook",
            ExecutionEnvironment::SqlDatabase => "sql_database",
            ExecutionEnvironment::DataVisualization => "data_visualization",
            ExecutionEnvironment::DiagramEditor => "diagram_editor",
            ExecutionEnvironment::TextEditor => "text_editor",
            ExecutionEnvironment::SpreadsheetCalculator => "spreadsheet_calculator",
        }
    }
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionEnvironment::ALL
            .into_iter()
            .find(|env| env.as_str() == s)
            .ok_or_else(|| format!("unknown execution environment: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestcaseType {
    UnitTest,
    SqlQueryTest,
    StatisticalTest,
    VisualizationTest,
    NotebookCellTest,
    DiagramTest,
    DocumentTest,
    FinancialTest,
}

impl TestcaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestcaseType::UnitTest => "unit_test",
            TestcaseType::SqlQueryTest => "sql_query_test",
            TestcaseType::StatisticalTest => "statistical_test",
            TestcaseType::VisualizationTest => "visualization_test",
            TestcaseType::NotebookCellTest => "notebook_cell_test",
            TestcaseType::DiagramTest => "diagram_test",
            TestcaseType::DocumentTest => "document_test",
            TestcaseType::FinancialTest => "financial_test",
        }
    }
}

impl fmt::Display for TestcaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exercise {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: ExerciseCategory,
    #[serde(default)]
    pub language: Option<String>,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub required_skills: Vec<String>,
    pub estimated_duration_minutes: u32,
    #[serde(default)]
    pub business_domain: Option<String>,
    #[serde(default)]
    pub status: PublicationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Challenge {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Filled from the enclosing exercise when loaded from a document.
    #[serde(default)]
    pub exercise_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PublicationStatus,
    pub execution_environment: ExecutionEnvironment,
    /// Free-form per-environment settings (e.g. `{"kernel": "python"}`).
    #[serde(default)]
    pub environment_config: serde_json::Value,
    pub order_index: u32,
}

impl Challenge {
    /// Kernel language used when notebook code cells must be executed.
    pub fn notebook_kernel(&self) -> &str {
        self.environment_config
            .get("kernel")
            .and_then(|v| v.as_str())
            .unwrap_or("python")
    }
}

/// Per-step scoring overrides. Missing weights count as 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationCriteria {
    #[serde(default)]
    pub weights: BTreeMap<Uuid, f64>,
    #[serde(default)]
    pub max_score: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl EvaluationCriteria {
    pub fn weight_of(&self, testcase_id: &Uuid) -> f64 {
        self.weights.get(testcase_id).copied().unwrap_or(1.0)
    }
}

/// Environment-specific starter material. The family must match the
/// parent challenge's environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepTemplate {
    Notebook {
        #[serde(default)]
        cells: Vec<NotebookCell>,
    },
    Sql {
        schema_sql: String,
        #[serde(default)]
        sample_queries: Vec<String>,
    },
    Visualization {
        #[serde(default)]
        dataset: Vec<serde_json::Map<String, serde_json::Value>>,
    },
    Diagram {
        #[serde(default)]
        palette: Vec<String>,
    },
    Document {
        #[serde(default)]
        outline: String,
    },
    Spreadsheet {
        #[serde(default)]
        cells: BTreeMap<String, SpreadsheetCell>,
    },
}

impl StepTemplate {
    pub fn environment(&self) -> ExecutionEnvironment {
        match self {
            StepTemplate::Notebook { .. } => ExecutionEnvironment::JupyterNotebook,
            StepTemplate::Sql { .. } => ExecutionEnvironment::SqlDatabase,
            StepTemplate::Visualization { .. } => ExecutionEnvironment::DataVisualization,
            StepTemplate::Diagram { .. } => ExecutionEnvironment::DiagramEditor,
            StepTemplate::Document { .. } => ExecutionEnvironment::TextEditor,
            StepTemplate::Spreadsheet { .. } => ExecutionEnvironment::SpreadsheetCalculator,
        }
    }

    /// Content handed to a candidate who has not saved anything yet.
    pub fn starter_content(&self) -> String {
        match self {
            StepTemplate::Notebook { cells } => {
                serde_json::json!({ "cells": cells }).to_string()
            }
            StepTemplate::Sql { sample_queries, .. } => {
                sample_queries.first().cloned().unwrap_or_default()
            }
            StepTemplate::Visualization { dataset } => serde_json::json!({
                "mark": "bar",
                "encoding": {},
                "data": { "values": dataset },
            })
            .to_string(),
            StepTemplate::Diagram { .. } => {
                serde_json::json!({ "nodes": [], "edges": [] }).to_string()
            }
            StepTemplate::Document { outline } => outline.clone(),
            StepTemplate::Spreadsheet { cells } => {
                serde_json::json!({ "cells": cells }).to_string()
            }
        }
    }

    pub fn schema_sql(&self) -> Option<&str> {
        match self {
            StepTemplate::Sql { schema_sql, .. } => Some(schema_sql.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeStep {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub challenge_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub instructions: String,
    pub order_index: u32,
    #[serde(default)]
    pub is_final_step: bool,
    #[serde(default)]
    pub starter_code: Option<String>,
    #[serde(default)]
    pub solution_code: Option<String>,
    #[serde(default)]
    pub evaluation_criteria: Option<EvaluationCriteria>,
    #[serde(default)]
    pub template: Option<StepTemplate>,
}

impl ChallengeStep {
    pub fn starter_content(&self) -> String {
        if let Some(code) = &self.starter_code {
            return code.clone();
        }
        self.template
            .as_ref()
            .map(|t| t.starter_content())
            .unwrap_or_default()
    }
}

fn default_timeout_seconds() -> u32 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_memory_limit_mb() -> u32 {
    DEFAULT_MEMORY_LIMIT_MB
}

/// A declarative expectation. The comparison payload is flattened next to
/// the common fields and tagged by `testcase_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub step_id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default)]
    pub is_example: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default)]
    pub numerical_tolerance: Option<Tolerance>,
    pub order_index: u32,
    #[serde(flatten)]
    pub expectation: Expectation,
}

impl TestCase {
    pub fn testcase_type(&self) -> TestcaseType {
        self.expectation.testcase_type()
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Test {}", self.order_index + 1)
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{OutputComparison, ToleranceMode};

    #[test]
    fn test_environment_compatibility_table() {
        assert!(ExecutionEnvironment::SqlDatabase.supports(TestcaseType::SqlQueryTest));
        assert!(!ExecutionEnvironment::CodeExecutor.supports(TestcaseType::SqlQueryTest));
        assert!(ExecutionEnvironment::DataVisualization.supports(TestcaseType::StatisticalTest));
        assert!(ExecutionEnvironment::JupyterNotebook.supports(TestcaseType::NotebookCellTest));
        assert!(!ExecutionEnvironment::TextEditor.supports(TestcaseType::DiagramTest));
    }

    #[test]
    fn test_environment_parse_and_display() {
        for env in ExecutionEnvironment::ALL {
            assert_eq!(env.to_string().parse::<ExecutionEnvironment>().unwrap(), env);
        }
        assert!("excel".parse::<ExecutionEnvironment>().is_err());
    }

    #[test]
    fn test_testcase_flattened_payload() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "step_id": Uuid::new_v4(),
            "order_index": 0,
            "testcase_type": "unit_test",
            "input": "5",
            "expected_output": "120",
            "is_hidden": true
        });
        let tc: TestCase = serde_json::from_value(raw).unwrap();
        assert_eq!(tc.testcase_type(), TestcaseType::UnitTest);
        assert_eq!(tc.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(tc.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);
        assert!(tc.is_hidden);
        match &tc.expectation {
            Expectation::UnitTest(spec) => {
                assert_eq!(spec.expected_output, "120");
                assert_eq!(spec.comparison, OutputComparison::Normalized);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let back = serde_json::to_value(&tc).unwrap();
        assert_eq!(back["testcase_type"], "unit_test");
        assert_eq!(back["expected_output"], "120");
    }

    #[test]
    fn test_tolerance_accepts_bare_number() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "step_id": Uuid::new_v4(),
            "order_index": 1,
            "numerical_tolerance": 0.01,
            "testcase_type": "statistical_test",
            "assertions": [{ "statistic": "mean", "field": "x", "expected": 2.0 }]
        });
        let tc: TestCase = serde_json::from_value(raw).unwrap();
        let tol = tc.numerical_tolerance.unwrap();
        assert_eq!(tol.mode, ToleranceMode::Absolute);
        assert!((tol.value - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn test_step_template_environment() {
        let t: StepTemplate = serde_json::from_value(serde_json::json!({
            "kind": "sql",
            "schema_sql": "CREATE TABLE t(a INT);"
        }))
        .unwrap();
        assert_eq!(t.environment(), ExecutionEnvironment::SqlDatabase);
        assert_eq!(t.schema_sql(), Some("CREATE TABLE t(a INT);"));
    }

    #[test]
    fn test_notebook_kernel_default() {
        let ch = Challenge {
            id: Uuid::new_v4(),
            exercise_id: Uuid::new_v4(),
            title: "nb".into(),
            description: String::new(),
            status: PublicationStatus::Published,
            execution_environment: ExecutionEnvironment::JupyterNotebook,
            environment_config: serde_json::Value::Null,
            order_index: 0,
        };
        assert_eq!(ch.notebook_kernel(), "python");
    }
}
