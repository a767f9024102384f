//! Comparison payloads carried by test cases, one family per `testcase_type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::{CellType, OutputType};
use crate::types::TestcaseType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    #[default]
    Absolute,
    Relative,
}

/// Numeric slack for comparisons. Deserializes from a bare number
/// (absolute) or `{value, mode}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ToleranceRepr")]
pub struct Tolerance {
    pub value: f64,
    pub mode: ToleranceMode,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToleranceRepr {
    Bare(f64),
    Full {
        value: f64,
        #[serde(default)]
        mode: ToleranceMode,
    },
}

impl From<ToleranceRepr> for Tolerance {
    fn from(repr: ToleranceRepr) -> Self {
        match repr {
            ToleranceRepr::Bare(value) => Tolerance::absolute(value),
            ToleranceRepr::Full { value, mode } => Tolerance { value, mode },
        }
    }
}

/// Absorbs binary representation noise at the tolerance boundary.
const FLOAT_SLACK: f64 = 1e-12;

impl Tolerance {
    pub fn absolute(value: f64) -> Self {
        Self {
            value,
            mode: ToleranceMode::Absolute,
        }
    }

    pub fn relative(value: f64) -> Self {
        Self {
            value,
            mode: ToleranceMode::Relative,
        }
    }

    /// Exact comparison, used when a test declares no tolerance.
    pub fn exact() -> Self {
        Self::absolute(0.0)
    }

    pub fn within(&self, expected: f64, actual: f64) -> bool {
        if !expected.is_finite() || !actual.is_finite() {
            return expected == actual;
        }
        let bound = match self.mode {
            ToleranceMode::Absolute => self.value,
            ToleranceMode::Relative => self.value * expected.abs(),
        };
        (actual - expected).abs() <= bound + FLOAT_SLACK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputComparison {
    Exact,
    #[default]
    Normalized,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitTestSpec {
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub comparison: OutputComparison,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlQuerySpec {
    /// Statements run after the step schema and before the candidate query.
    #[serde(default)]
    pub setup_sql: Option<String>,
    #[serde(default)]
    pub expected_columns: Vec<String>,
    #[serde(default)]
    pub expected_rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub order_matters: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Value,
    Count,
    Sum,
    Mean,
    Median,
    Min,
    Max,
    StdDev,
    Variance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatAssertion {
    #[serde(default)]
    pub label: Option<String>,
    pub statistic: Statistic,
    pub field: String,
    pub expected: f64,
}

impl StatAssertion {
    pub fn describe(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{:?}({})", self.statistic, self.field).to_lowercase())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticalSpec {
    pub assertions: Vec<StatAssertion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingRequirement {
    pub channel: String,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualizationSpec {
    #[serde(default)]
    pub chart_type: Option<String>,
    #[serde(default)]
    pub required_encodings: Vec<EncodingRequirement>,
    #[serde(default)]
    pub min_data_points: Option<usize>,
    #[serde(default)]
    pub max_data_points: Option<usize>,
    #[serde(default)]
    pub require_title: bool,
}

fn default_cell_type() -> CellType {
    CellType::Code
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotebookCellSpec {
    pub cell_index: usize,
    #[serde(default = "default_cell_type")]
    pub cell_type: CellType,
    #[serde(default)]
    pub expected_output_type: Option<OutputType>,
    /// MIME type → expected payload, e.g. `{"text/plain": "42"}`.
    #[serde(default)]
    pub expected_data: Map<String, Value>,
    #[serde(default)]
    pub expected_metadata: Map<String, Value>,
    #[serde(default)]
    pub source_contains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RubricItem {
    pub criterion: String,
    #[serde(default)]
    pub points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiagramRequirements {
    #[serde(default)]
    pub min_nodes: Option<usize>,
    #[serde(default)]
    pub min_edges: Option<usize>,
    #[serde(default)]
    pub required_node_kinds: Vec<String>,
    #[serde(default)]
    pub required_labels: Vec<String>,
    #[serde(default)]
    pub required_connections: Vec<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagramSpec {
    #[serde(default)]
    pub requirements: DiagramRequirements,
    #[serde(default)]
    pub rubric: Vec<RubricItem>,
    #[serde(default)]
    pub requires_manual_review: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentStructure {
    #[serde(default)]
    pub required_headings: Vec<String>,
    #[serde(default)]
    pub required_phrases: Vec<String>,
    #[serde(default)]
    pub forbidden_phrases: Vec<String>,
    #[serde(default)]
    pub min_words: Option<usize>,
    #[serde(default)]
    pub max_words: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FormattingRules {
    #[serde(default)]
    pub require_title: bool,
    #[serde(default)]
    pub max_heading_depth: Option<usize>,
    #[serde(default)]
    pub max_paragraph_words: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSpec {
    #[serde(default)]
    pub structure: DocumentStructure,
    #[serde(default)]
    pub formatting: FormattingRules,
    #[serde(default)]
    pub rubric: Vec<RubricItem>,
    #[serde(default)]
    pub requires_manual_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialRule {
    /// Cell reference such as `B7`.
    pub cell: String,
    pub expected: f64,
    #[serde(default)]
    pub tolerance: Option<Tolerance>,
    #[serde(default)]
    pub require_formula: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialSpec {
    pub rules: Vec<FinancialRule>,
    #[serde(default)]
    pub requires_manual_review: bool,
}

/// The closed set of comparison payloads. Adding a variant forces every
/// evaluator `match` to handle it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "testcase_type", rename_all = "snake_case")]
pub enum Expectation {
    UnitTest(UnitTestSpec),
    SqlQueryTest(SqlQuerySpec),
    StatisticalTest(StatisticalSpec),
    VisualizationTest(VisualizationSpec),
    NotebookCellTest(NotebookCellSpec),
    DiagramTest(DiagramSpec),
    DocumentTest(DocumentSpec),
    FinancialTest(FinancialSpec),
}

impl Expectation {
    pub fn testcase_type(&self) -> TestcaseType {
        match self {
            Expectation::UnitTest(_) => TestcaseType::UnitTest,
            Expectation::SqlQueryTest(_) => TestcaseType::SqlQueryTest,
            Expectation::StatisticalTest(_) => TestcaseType::StatisticalTest,
            Expectation::VisualizationTest(_) => TestcaseType::VisualizationTest,
            Expectation::NotebookCellTest(_) => TestcaseType::NotebookCellTest,
            Expectation::DiagramTest(_) => TestcaseType::DiagramTest,
            Expectation::DocumentTest(_) => TestcaseType::DocumentTest,
            Expectation::FinancialTest(_) => TestcaseType::FinancialTest,
        }
    }

    /// Families whose automated checks only gate a human verdict.
    pub fn requires_manual_review(&self) -> bool {
        match self {
            Expectation::DiagramTest(spec) => spec.requires_manual_review,
            Expectation::DocumentTest(spec) => spec.requires_manual_review,
            Expectation::FinancialTest(spec) => spec.requires_manual_review,
            Expectation::UnitTest(_)
            | Expectation::SqlQueryTest(_)
            | Expectation::StatisticalTest(_)
            | Expectation::VisualizationTest(_)
            | Expectation::NotebookCellTest(_) => false,
        }
    }

    /// Input shown to candidates for visible cases.
    pub fn input_preview(&self) -> Option<String> {
        match self {
            Expectation::UnitTest(spec) => Some(spec.input.clone()),
            Expectation::SqlQueryTest(spec) => spec.setup_sql.clone(),
            _ => None,
        }
    }

    /// Expected value shown to candidates for visible cases.
    pub fn expected_preview(&self) -> Value {
        match self {
            Expectation::UnitTest(spec) => Value::String(spec.expected_output.clone()),
            Expectation::SqlQueryTest(spec) => serde_json::json!({
                "columns": spec.expected_columns,
                "rows": spec.expected_rows,
            }),
            Expectation::StatisticalTest(spec) => {
                serde_json::to_value(&spec.assertions).unwrap_or(Value::Null)
            }
            Expectation::VisualizationTest(spec) => {
                serde_json::to_value(spec).unwrap_or(Value::Null)
            }
            Expectation::NotebookCellTest(spec) => serde_json::json!({
                "output_type": spec.expected_output_type,
                "data": spec.expected_data,
            }),
            Expectation::DiagramTest(spec) => {
                serde_json::to_value(&spec.requirements).unwrap_or(Value::Null)
            }
            Expectation::DocumentTest(spec) => serde_json::json!({
                "structure": spec.structure,
                "formatting": spec.formatting,
            }),
            Expectation::FinancialTest(spec) => {
                serde_json::to_value(&spec.rules).unwrap_or(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_tolerance_boundary() {
        let tol = Tolerance::absolute(0.01);
        assert!(tol.within(10.0, 10.009));
        assert!(tol.within(10.0, 9.991));
        assert!(!tol.within(10.0, 10.02));
        assert!(!tol.within(10.0, 9.98));
    }

    #[test]
    fn test_relative_tolerance_scales_with_expected() {
        let tol = Tolerance::relative(0.01);
        assert!(tol.within(1000.0, 1009.0));
        assert!(!tol.within(1000.0, 1011.0));
        assert!(tol.within(0.0, 0.0));
        assert!(!tol.within(0.0, 0.001));
    }

    #[test]
    fn test_exact_tolerance() {
        assert!(Tolerance::exact().within(3.5, 3.5));
        assert!(!Tolerance::exact().within(3.5, 3.5001));
        assert!(!Tolerance::exact().within(f64::NAN, f64::NAN));
    }

    #[test]
    fn test_tolerance_full_form() {
        let tol: Tolerance =
            serde_json::from_value(serde_json::json!({ "value": 0.05, "mode": "relative" }))
                .unwrap();
        assert_eq!(tol.mode, ToleranceMode::Relative);
    }

    #[test]
    fn test_manual_review_flag() {
        let exp: Expectation = serde_json::from_value(serde_json::json!({
            "testcase_type": "diagram_test",
            "requires_manual_review": true
        }))
        .unwrap();
        assert_eq!(exp.testcase_type(), TestcaseType::DiagramTest);
        assert!(exp.requires_manual_review());
    }
}
