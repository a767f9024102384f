//! Boundary mapping from a raw submission to exactly one [`Artifact`].
//!
//! This is the only place that knows which request field feeds which
//! environment; everything downstream sees the canonical artifact.

use assessor_common::artifact::{Artifact, ChartSpec, Diagram, Notebook, Spreadsheet};
use assessor_common::error::{AssessError, AssessResult};
use assessor_common::types::ExecutionEnvironment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::languages::LanguageRegistry;

/// Submission body shared by save, test and submit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(default, alias = "source_code", alias = "sourceCode")]
    pub code: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl Submission {
    pub fn code(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            content: None,
            language: Some(language.into()),
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            code: None,
            content: Some(content.into()),
            language: None,
        }
    }

    /// Text persisted by autosave: `content` wins over `code`.
    pub fn raw_text(&self) -> String {
        self.content
            .clone()
            .or_else(|| self.code.clone())
            .unwrap_or_default()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn parse_json<T: DeserializeOwned>(raw: Option<&str>, what: &str) -> AssessResult<T> {
    let raw = raw.ok_or_else(|| AssessError::validation(format!("{what} content is required")))?;
    serde_json::from_str(raw)
        .map_err(|e| AssessError::validation(format!("content is not a valid {what}: {e}")))
}

pub fn map_artifact(
    environment: ExecutionEnvironment,
    submission: &Submission,
    languages: &LanguageRegistry,
) -> AssessResult<Artifact> {
    match environment {
        ExecutionEnvironment::CodeExecutor => {
            let code = non_blank(&submission.code)
                .ok_or_else(|| AssessError::validation("code is required"))?;
            let requested = non_blank(&submission.language)
                .ok_or_else(|| AssessError::validation("language is required"))?;
            let language = languages.resolve(requested).ok_or_else(|| {
                AssessError::validation(format!("unsupported language: {requested}"))
            })?;
            Ok(Artifact::Source {
                language: language.name.clone(),
                code: code.to_string(),
            })
        }
        ExecutionEnvironment::SqlDatabase => non_blank(&submission.code)
            .or_else(|| non_blank(&submission.content))
            .map(|sql| Artifact::Query(sql.to_string()))
            .ok_or_else(|| AssessError::validation("a SQL query is required")),
        ExecutionEnvironment::JupyterNotebook => {
            let notebook: Notebook = parse_json(non_blank(&submission.content), "notebook")?;
            if notebook.cells.is_empty() {
                return Err(AssessError::validation("notebook has no cells"));
            }
            Ok(Artifact::Notebook(notebook))
        }
        ExecutionEnvironment::DataVisualization => {
            let chart: ChartSpec = parse_json(non_blank(&submission.content), "chart")?;
            Ok(Artifact::Chart(chart))
        }
        ExecutionEnvironment::DiagramEditor => {
            let diagram: Diagram = parse_json(non_blank(&submission.content), "diagram")?;
            if diagram.nodes.is_empty() {
                return Err(AssessError::validation("diagram has no nodes"));
            }
            Ok(Artifact::Diagram(diagram))
        }
        ExecutionEnvironment::TextEditor => non_blank(&submission.content)
            .or_else(|| non_blank(&submission.code))
            .map(|text| Artifact::Document(text.to_string()))
            .ok_or_else(|| AssessError::validation("document content is required")),
        ExecutionEnvironment::SpreadsheetCalculator => {
            let sheet: Spreadsheet = parse_json(non_blank(&submission.content), "spreadsheet")?;
            if sheet.cells.is_empty() {
                return Err(AssessError::validation("spreadsheet has no cells"));
            }
            Ok(Artifact::Spreadsheet(sheet))
        }
    }
}
