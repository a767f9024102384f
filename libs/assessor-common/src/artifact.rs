//! Canonical shapes of what candidates submit, one per environment family.
//!
//! Wire formats are loosely modelled on nbformat (notebooks) and Vega-Lite
//! (charts). Aliases for alternative key spellings live here and nowhere
//! else, so the rest of the engine sees a single shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Stream,
    ExecuteResult,
    DisplayData,
    Error,
}

/// nbformat stores text either as one string or as a list of lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MultilineText {
    Single(String),
    Lines(Vec<String>),
}

impl Default for MultilineText {
    fn default() -> Self {
        MultilineText::Single(String::new())
    }
}

impl MultilineText {
    pub fn joined(&self) -> String {
        match self {
            MultilineText::Single(s) => s.clone(),
            MultilineText::Lines(lines) => lines.concat(),
        }
    }
}

impl From<String> for MultilineText {
    fn from(value: String) -> Self {
        MultilineText::Single(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    pub output_type: OutputType,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub text: Option<MultilineText>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

impl CellOutput {
    pub fn stream(name: &str, text: String) -> Self {
        Self {
            output_type: OutputType::Stream,
            name: Some(name.to_string()),
            text: Some(MultilineText::Single(text)),
            data: Map::new(),
            metadata: Map::new(),
            ename: None,
            evalue: None,
        }
    }

    pub fn error(ename: &str, evalue: String) -> Self {
        Self {
            output_type: OutputType::Error,
            name: None,
            text: None,
            data: Map::new(),
            metadata: Map::new(),
            ename: Some(ename.to_string()),
            evalue: Some(evalue),
        }
    }

    /// Payload for a MIME type. Stream text answers `text/plain`.
    pub fn payload(&self, mime: &str) -> Option<Value> {
        if let Some(v) = self.data.get(mime) {
            return Some(match v {
                Value::Array(lines) if lines.iter().all(|l| l.is_string()) => Value::String(
                    lines.iter().filter_map(|l| l.as_str()).collect::<String>(),
                ),
                other => other.clone(),
            });
        }
        if mime == "text/plain" && self.output_type == OutputType::Stream {
            return self.text.as_ref().map(|t| Value::String(t.joined()));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookCell {
    pub cell_type: CellType,
    #[serde(default)]
    pub source: MultilineText,
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub execution_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<NotebookCell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mark {
    Name(String),
    Detailed {
        #[serde(rename = "type")]
        kind: String,
    },
}

impl Mark {
    pub fn name(&self) -> &str {
        match self {
            Mark::Name(name) => name,
            Mark::Detailed { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    #[serde(default)]
    pub values: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    #[serde(alias = "chart_type")]
    pub mark: Mark,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub encoding: BTreeMap<String, Encoding>,
    #[serde(default)]
    pub data: ChartData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramNode {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, alias = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramEdge {
    #[serde(alias = "source")]
    pub from: String,
    #[serde(alias = "target")]
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    #[serde(default)]
    pub nodes: Vec<DiagramNode>,
    #[serde(default)]
    pub edges: Vec<DiagramEdge>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpreadsheetCell {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub formula: Option<String>,
}

impl SpreadsheetCell {
    /// Numeric reading of the cell. Accepts numbers and numeric strings
    /// with currency symbols, thousands separators or a trailing percent.
    pub fn numeric_value(&self) -> Option<f64> {
        match self.value.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => {
                let cleaned: String = s
                    .trim()
                    .chars()
                    .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' '))
                    .collect();
                if let Some(pct) = cleaned.strip_suffix('%') {
                    pct.parse::<f64>().ok().map(|v| v / 100.0)
                } else {
                    cleaned.parse::<f64>().ok()
                }
            }
            _ => None,
        }
    }

    pub fn has_formula(&self) -> bool {
        self.formula
            .as_deref()
            .map(|f| !f.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spreadsheet {
    #[serde(default)]
    pub cells: BTreeMap<String, SpreadsheetCell>,
}

impl Spreadsheet {
    /// Case-insensitive cell lookup (`b7` finds `B7`).
    pub fn cell(&self, reference: &str) -> Option<&SpreadsheetCell> {
        let wanted = reference.trim().to_ascii_uppercase();
        self.cells
            .iter()
            .find(|(k, _)| k.trim().to_ascii_uppercase() == wanted)
            .map(|(_, v)| v)
    }
}

/// A submission after boundary mapping; exactly one shape per environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Source { language: String, code: String },
    Query(String),
    Notebook(Notebook),
    Chart(ChartSpec),
    Diagram(Diagram),
    Document(String),
    Spreadsheet(Spreadsheet),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Source { .. } => "source",
            Artifact::Query(_) => "query",
            Artifact::Notebook(_) => "notebook",
            Artifact::Chart(_) => "chart",
            Artifact::Diagram(_) => "diagram",
            Artifact::Document(_) => "document",
            Artifact::Spreadsheet(_) => "spreadsheet",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiline_text_joins_lines() {
        let t: MultilineText = serde_json::from_value(serde_json::json!(["a\n", "b"])).unwrap();
        assert_eq!(t.joined(), "a\nb");
    }

    #[test]
    fn test_chart_accepts_detailed_mark() {
        let chart: ChartSpec = serde_json::from_value(serde_json::json!({
            "mark": { "type": "line" },
            "encoding": { "x": { "field": "month", "type": "temporal" } },
            "data": { "values": [{ "month": "2024-01", "sales": 3 }] }
        }))
        .unwrap();
        assert_eq!(chart.mark.name(), "line");
        assert_eq!(chart.encoding["x"].field.as_deref(), Some("month"));
    }

    #[test]
    fn test_diagram_edge_aliases() {
        let d: Diagram = serde_json::from_value(serde_json::json!({
            "nodes": [{ "id": "1", "label": "Start", "type": "start" }],
            "edges": [{ "source": "1", "target": "2" }]
        }))
        .unwrap();
        assert_eq!(d.nodes[0].kind, "start");
        assert_eq!(d.edges[0].from, "1");
    }

    #[test]
    fn test_spreadsheet_numeric_values() {
        let cell = SpreadsheetCell {
            value: Some(Value::String("$1,250.50".into())),
            formula: None,
        };
        assert_eq!(cell.numeric_value(), Some(1250.5));

        let pct = SpreadsheetCell {
            value: Some(Value::String("12.5%".into())),
            formula: Some("=B2/B3".into()),
        };
        assert_eq!(pct.numeric_value(), Some(0.125));
        assert!(pct.has_formula());
    }

    #[test]
    fn test_spreadsheet_lookup_case_insensitive() {
        let mut sheet = Spreadsheet::default();
        sheet.cells.insert(
            "B7".into(),
            SpreadsheetCell {
                value: Some(serde_json::json!(42)),
                formula: None,
            },
        );
        assert!(sheet.cell("b7").is_some());
        assert!(sheet.cell("C1").is_none());
    }

    #[test]
    fn test_stream_output_answers_text_plain() {
        let out = CellOutput::stream("stdout", "42\n".into());
        assert_eq!(out.payload("text/plain"), Some(Value::String("42\n".into())));
        assert_eq!(out.payload("application/json"), None);
    }
}
