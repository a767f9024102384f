//! Diagram, document and spreadsheet checks.
//!
//! Each family runs its automated gates first. A failed gate fails the case
//! outright; when every gate holds and the case asks for manual review, the
//! outcome is left pending for a reviewer instead of passing.

use assessor_common::artifact::{Artifact, Diagram, DiagramNode};
use assessor_common::payload::{DiagramSpec, DocumentSpec, FinancialSpec, RubricItem};
use assessor_common::results::{FailureKind, Outcome};
use assessor_common::types::TestCase;
use serde_json::{json, Map, Value};

use super::{tolerance_of, wrong_artifact};

fn gated(
    testcase: &TestCase,
    problems: Vec<(FailureKind, String)>,
    manual_review: bool,
    rubric: &[RubricItem],
    actual: Option<Value>,
) -> Outcome {
    if let Some((kind, _)) = problems.first() {
        let message = problems
            .iter()
            .map(|(_, msg)| msg.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Outcome::fail(testcase, *kind, message, actual);
    }
    if manual_review {
        let message = if rubric.is_empty() {
            "automated checks passed; awaiting reviewer".to_string()
        } else {
            let criteria: Vec<&str> = rubric.iter().map(|item| item.criterion.as_str()).collect();
            format!("automated checks passed; reviewer will assess: {}", criteria.join(", "))
        };
        return Outcome::pending_review(testcase, message, actual);
    }
    Outcome::pass(testcase, actual)
}

fn node_matches(node: &DiagramNode, reference: &str) -> bool {
    node.id == reference || node.label.eq_ignore_ascii_case(reference)
}

fn diagram_problems(spec: &DiagramSpec, diagram: &Diagram) -> Vec<String> {
    let req = &spec.requirements;
    let mut problems = Vec::new();

    if let Some(min) = req.min_nodes {
        if diagram.nodes.len() < min {
            problems.push(format!("expected at least {min} nodes, found {}", diagram.nodes.len()));
        }
    }
    if let Some(min) = req.min_edges {
        if diagram.edges.len() < min {
            problems.push(format!("expected at least {min} connections, found {}", diagram.edges.len()));
        }
    }
    for kind in &req.required_node_kinds {
        if !diagram.nodes.iter().any(|n| n.kind.eq_ignore_ascii_case(kind)) {
            problems.push(format!("no {kind} node"));
        }
    }
    for label in &req.required_labels {
        let wanted = label.to_lowercase();
        if !diagram.nodes.iter().any(|n| n.label.to_lowercase().contains(&wanted)) {
            problems.push(format!("no node labelled {label}"));
        }
    }
    for connection in &req.required_connections {
        let connected = diagram.edges.iter().any(|edge| {
            let from = diagram.nodes.iter().find(|n| n.id == edge.from);
            let to = diagram.nodes.iter().find(|n| n.id == edge.to);
            matches!((from, to), (Some(f), Some(t))
                if node_matches(f, &connection.from) && node_matches(t, &connection.to))
        });
        if !connected {
            problems.push(format!("missing connection {} -> {}", connection.from, connection.to));
        }
    }
    problems
}

pub(super) fn evaluate_diagram(testcase: &TestCase, spec: &DiagramSpec, artifact: &Artifact) -> Outcome {
    let Artifact::Diagram(diagram) = artifact else {
        return wrong_artifact(testcase, "diagram", artifact);
    };
    let actual = Some(json!({
        "nodes": diagram.nodes.len(),
        "edges": diagram.edges.len(),
    }));
    let problems = diagram_problems(spec, diagram)
        .into_iter()
        .map(|p| (FailureKind::RequirementUnmet, p))
        .collect();
    gated(testcase, problems, spec.requires_manual_review, &spec.rubric, actual)
}

/// Markdown-ish view of a document: headings with depth, and paragraphs.
struct Outline<'a> {
    headings: Vec<(usize, &'a str)>,
    paragraphs: Vec<String>,
    first_line: Option<&'a str>,
}

fn outline(text: &str) -> Outline<'_> {
    let mut headings = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        let depth = line.chars().take_while(|c| *c == '#').count();
        if depth > 0 && line[depth..].starts_with(' ') {
            headings.push((depth, line[depth..].trim()));
        }
        if line.is_empty() || depth > 0 {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }
    Outline {
        headings,
        paragraphs,
        first_line: text.lines().map(str::trim).find(|l| !l.is_empty()),
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().filter(|w| w.chars().any(char::is_alphanumeric)).count()
}

fn document_problems(spec: &DocumentSpec, text: &str) -> Vec<String> {
    let doc = outline(text);
    let lowered = text.to_lowercase();
    let words = word_count(text);
    let structure = &spec.structure;
    let formatting = &spec.formatting;
    let mut problems = Vec::new();

    for heading in &structure.required_headings {
        let wanted = heading.to_lowercase();
        if !doc.headings.iter().any(|(_, h)| h.to_lowercase().contains(&wanted)) {
            problems.push(format!("missing section \"{heading}\""));
        }
    }
    for phrase in &structure.required_phrases {
        if !lowered.contains(&phrase.to_lowercase()) {
            problems.push(format!("missing required phrase \"{phrase}\""));
        }
    }
    for phrase in &structure.forbidden_phrases {
        if lowered.contains(&phrase.to_lowercase()) {
            problems.push(format!("contains forbidden phrase \"{phrase}\""));
        }
    }
    if let Some(min) = structure.min_words {
        if words < min {
            problems.push(format!("expected at least {min} words, found {words}"));
        }
    }
    if let Some(max) = structure.max_words {
        if words > max {
            problems.push(format!("expected at most {max} words, found {words}"));
        }
    }

    if formatting.require_title && !doc.first_line.map_or(false, |l| l.starts_with("# ")) {
        problems.push("document should open with a title".to_string());
    }
    if let Some(max) = formatting.max_heading_depth {
        if let Some((depth, heading)) = doc.headings.iter().find(|(d, _)| *d > max) {
            problems.push(format!("heading \"{heading}\" is nested {depth} levels deep (max {max})"));
        }
    }
    if let Some(max) = formatting.max_paragraph_words {
        let longest = doc.paragraphs.iter().map(|p| word_count(p)).max().unwrap_or(0);
        if longest > max {
            problems.push(format!("a paragraph has {longest} words (max {max})"));
        }
    }
    problems
}

pub(super) fn evaluate_document(testcase: &TestCase, spec: &DocumentSpec, artifact: &Artifact) -> Outcome {
    let Artifact::Document(text) = artifact else {
        return wrong_artifact(testcase, "document", artifact);
    };
    let actual = Some(json!({ "words": word_count(text) }));
    let problems = document_problems(spec, text)
        .into_iter()
        .map(|p| (FailureKind::RequirementUnmet, p))
        .collect();
    gated(testcase, problems, spec.requires_manual_review, &spec.rubric, actual)
}

pub(super) fn evaluate_financial(testcase: &TestCase, spec: &FinancialSpec, artifact: &Artifact) -> Outcome {
    let Artifact::Spreadsheet(sheet) = artifact else {
        return wrong_artifact(testcase, "spreadsheet", artifact);
    };
    let fallback = tolerance_of(testcase);
    let mut observed = Map::new();
    let mut problems = Vec::new();

    for rule in &spec.rules {
        let Some(cell) = sheet.cell(&rule.cell) else {
            observed.insert(rule.cell.clone(), Value::Null);
            problems.push((FailureKind::RequirementUnmet, format!("cell {} is empty", rule.cell)));
            continue;
        };
        observed.insert(rule.cell.clone(), cell.value.clone().unwrap_or(Value::Null));
        match cell.numeric_value() {
            None => problems.push((
                FailureKind::ValueMismatch,
                format!("cell {} is not numeric", rule.cell),
            )),
            Some(value) if !rule.tolerance.unwrap_or(fallback).within(rule.expected, value) => {
                problems.push((
                    FailureKind::ValueMismatch,
                    format!("cell {}: expected {}, got {value}", rule.cell, rule.expected),
                ))
            }
            Some(_) => {}
        }
        if rule.require_formula && !cell.has_formula() {
            problems.push((
                FailureKind::RequirementUnmet,
                format!("cell {} must be computed with a formula", rule.cell),
            ));
        }
    }

    gated(testcase, problems, spec.requires_manual_review, &[], Some(Value::Object(observed)))
}
