//! Admin-authored content: exercises, challenges, steps and test cases.
//!
//! Readers take an `Arc` of the current snapshot and never block writers.
//! Writers clone the snapshot, apply the change, validate the result and
//! swap it in, so an evaluation in flight keeps seeing the tree it started
//! with.

use assessor_common::error::{AssessError, AssessResult};
use assessor_common::payload::Expectation;
use assessor_common::types::{
    Challenge, ChallengeStep, Difficulty, Exercise, ExerciseCategory, TestCase, TestcaseType,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

/// One structural problem found while validating the tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub entity: &'static str,
    pub id: Uuid,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.entity, self.id, self.message)
    }
}

fn issues_to_error(issues: &[Issue]) -> AssessError {
    AssessError::validation(
        issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExerciseFilter {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub category: Option<ExerciseCategory>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total: u32,
    pub page: u32,
    pub per_page: u32,
    pub pages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T: Clone> Page<T> {
    fn of(items: Vec<&T>, page: Option<u32>, per_page: Option<u32>) -> Self {
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        let page = page.unwrap_or(1).max(1);
        let total = items.len() as u32;
        let pages = total.div_ceil(per_page);
        let data = items
            .into_iter()
            .skip(((page - 1) * per_page) as usize)
            .take(per_page as usize)
            .cloned()
            .collect();
        Page {
            data,
            pagination: Pagination {
                total,
                page,
                per_page,
                pages,
            },
        }
    }
}

/// Everything needed to evaluate one step, cloned out of a snapshot.
#[derive(Debug, Clone)]
pub struct StepBundle {
    pub challenge: Challenge,
    pub step: ChallengeStep,
    /// Sorted by `order_index`.
    pub testcases: Vec<TestCase>,
    /// Sibling steps of the challenge, sorted by `order_index`.
    pub steps: Vec<ChallengeStep>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub exercises: BTreeMap<Uuid, Exercise>,
    pub challenges: BTreeMap<Uuid, Challenge>,
    pub steps: BTreeMap<Uuid, ChallengeStep>,
    pub testcases: BTreeMap<Uuid, TestCase>,
}

impl CatalogSnapshot {
    pub fn exercise(&self, id: Uuid) -> AssessResult<&Exercise> {
        self.exercises
            .get(&id)
            .ok_or_else(|| AssessError::not_found("exercise", id))
    }

    pub fn challenge(&self, id: Uuid) -> AssessResult<&Challenge> {
        self.challenges
            .get(&id)
            .ok_or_else(|| AssessError::not_found("challenge", id))
    }

    pub fn step(&self, id: Uuid) -> AssessResult<&ChallengeStep> {
        self.steps
            .get(&id)
            .ok_or_else(|| AssessError::not_found("step", id))
    }

    pub fn testcase(&self, id: Uuid) -> AssessResult<&TestCase> {
        self.testcases
            .get(&id)
            .ok_or_else(|| AssessError::not_found("testcase", id))
    }

    pub fn challenges_of(&self, exercise_id: Uuid) -> Vec<&Challenge> {
        let mut found: Vec<_> = self
            .challenges
            .values()
            .filter(|c| c.exercise_id == exercise_id)
            .collect();
        found.sort_by_key(|c| c.order_index);
        found
    }

    pub fn steps_of(&self, challenge_id: Uuid) -> Vec<&ChallengeStep> {
        let mut found: Vec<_> = self
            .steps
            .values()
            .filter(|s| s.challenge_id == challenge_id)
            .collect();
        found.sort_by_key(|s| s.order_index);
        found
    }

    pub fn testcases_of(&self, step_id: Uuid) -> Vec<&TestCase> {
        let mut found: Vec<_> = self
            .testcases
            .values()
            .filter(|t| t.step_id == step_id)
            .collect();
        found.sort_by_key(|t| t.order_index);
        found
    }

    pub fn step_bundle(&self, step_id: Uuid) -> AssessResult<StepBundle> {
        let step = self.step(step_id)?;
        let challenge = self.challenge(step.challenge_id)?;
        Ok(StepBundle {
            challenge: challenge.clone(),
            step: step.clone(),
            testcases: self.testcases_of(step_id).into_iter().cloned().collect(),
            steps: self.steps_of(challenge.id).into_iter().cloned().collect(),
        })
    }

    /// Published exercises matching the filter, by title.
    pub fn list_exercises(&self, filter: &ExerciseFilter, public_only: bool) -> Page<Exercise> {
        let mut items: Vec<&Exercise> = self
            .exercises
            .values()
            .filter(|e| !public_only || e.status.is_public())
            .filter(|e| filter.category.map_or(true, |c| e.category == c))
            .filter(|e| filter.difficulty.map_or(true, |d| e.difficulty == d))
            .collect();
        items.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        Page::of(items, filter.page, filter.per_page)
    }

    /// Structural problems of a single test case in its would-be position.
    /// Sibling ordering is checked separately.
    pub fn check_testcase(&self, tc: &TestCase) -> Vec<String> {
        let mut problems = Vec::new();
        match self
            .steps
            .get(&tc.step_id)
            .and_then(|s| self.challenges.get(&s.challenge_id))
        {
            None => problems.push(format!("step {} does not exist", tc.step_id)),
            Some(challenge) => {
                let env = challenge.execution_environment;
                if !env.supports(tc.testcase_type()) {
                    problems.push(format!(
                        "testcase_type {} is not allowed under {env}",
                        tc.testcase_type()
                    ));
                }
            }
        }
        if tc.timeout_seconds == 0 {
            problems.push("timeout_seconds must be greater than 0".into());
        }
        if tc.memory_limit_mb == 0 {
            problems.push("memory_limit_mb must be greater than 0".into());
        }
        if let Some(tol) = tc.numerical_tolerance {
            if !(tol.value >= 0.0 && tol.value.is_finite()) {
                problems.push("numerical_tolerance must be a non-negative number".into());
            }
        }
        if tc.testcase_type() == TestcaseType::StatisticalTest && tc.numerical_tolerance.is_none() {
            problems.push("statistical_test requires numerical_tolerance".into());
        }
        match &tc.expectation {
            Expectation::StatisticalTest(spec) if spec.assertions.is_empty() => {
                problems.push("statistical_test needs at least one assertion".into())
            }
            Expectation::FinancialTest(spec) if spec.rules.is_empty() => {
                problems.push("financial_test needs at least one rule".into())
            }
            Expectation::SqlQueryTest(spec) if !spec.expected_columns.is_empty() => {
                let width = spec.expected_columns.len();
                if let Some(row) = spec.expected_rows.iter().position(|r| r.len() != width) {
                    problems.push(format!(
                        "expected_rows[{row}] does not have {width} columns"
                    ));
                }
            }
            _ => {}
        }
        problems
    }

    /// Every structural invariant of the tree.
    pub fn validate(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        let mut push = |entity: &'static str, id: Uuid, message: String| {
            issues.push(Issue {
                entity,
                id,
                message,
            })
        };

        for exercise in self.exercises.values() {
            if exercise.title.trim().is_empty() {
                push("exercise", exercise.id, "title is required".into());
            }
            if exercise.estimated_duration_minutes == 0 {
                push("exercise", exercise.id, "estimated_duration_minutes must be greater than 0".into());
            }
            let mut seen = HashSet::new();
            for challenge in self.challenges_of(exercise.id) {
                if !seen.insert(challenge.order_index) {
                    push(
                        "challenge",
                        challenge.id,
                        format!("order_index {} is already used in exercise {}", challenge.order_index, exercise.id),
                    );
                }
            }
        }

        for challenge in self.challenges.values() {
            if !self.exercises.contains_key(&challenge.exercise_id) {
                push("challenge", challenge.id, format!("exercise {} does not exist", challenge.exercise_id));
            }
            if challenge.title.trim().is_empty() {
                push("challenge", challenge.id, "title is required".into());
            }
            let steps = self.steps_of(challenge.id);
            let finals = steps.iter().filter(|s| s.is_final_step).count();
            if finals > 1 {
                push("challenge", challenge.id, format!("{finals} steps are marked final, at most one allowed"));
            }
            let mut seen = HashSet::new();
            for step in steps {
                if !seen.insert(step.order_index) {
                    push(
                        "step",
                        step.id,
                        format!("order_index {} is already used in challenge {}", step.order_index, challenge.id),
                    );
                }
            }
        }

        for step in self.steps.values() {
            let Some(challenge) = self.challenges.get(&step.challenge_id) else {
                push("step", step.id, format!("challenge {} does not exist", step.challenge_id));
                continue;
            };
            if let Some(template) = &step.template {
                if template.environment() != challenge.execution_environment {
                    push(
                        "step",
                        step.id,
                        format!(
                            "template is for {} but the challenge runs in {}",
                            template.environment(),
                            challenge.execution_environment
                        ),
                    );
                }
            }
            let cases = self.testcases_of(step.id);
            if let Some(criteria) = &step.evaluation_criteria {
                if criteria.max_score.is_some_and(|m| !(m > 0.0)) {
                    push("step", step.id, "evaluation_criteria.max_score must be greater than 0".into());
                }
                for (id, weight) in &criteria.weights {
                    if !cases.iter().any(|tc| tc.id == *id) {
                        push("step", step.id, format!("evaluation_criteria weights unknown testcase {id}"));
                    }
                    if !(*weight >= 0.0) {
                        push("step", step.id, format!("weight for testcase {id} must be non-negative"));
                    }
                }
            }
            let mut seen = HashSet::new();
            for tc in cases {
                if !seen.insert(tc.order_index) {
                    push(
                        "testcase",
                        tc.id,
                        format!("order_index {} is already used in step {}", tc.order_index, step.id),
                    );
                }
            }
        }

        for tc in self.testcases.values() {
            for problem in self.check_testcase(tc) {
                push("testcase", tc.id, problem);
            }
        }
        issues
    }

    fn remove_step_cascade(&mut self, step_id: Uuid) {
        self.steps.remove(&step_id);
        self.testcases.retain(|_, tc| tc.step_id != step_id);
    }

    fn remove_challenge_cascade(&mut self, challenge_id: Uuid) {
        self.challenges.remove(&challenge_id);
        let steps: Vec<Uuid> = self
            .steps
            .values()
            .filter(|s| s.challenge_id == challenge_id)
            .map(|s| s.id)
            .collect();
        for step_id in steps {
            self.remove_step_cascade(step_id);
        }
    }

    /// Nested document form, the seed/export format.
    pub fn to_document(&self) -> CatalogDocument {
        let exercises = self
            .exercises
            .values()
            .map(|exercise| ExerciseNode {
                exercise: exercise.clone(),
                challenges: self
                    .challenges_of(exercise.id)
                    .into_iter()
                    .map(|challenge| ChallengeNode {
                        challenge: challenge.clone(),
                        steps: self
                            .steps_of(challenge.id)
                            .into_iter()
                            .map(|step| StepNode {
                                step: step.clone(),
                                test_cases: self.testcases_of(step.id).into_iter().cloned().collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        CatalogDocument { exercises }
    }

    /// Flatten a document. Parent ids come from nesting; duplicate ids are
    /// reported rather than silently merged.
    pub fn from_document(document: CatalogDocument) -> (CatalogSnapshot, Vec<Issue>) {
        let mut snapshot = CatalogSnapshot::default();
        let mut issues = Vec::new();
        let duplicate = |entity: &'static str, id: Uuid| Issue {
            entity,
            id,
            message: "id appears more than once in the document".into(),
        };

        for node in document.exercises {
            let exercise_id = node.exercise.id;
            if snapshot.exercises.insert(exercise_id, node.exercise).is_some() {
                issues.push(duplicate("exercise", exercise_id));
            }
            for cnode in node.challenges {
                let mut challenge = cnode.challenge;
                challenge.exercise_id = exercise_id;
                let challenge_id = challenge.id;
                if snapshot.challenges.insert(challenge_id, challenge).is_some() {
                    issues.push(duplicate("challenge", challenge_id));
                }
                for snode in cnode.steps {
                    let mut step = snode.step;
                    step.challenge_id = challenge_id;
                    let step_id = step.id;
                    if snapshot.steps.insert(step_id, step).is_some() {
                        issues.push(duplicate("step", step_id));
                    }
                    for mut tc in snode.test_cases {
                        tc.step_id = step_id;
                        let tc_id = tc.id;
                        if snapshot.testcases.insert(tc_id, tc).is_some() {
                            issues.push(duplicate("testcase", tc_id));
                        }
                    }
                }
            }
        }
        issues.extend(snapshot.validate());
        (snapshot, issues)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    #[serde(flatten)]
    pub step: ChallengeStep,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeNode {
    #[serde(flatten)]
    pub challenge: Challenge,
    #[serde(default)]
    pub steps: Vec<StepNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseNode {
    #[serde(flatten)]
    pub exercise: Exercise,
    #[serde(default)]
    pub challenges: Vec<ChallengeNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub exercises: Vec<ExerciseNode>,
}

/// The live catalog: an atomically replaced snapshot plus a writer lock.
#[derive(Debug, Default)]
pub struct Catalog {
    current: RwLock<Arc<CatalogSnapshot>>,
    writer: Mutex<()>,
}

impl Catalog {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    /// Load a document, refusing it when anything is invalid.
    pub fn from_document(document: CatalogDocument) -> AssessResult<Self> {
        let (snapshot, issues) = CatalogSnapshot::from_document(document);
        if !issues.is_empty() {
            return Err(issues_to_error(&issues));
        }
        info!(
            exercises = snapshot.exercises.len(),
            challenges = snapshot.challenges.len(),
            steps = snapshot.steps.len(),
            testcases = snapshot.testcases.len(),
            "catalog loaded"
        );
        Ok(Self::new(snapshot))
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Copy, change, validate, swap. Nothing is published when `apply` or
    /// validation fails.
    pub fn mutate<T>(&self, apply: impl FnOnce(&mut CatalogSnapshot) -> AssessResult<T>) -> AssessResult<T> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.snapshot()).clone();
        let value = apply(&mut next)?;
        let issues = next.validate();
        if !issues.is_empty() {
            return Err(issues_to_error(&issues));
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        Ok(value)
    }

    pub fn create_exercise(&self, exercise: Exercise) -> AssessResult<Exercise> {
        self.mutate(|cat| {
            if cat.exercises.contains_key(&exercise.id) {
                return Err(AssessError::Conflict(format!("exercise {} already exists", exercise.id)));
            }
            cat.exercises.insert(exercise.id, exercise.clone());
            Ok(exercise)
        })
    }

    pub fn update_exercise(&self, id: Uuid, mut exercise: Exercise) -> AssessResult<Exercise> {
        self.mutate(|cat| {
            cat.exercise(id)?;
            exercise.id = id;
            cat.exercises.insert(id, exercise.clone());
            Ok(exercise)
        })
    }

    pub fn delete_exercise(&self, id: Uuid) -> AssessResult<()> {
        self.mutate(|cat| {
            cat.exercise(id)?;
            cat.exercises.remove(&id);
            let challenges: Vec<Uuid> = cat.challenges_of(id).iter().map(|c| c.id).collect();
            for challenge_id in challenges {
                cat.remove_challenge_cascade(challenge_id);
            }
            Ok(())
        })
    }

    pub fn create_challenge(&self, exercise_id: Uuid, mut challenge: Challenge) -> AssessResult<Challenge> {
        self.mutate(|cat| {
            cat.exercise(exercise_id)?;
            if cat.challenges.contains_key(&challenge.id) {
                return Err(AssessError::Conflict(format!("challenge {} already exists", challenge.id)));
            }
            challenge.exercise_id = exercise_id;
            cat.challenges.insert(challenge.id, challenge.clone());
            Ok(challenge)
        })
    }

    pub fn update_challenge(&self, id: Uuid, mut challenge: Challenge) -> AssessResult<Challenge> {
        self.mutate(|cat| {
            let existing = cat.challenge(id)?;
            challenge.id = id;
            challenge.exercise_id = existing.exercise_id;
            cat.challenges.insert(id, challenge.clone());
            Ok(challenge)
        })
    }

    pub fn delete_challenge(&self, id: Uuid) -> AssessResult<()> {
        self.mutate(|cat| {
            cat.challenge(id)?;
            cat.remove_challenge_cascade(id);
            Ok(())
        })
    }

    pub fn create_step(&self, challenge_id: Uuid, mut step: ChallengeStep) -> AssessResult<ChallengeStep> {
        self.mutate(|cat| {
            cat.challenge(challenge_id)?;
            if cat.steps.contains_key(&step.id) {
                return Err(AssessError::Conflict(format!("step {} already exists", step.id)));
            }
            step.challenge_id = challenge_id;
            cat.steps.insert(step.id, step.clone());
            Ok(step)
        })
    }

    pub fn update_step(&self, id: Uuid, mut step: ChallengeStep) -> AssessResult<ChallengeStep> {
        self.mutate(|cat| {
            let existing = cat.step(id)?;
            step.id = id;
            step.challenge_id = existing.challenge_id;
            cat.steps.insert(id, step.clone());
            Ok(step)
        })
    }

    pub fn delete_step(&self, id: Uuid) -> AssessResult<()> {
        self.mutate(|cat| {
            cat.step(id)?;
            cat.remove_step_cascade(id);
            Ok(())
        })
    }

    pub fn create_testcase(&self, step_id: Uuid, mut testcase: TestCase) -> AssessResult<TestCase> {
        self.mutate(|cat| {
            cat.step(step_id)?;
            if cat.testcases.contains_key(&testcase.id) {
                return Err(AssessError::Conflict(format!("testcase {} already exists", testcase.id)));
            }
            testcase.step_id = step_id;
            cat.testcases.insert(testcase.id, testcase.clone());
            Ok(testcase)
        })
    }

    pub fn update_testcase(&self, id: Uuid, mut testcase: TestCase) -> AssessResult<TestCase> {
        self.mutate(|cat| {
            let existing = cat.testcase(id)?;
            testcase.id = id;
            testcase.step_id = existing.step_id;
            cat.testcases.insert(id, testcase.clone());
            Ok(testcase)
        })
    }

    /// Also drops the case's scoring weight from its step.
    pub fn delete_testcase(&self, id: Uuid) -> AssessResult<()> {
        self.mutate(|cat| {
            let step_id = cat.testcase(id)?.step_id;
            cat.testcases.remove(&id);
            if let Some(criteria) = cat
                .steps
                .get_mut(&step_id)
                .and_then(|s| s.evaluation_criteria.as_mut())
            {
                criteria.weights.remove(&id);
            }
            Ok(())
        })
    }

    /// Insert already row-validated cases in one swap.
    pub fn insert_testcases(&self, step_id: Uuid, testcases: Vec<TestCase>) -> AssessResult<Vec<TestCase>> {
        self.mutate(|cat| {
            cat.step(step_id)?;
            let mut inserted = Vec::with_capacity(testcases.len());
            for mut tc in testcases {
                if cat.testcases.contains_key(&tc.id) {
                    return Err(AssessError::Conflict(format!("testcase {} already exists", tc.id)));
                }
                tc.step_id = step_id;
                cat.testcases.insert(tc.id, tc.clone());
                inserted.push(tc);
            }
            Ok(inserted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use assessor_common::payload::{StatAssertion, Statistic, Tolerance};
    use assessor_common::types::{ExecutionEnvironment, PublicationStatus, StepTemplate};

    fn seeded(env: ExecutionEnvironment) -> (Catalog, Challenge, ChallengeStep) {
        let catalog = Catalog::default();
        let exercise = catalog.create_exercise(fixtures::exercise()).unwrap();
        let challenge = catalog
            .create_challenge(exercise.id, fixtures::challenge(env))
            .unwrap();
        let step = catalog
            .create_step(challenge.id, fixtures::step(challenge.id, 0, true))
            .unwrap();
        (catalog, challenge, step)
    }

    #[test]
    fn test_incompatible_testcase_rejected() {
        let (catalog, _, step) = seeded(ExecutionEnvironment::CodeExecutor);
        let err = catalog
            .create_testcase(step.id, fixtures::sql_case(0, vec![]))
            .unwrap_err();
        assert!(matches!(err, AssessError::Validation(_)));
        assert!(err.to_string().contains("sql_query_test"));
        assert!(catalog.snapshot().testcases.is_empty());
    }

    #[test]
    fn test_duplicate_order_index_rejected() {
        let (catalog, _, step) = seeded(ExecutionEnvironment::CodeExecutor);
        catalog
            .create_testcase(step.id, fixtures::unit_case(0, "", "1", false))
            .unwrap();
        let err = catalog
            .create_testcase(step.id, fixtures::unit_case(0, "", "2", false))
            .unwrap_err();
        assert!(err.to_string().contains("order_index 0"));
    }

    #[test]
    fn test_single_final_step() {
        let (catalog, challenge, _) = seeded(ExecutionEnvironment::CodeExecutor);
        let err = catalog
            .create_step(challenge.id, fixtures::step(challenge.id, 1, true))
            .unwrap_err();
        assert!(err.to_string().contains("final"));
    }

    #[test]
    fn test_template_must_match_environment() {
        let (catalog, challenge, _) = seeded(ExecutionEnvironment::CodeExecutor);
        let mut step = fixtures::step(challenge.id, 1, false);
        step.template = Some(StepTemplate::Document {
            outline: String::new(),
        });
        assert!(catalog.create_step(challenge.id, step).is_err());
    }

    #[test]
    fn test_statistical_requires_tolerance() {
        let (catalog, _, step) = seeded(ExecutionEnvironment::DataVisualization);
        let mut tc = fixtures::stats_case(
            0,
            vec![StatAssertion {
                label: None,
                statistic: Statistic::Mean,
                field: "x".into(),
                expected: 1.0,
            }],
            Tolerance::absolute(0.01),
        );
        tc.numerical_tolerance = None;
        let err = catalog.create_testcase(step.id, tc.clone()).unwrap_err();
        assert!(err.to_string().contains("numerical_tolerance"));
        tc.numerical_tolerance = Some(Tolerance::absolute(0.01));
        assert!(catalog.create_testcase(step.id, tc).is_ok());
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let (catalog, _, step) = seeded(ExecutionEnvironment::CodeExecutor);
        let before = catalog.snapshot();
        catalog
            .create_testcase(step.id, fixtures::unit_case(0, "", "1", false))
            .unwrap();
        assert!(before.testcases.is_empty());
        assert_eq!(catalog.snapshot().testcases.len(), 1);
    }

    #[test]
    fn test_cascade_delete_and_weights() {
        let (catalog, challenge, mut step) = seeded(ExecutionEnvironment::CodeExecutor);
        let tc = catalog
            .create_testcase(step.id, fixtures::unit_case(0, "", "1", false))
            .unwrap();
        let mut criteria = assessor_common::types::EvaluationCriteria::default();
        criteria.weights.insert(tc.id, 2.0);
        step.evaluation_criteria = Some(criteria);
        catalog.update_step(step.id, step.clone()).unwrap();

        catalog.delete_testcase(tc.id).unwrap();
        let snap = catalog.snapshot();
        assert!(snap.steps[&step.id]
            .evaluation_criteria
            .as_ref()
            .unwrap()
            .weights
            .is_empty());

        catalog.delete_challenge(challenge.id).unwrap();
        assert!(catalog.snapshot().steps.is_empty());
    }

    #[test]
    fn test_unknown_weight_rejected() {
        let (catalog, _, mut step) = seeded(ExecutionEnvironment::CodeExecutor);
        let mut criteria = assessor_common::types::EvaluationCriteria::default();
        criteria.weights.insert(Uuid::new_v4(), 1.0);
        step.evaluation_criteria = Some(criteria);
        assert!(catalog.update_step(step.id, step).is_err());
    }

    #[test]
    fn test_public_listing_paginates() {
        let catalog = Catalog::default();
        for i in 0..5 {
            let mut e = fixtures::exercise();
            e.title = format!("Exercise {i}");
            if i == 4 {
                e.status = PublicationStatus::Draft;
            }
            catalog.create_exercise(e).unwrap();
        }
        let filter = ExerciseFilter {
            page: Some(2),
            per_page: Some(3),
            ..Default::default()
        };
        let page = catalog.snapshot().list_exercises(&filter, true);
        assert_eq!(page.pagination.total, 4);
        assert_eq!(page.pagination.pages, 2);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].title, "Exercise 3");

        let capped = ExerciseFilter {
            per_page: Some(1000),
            ..Default::default()
        };
        assert_eq!(catalog.snapshot().list_exercises(&capped, false).pagination.per_page, MAX_PER_PAGE);
    }

    #[test]
    fn test_document_round_trip_fills_parent_ids() {
        let raw = serde_json::json!({
            "exercises": [{
                "title": "Factorials",
                "category": "developer",
                "difficulty": "beginner",
                "estimated_duration_minutes": 15,
                "status": "published",
                "challenges": [{
                    "title": "Compute n!",
                    "status": "published",
                    "execution_environment": "code_executor",
                    "order_index": 0,
                    "steps": [{
                        "title": "Read n, print n!",
                        "order_index": 0,
                        "is_final_step": true,
                        "test_cases": [
                            { "order_index": 0, "testcase_type": "unit_test", "input": "5", "expected_output": "120" }
                        ]
                    }]
                }]
            }]
        });
        let doc: CatalogDocument = serde_json::from_value(raw).unwrap();
        let catalog = Catalog::from_document(doc).unwrap();
        let snap = catalog.snapshot();
        let step = snap.steps.values().next().unwrap();
        let tc = snap.testcases.values().next().unwrap();
        assert_eq!(tc.step_id, step.id);
        assert!(snap.challenges.contains_key(&step.challenge_id));

        let exported = serde_json::to_value(snap.to_document()).unwrap();
        let again: CatalogDocument = serde_json::from_value(exported).unwrap();
        let (copy, issues) = CatalogSnapshot::from_document(again);
        assert!(issues.is_empty());
        assert_eq!(copy, *snap);
    }
}
