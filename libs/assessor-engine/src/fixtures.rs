//! Builders shared by the engine's unit tests.

use assessor_common::payload::{
    Expectation, NotebookCellSpec, OutputComparison, SqlQuerySpec, StatAssertion, StatisticalSpec,
    Tolerance, UnitTestSpec, VisualizationSpec,
};
use assessor_common::types::{
    Challenge, ChallengeStep, Difficulty, ExecutionEnvironment, Exercise, ExerciseCategory,
    PublicationStatus, StepTemplate, TestCase,
};
use serde_json::Value;
use uuid::Uuid;

pub fn exercise() -> Exercise {
    Exercise {
        id: Uuid::new_v4(),
        title: "Quarterly reporting".into(),
        description: String::new(),
        category: ExerciseCategory::DataAnalyst,
        language: None,
        difficulty: Difficulty::Intermediate,
        required_skills: vec!["sql".into()],
        estimated_duration_minutes: 45,
        business_domain: Some("retail".into()),
        status: PublicationStatus::Published,
    }
}

pub fn challenge(env: ExecutionEnvironment) -> Challenge {
    Challenge {
        id: Uuid::new_v4(),
        exercise_id: Uuid::new_v4(),
        title: format!("{env} challenge"),
        description: String::new(),
        status: PublicationStatus::Published,
        execution_environment: env,
        environment_config: Value::Null,
        order_index: 0,
    }
}

pub fn step(challenge_id: Uuid, order: u32, is_final: bool) -> ChallengeStep {
    ChallengeStep {
        id: Uuid::new_v4(),
        challenge_id,
        title: format!("Step {}", order + 1),
        instructions: "Solve it.".into(),
        order_index: order,
        is_final_step: is_final,
        starter_code: None,
        solution_code: None,
        evaluation_criteria: None,
        template: None,
    }
}

pub fn sql_step(challenge_id: Uuid, schema: &str) -> ChallengeStep {
    ChallengeStep {
        template: Some(StepTemplate::Sql {
            schema_sql: schema.into(),
            sample_queries: vec![],
        }),
        ..step(challenge_id, 0, true)
    }
}

pub fn case(order: u32, expectation: Expectation) -> TestCase {
    TestCase {
        id: Uuid::new_v4(),
        step_id: Uuid::nil(),
        name: String::new(),
        is_hidden: false,
        is_example: false,
        timeout_seconds: 2,
        memory_limit_mb: 128,
        numerical_tolerance: None,
        order_index: order,
        expectation,
    }
}

pub fn unit_case(order: u32, input: &str, expected: &str, hidden: bool) -> TestCase {
    TestCase {
        is_hidden: hidden,
        ..case(
            order,
            Expectation::UnitTest(UnitTestSpec {
                input: input.into(),
                expected_output: expected.into(),
                comparison: OutputComparison::Normalized,
            }),
        )
    }
}

pub fn sql_case(order: u32, expected_rows: Vec<Vec<Value>>) -> TestCase {
    case(
        order,
        Expectation::SqlQueryTest(SqlQuerySpec {
            setup_sql: None,
            expected_columns: vec![],
            expected_rows,
            order_matters: false,
        }),
    )
}

pub fn stats_case(order: u32, assertions: Vec<StatAssertion>, tolerance: Tolerance) -> TestCase {
    TestCase {
        numerical_tolerance: Some(tolerance),
        ..case(order, Expectation::StatisticalTest(StatisticalSpec { assertions }))
    }
}

pub fn chart_case(order: u32, spec: VisualizationSpec) -> TestCase {
    case(order, Expectation::VisualizationTest(spec))
}

pub fn notebook_case(order: u32, spec: NotebookCellSpec) -> TestCase {
    case(order, Expectation::NotebookCellTest(spec))
}

/// Attach cases to a step, fixing up their parent id.
pub fn attach(step: &ChallengeStep, cases: Vec<TestCase>) -> Vec<TestCase> {
    cases
        .into_iter()
        .map(|tc| TestCase {
            step_id: step.id,
            ..tc
        })
        .collect()
}
