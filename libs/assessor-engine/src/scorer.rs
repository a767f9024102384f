//! Folds per-case outcomes into step-level numbers.

use assessor_common::results::Outcome;
use assessor_common::types::{ChallengeStep, EvaluationCriteria};
use uuid::Uuid;

pub const DEFAULT_MAX_SCORE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepScore {
    pub tests_passed: u32,
    pub tests_total: u32,
    pub score: f64,
    pub pending_review: u32,
    /// Every case passed and none awaits review.
    pub completed: bool,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn score_step(outcomes: &[Outcome], criteria: Option<&EvaluationCriteria>) -> StepScore {
    let max_score = criteria
        .and_then(|c| c.max_score)
        .unwrap_or(DEFAULT_MAX_SCORE);
    let tests_total = outcomes.len() as u32;
    let tests_passed = outcomes.iter().filter(|o| o.passed).count() as u32;
    let pending_review = outcomes.iter().filter(|o| o.is_pending()).count() as u32;

    if outcomes.is_empty() {
        return StepScore {
            tests_passed: 0,
            tests_total: 0,
            score: round1(max_score),
            pending_review: 0,
            completed: true,
        };
    }

    let weight = |id: &Uuid| criteria.map(|c| c.weight_of(id)).unwrap_or(1.0);
    let total_weight: f64 = outcomes.iter().map(|o| weight(&o.testcase_id)).sum();
    let passed_weight: f64 = outcomes
        .iter()
        .filter(|o| o.passed)
        .map(|o| weight(&o.testcase_id))
        .sum();
    let score = if total_weight > 0.0 {
        round1(passed_weight / total_weight * max_score)
    } else {
        0.0
    };

    StepScore {
        tests_passed,
        tests_total,
        score,
        pending_review,
        completed: pending_review == 0 && tests_passed == tests_total,
    }
}

/// The flagged final step, else the one with the highest `order_index`.
pub fn final_step_id(steps: &[ChallengeStep]) -> Option<Uuid> {
    steps
        .iter()
        .find(|s| s.is_final_step)
        .or_else(|| steps.iter().max_by_key(|s| s.order_index))
        .map(|s| s.id)
}

/// Step following `current` by `order_index`.
pub fn next_step<'a>(steps: &'a [ChallengeStep], current: &ChallengeStep) -> Option<&'a ChallengeStep> {
    steps
        .iter()
        .filter(|s| s.order_index > current.order_index)
        .min_by_key(|s| s.order_index)
}
