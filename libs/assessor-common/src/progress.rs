use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::results::{Outcome, Summary, SubmissionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserChallengeStatus {
    NotStarted,
    InProgress,
    Completed,
    Abandoned,
}

impl UserChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserChallengeStatus::NotStarted => "not_started",
            UserChallengeStatus::InProgress => "in_progress",
            UserChallengeStatus::Completed => "completed",
            UserChallengeStatus::Abandoned => "abandoned",
        }
    }
}

/// One candidate's attempt at one challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserChallenge {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub session_token: String,
    #[serde(default)]
    pub anonymous_identifier: Option<String>,
    pub status: UserChallengeStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub current_step_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

impl UserChallenge {
    pub fn is_completed(&self) -> bool {
        self.status == UserChallengeStatus::Completed
    }
}

/// A bearer session bound to exactly one user challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_challenge_id: Uuid,
    pub challenge_id: Uuid,
    #[serde(default)]
    pub anonymous_identifier: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once the challenge completes; expiry no longer slides.
    #[serde(default)]
    pub pinned: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The last test or submit run on a step, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExecution {
    pub mode: SubmissionMode,
    pub evaluated_at: DateTime<Utc>,
    pub outcomes: Vec<Outcome>,
    pub summary: Summary,
}

/// Per-step state inside a user challenge. Unique per (user challenge, step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
    pub id: Uuid,
    pub user_challenge_id: Uuid,
    pub step_id: Uuid,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub language: Option<String>,
    pub tests_passed: u32,
    pub tests_total: u32,
    /// Sticky: never goes back to false once set.
    pub is_completed: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub last_execution_result: Option<StoredExecution>,
    pub last_edited: DateTime<Utc>,
}

impl UserProgress {
    pub fn new(user_challenge_id: Uuid, step_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_challenge_id,
            step_id,
            content: String::new(),
            language: None,
            tests_passed: 0,
            tests_total: 0,
            is_completed: false,
            score: None,
            last_execution_result: None,
            last_edited: now,
        }
    }
}
