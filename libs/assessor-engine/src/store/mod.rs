//! Persistence of candidate state: user challenges, sessions, per-step
//! progress and the per-attempt submission lock.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use assessor_common::error::AssessResult;
use assessor_common::progress::{Session, UserChallenge, UserProgress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_user_challenge(&self, id: Uuid) -> AssessResult<Option<UserChallenge>>;

    /// Insert or overwrite; keeps the (challenge, anonymous id) index and the
    /// in-progress set current.
    async fn put_user_challenge(&self, uc: &UserChallenge) -> AssessResult<()>;

    async fn find_user_challenge(
        &self,
        challenge_id: Uuid,
        anonymous_identifier: &str,
    ) -> AssessResult<Option<UserChallenge>>;

    /// User challenges currently `in_progress`.
    async fn list_active(&self) -> AssessResult<Vec<UserChallenge>>;

    async fn get_session(&self, token: &str) -> AssessResult<Option<Session>>;

    async fn put_session(&self, session: &Session) -> AssessResult<()>;

    async fn get_progress(&self, user_challenge_id: Uuid, step_id: Uuid) -> AssessResult<Option<UserProgress>>;

    async fn put_progress(&self, progress: &UserProgress) -> AssessResult<()>;

    /// Autosave: update only the editor content of a step, creating the
    /// progress record if needed. Graded fields written by a concurrent
    /// submission are never overwritten.
    async fn save_content(
        &self,
        user_challenge_id: Uuid,
        step_id: Uuid,
        content: &str,
        language: Option<&str>,
        now: DateTime<Utc>,
    ) -> AssessResult<UserProgress>;

    async fn list_progress(&self, user_challenge_id: Uuid) -> AssessResult<Vec<UserProgress>>;

    /// Take the single graded-submission slot for an attempt on behalf of
    /// `owner`. Returns false when another submission holds it. The lock
    /// lapses after `ttl` so a crashed holder cannot wedge the attempt.
    async fn try_lock_submission(&self, user_challenge_id: Uuid, owner: &str, ttl: Duration) -> AssessResult<bool>;

    /// Release the slot only if `owner` still holds it.
    async fn unlock_submission(&self, user_challenge_id: Uuid, owner: &str) -> AssessResult<()>;

    fn name(&self) -> &'static str;
}
