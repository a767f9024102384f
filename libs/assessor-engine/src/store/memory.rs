use assessor_common::error::AssessResult;
use assessor_common::progress::{Session, UserChallenge, UserChallengeStatus, UserProgress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::ProgressStore;

#[derive(Default)]
struct Inner {
    user_challenges: HashMap<Uuid, UserChallenge>,
    index: HashMap<(Uuid, String), Uuid>,
    sessions: HashMap<String, Session>,
    progress: HashMap<(Uuid, Uuid), UserProgress>,
    locks: HashMap<Uuid, (String, Instant)>,
}

/// Process-local store used when no Redis URL is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get_user_challenge(&self, id: Uuid) -> AssessResult<Option<UserChallenge>> {
        Ok(self.inner.read().await.user_challenges.get(&id).cloned())
    }

    async fn put_user_challenge(&self, uc: &UserChallenge) -> AssessResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(anon) = &uc.anonymous_identifier {
            inner.index.insert((uc.challenge_id, anon.clone()), uc.id);
        }
        inner.user_challenges.insert(uc.id, uc.clone());
        Ok(())
    }

    async fn find_user_challenge(
        &self,
        challenge_id: Uuid,
        anonymous_identifier: &str,
    ) -> AssessResult<Option<UserChallenge>> {
        let inner = self.inner.read().await;
        Ok(inner
            .index
            .get(&(challenge_id, anonymous_identifier.to_string()))
            .and_then(|id| inner.user_challenges.get(id))
            .cloned())
    }

    async fn list_active(&self) -> AssessResult<Vec<UserChallenge>> {
        Ok(self
            .inner
            .read()
            .await
            .user_challenges
            .values()
            .filter(|uc| uc.status == UserChallengeStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn get_session(&self, token: &str) -> AssessResult<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(token).cloned())
    }

    async fn put_session(&self, session: &Session) -> AssessResult<()> {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn get_progress(&self, user_challenge_id: Uuid, step_id: Uuid) -> AssessResult<Option<UserProgress>> {
        Ok(self
            .inner
            .read()
            .await
            .progress
            .get(&(user_challenge_id, step_id))
            .cloned())
    }

    async fn put_progress(&self, progress: &UserProgress) -> AssessResult<()> {
        self.inner
            .write()
            .await
            .progress
            .insert((progress.user_challenge_id, progress.step_id), progress.clone());
        Ok(())
    }

    async fn save_content(
        &self,
        user_challenge_id: Uuid,
        step_id: Uuid,
        content: &str,
        language: Option<&str>,
        now: DateTime<Utc>,
    ) -> AssessResult<UserProgress> {
        let mut inner = self.inner.write().await;
        let progress = inner
            .progress
            .entry((user_challenge_id, step_id))
            .or_insert_with(|| UserProgress::new(user_challenge_id, step_id, now));
        progress.content = content.to_string();
        if let Some(language) = language {
            progress.language = Some(language.to_string());
        }
        progress.last_edited = now;
        Ok(progress.clone())
    }

    async fn list_progress(&self, user_challenge_id: Uuid) -> AssessResult<Vec<UserProgress>> {
        Ok(self
            .inner
            .read()
            .await
            .progress
            .values()
            .filter(|p| p.user_challenge_id == user_challenge_id)
            .cloned()
            .collect())
    }

    async fn try_lock_submission(&self, user_challenge_id: Uuid, owner: &str, ttl: Duration) -> AssessResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        match inner.locks.get(&user_challenge_id) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                inner.locks.insert(user_challenge_id, (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock_submission(&self, user_challenge_id: Uuid, owner: &str) -> AssessResult<()> {
        let mut inner = self.inner.write().await;
        if matches!(inner.locks.get(&user_challenge_id), Some((held_by, _)) if held_by == owner) {
            inner.locks.remove(&user_challenge_id);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
