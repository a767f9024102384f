use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use assessor_common::error::AssessResult;
use assessor_common::progress::{Session, UserChallenge, UserChallengeStatus, UserProgress};
use assessor_common::redis as keys;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::ProgressStore;

/// Expired sessions linger this long so a stale token reports
/// `session_expired` rather than `session_invalid`.
const EXPIRED_SESSION_RETENTION_SECS: i64 = 7 * 24 * 3600;

/// Deletes the lock only while it still carries the caller's owner value.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed store shared by every API replica.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> AssessResult<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(redis_url = %url, "connected to Redis");
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Editor state stored under its own key so autosaves and graded writes
/// never race over the same document.
#[derive(Debug, Serialize, Deserialize)]
struct SavedContent {
    content: String,
    #[serde(default)]
    language: Option<String>,
    last_edited: DateTime<Utc>,
}

impl SavedContent {
    fn of(progress: &UserProgress) -> Self {
        Self {
            content: progress.content.clone(),
            language: progress.language.clone(),
            last_edited: progress.last_edited,
        }
    }

    fn apply(self, progress: &mut UserProgress) {
        progress.content = self.content;
        if self.language.is_some() {
            progress.language = self.language;
        }
        progress.last_edited = progress.last_edited.max(self.last_edited);
    }
}

fn parse_ids(raw: Vec<String>) -> Vec<Uuid> {
    raw.into_iter()
        .filter_map(|id| match Uuid::parse_str(&id) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = %id, "skipping malformed id in Redis set");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ProgressStore for RedisStore {
    async fn get_user_challenge(&self, id: Uuid) -> AssessResult<Option<UserChallenge>> {
        let mut conn = self.conn();
        Ok(keys::get_json(&mut conn, &keys::user_challenge_key(&id)).await?)
    }

    async fn put_user_challenge(&self, uc: &UserChallenge) -> AssessResult<()> {
        let mut conn = self.conn();
        keys::put_json(&mut conn, &keys::user_challenge_key(&uc.id), uc, None).await?;
        if let Some(anon) = &uc.anonymous_identifier {
            let _: () = conn
                .set(keys::user_challenge_index_key(&uc.challenge_id, anon), uc.id.to_string())
                .await?;
        }
        let _: () = if uc.status == UserChallengeStatus::InProgress {
            conn.sadd(keys::ACTIVE_SET, uc.id.to_string()).await?
        } else {
            conn.srem(keys::ACTIVE_SET, uc.id.to_string()).await?
        };
        Ok(())
    }

    async fn find_user_challenge(
        &self,
        challenge_id: Uuid,
        anonymous_identifier: &str,
    ) -> AssessResult<Option<UserChallenge>> {
        let mut conn = self.conn();
        let id: Option<String> = conn
            .get(keys::user_challenge_index_key(&challenge_id, anonymous_identifier))
            .await?;
        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => self.get_user_challenge(id).await,
            None => Ok(None),
        }
    }

    async fn list_active(&self) -> AssessResult<Vec<UserChallenge>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(keys::ACTIVE_SET).await?;
        let mut active = Vec::new();
        for id in parse_ids(ids) {
            if let Some(uc) = self.get_user_challenge(id).await? {
                if uc.status == UserChallengeStatus::InProgress {
                    active.push(uc);
                }
            }
        }
        Ok(active)
    }

    async fn get_session(&self, token: &str) -> AssessResult<Option<Session>> {
        let mut conn = self.conn();
        Ok(keys::get_json(&mut conn, &keys::session_key(token)).await?)
    }

    async fn put_session(&self, session: &Session) -> AssessResult<()> {
        let mut conn = self.conn();
        let remaining = (session.expires_at - session.last_seen_at).num_seconds().max(0);
        let ttl = (remaining + EXPIRED_SESSION_RETENTION_SECS) as u64;
        keys::put_json(&mut conn, &keys::session_key(&session.token), session, Some(ttl)).await?;
        Ok(())
    }

    async fn get_progress(&self, user_challenge_id: Uuid, step_id: Uuid) -> AssessResult<Option<UserProgress>> {
        let mut conn = self.conn();
        let graded: Option<UserProgress> =
            keys::get_json(&mut conn, &keys::progress_key(&user_challenge_id, &step_id)).await?;
        let saved: Option<SavedContent> =
            keys::get_json(&mut conn, &keys::progress_content_key(&user_challenge_id, &step_id)).await?;
        Ok(match (graded, saved) {
            (Some(mut progress), Some(saved)) => {
                saved.apply(&mut progress);
                Some(progress)
            }
            (Some(progress), None) => Some(progress),
            (None, Some(saved)) => {
                let mut progress = UserProgress::new(user_challenge_id, step_id, saved.last_edited);
                saved.apply(&mut progress);
                Some(progress)
            }
            (None, None) => None,
        })
    }

    async fn put_progress(&self, progress: &UserProgress) -> AssessResult<()> {
        let mut conn = self.conn();
        let key = keys::progress_key(&progress.user_challenge_id, &progress.step_id);
        keys::put_json(&mut conn, &key, progress, None).await?;
        let content_key = keys::progress_content_key(&progress.user_challenge_id, &progress.step_id);
        keys::put_json(&mut conn, &content_key, &SavedContent::of(progress), None).await?;
        let _: () = conn
            .sadd(
                keys::progress_index_key(&progress.user_challenge_id),
                progress.step_id.to_string(),
            )
            .await?;
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
        let mut conn = self.conn();
        let saved = SavedContent {
            content: content.to_string(),
            language: language.map(str::to_string),
            last_edited: now,
        };
        let key = keys::progress_content_key(&user_challenge_id, &step_id);
        keys::put_json(&mut conn, &key, &saved, None).await?;
        let _: () = conn
            .sadd(keys::progress_index_key(&user_challenge_id), step_id.to_string())
            .await?;
        self.get_progress(user_challenge_id, step_id)
            .await?
            .ok_or_else(|| assessor_common::error::AssessError::Storage("saved content vanished".into()))
    }

    async fn list_progress(&self, user_challenge_id: Uuid) -> AssessResult<Vec<UserProgress>> {
        let mut conn = self.conn();
        let step_ids: Vec<String> = conn
            .smembers(keys::progress_index_key(&user_challenge_id))
            .await?;
        let mut all = Vec::new();
        for step_id in parse_ids(step_ids) {
            if let Some(p) = self.get_progress(user_challenge_id, step_id).await? {
                all.push(p);
            }
        }
        Ok(all)
    }

    async fn try_lock_submission(&self, user_challenge_id: Uuid, owner: &str, ttl: Duration) -> AssessResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(keys::submission_lock_key(&user_challenge_id))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock_submission(&self, user_challenge_id: Uuid, owner: &str) -> AssessResult<()> {
        let mut conn = self.conn();
        let released: i64 = ::redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(keys::submission_lock_key(&user_challenge_id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            warn!(user_challenge_id = %user_challenge_id, "submission lock already lapsed or taken over");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
