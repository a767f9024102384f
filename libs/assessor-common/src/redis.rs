use redis::{AsyncCommands, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Redis key semantics for candidate state. Defines only the key layout and
/// JSON helpers so every process reading the store agrees on it.

pub const USER_CHALLENGE_PREFIX: &str = "assessor:uc";
pub const USER_CHALLENGE_INDEX_PREFIX: &str = "assessor:uc_index";
pub const SESSION_PREFIX: &str = "assessor:session";
pub const PROGRESS_PREFIX: &str = "assessor:progress";
pub const PROGRESS_INDEX_PREFIX: &str = "assessor:progress_index";
pub const PROGRESS_CONTENT_PREFIX: &str = "assessor:progress_content";
pub const ACTIVE_SET: &str = "assessor:active";
pub const SUBMISSION_LOCK_PREFIX: &str = "assessor:lock:submission";

pub fn user_challenge_key(id: &Uuid) -> String {
    format!("{}:{}", USER_CHALLENGE_PREFIX, id)
}

/// Lookup from (challenge, anonymous identifier) to the owning user challenge.
pub fn user_challenge_index_key(challenge_id: &Uuid, anonymous_identifier: &str) -> String {
    format!(
        "{}:{}:{}",
        USER_CHALLENGE_INDEX_PREFIX, challenge_id, anonymous_identifier
    )
}

pub fn session_key(token: &str) -> String {
    format!("{}:{}", SESSION_PREFIX, token)
}

pub fn progress_key(user_challenge_id: &Uuid, step_id: &Uuid) -> String {
    format!("{}:{}:{}", PROGRESS_PREFIX, user_challenge_id, step_id)
}

/// Autosaved editor content, kept apart so saves never clobber graded fields.
pub fn progress_content_key(user_challenge_id: &Uuid, step_id: &Uuid) -> String {
    format!("{}:{}:{}", PROGRESS_CONTENT_PREFIX, user_challenge_id, step_id)
}

/// Set of step ids with stored progress for a user challenge.
pub fn progress_index_key(user_challenge_id: &Uuid) -> String {
    format!("{}:{}", PROGRESS_INDEX_PREFIX, user_challenge_id)
}

pub fn submission_lock_key(user_challenge_id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_LOCK_PREFIX, user_challenge_id)
}

fn to_redis_err(context: &'static str, err: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, context, err.to_string()))
}

/// Store a value as JSON, optionally with a TTL in seconds.
pub async fn put_json<T: Serialize>(
    conn: &mut redis::aio::ConnectionManager,
    key: &str,
    value: &T,
    ttl_seconds: Option<u64>,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(value).map_err(|e| to_redis_err("serialization error", e))?;
    match ttl_seconds {
        Some(ttl) => conn.set_ex(key, payload, ttl as _).await,
        None => conn.set(key, payload).await,
    }
}

pub async fn get_json<T: DeserializeOwned>(
    conn: &mut redis::aio::ConnectionManager,
    key: &str,
) -> RedisResult<Option<T>> {
    let payload: Option<String> = conn.get(key).await?;
    match payload {
        Some(data) => {
            let value =
                serde_json::from_str(&data).map_err(|e| to_redis_err("deserialization error", e))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
