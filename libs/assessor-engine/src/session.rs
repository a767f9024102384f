//! Candidate identity without login.
//!
//! A session token is bound to one user challenge (and so to one challenge).
//! Resolution distinguishes a token that never matched anything
//! (`SessionInvalid`) from one that matched but ran out (`SessionExpired`),
//! so callers know whether to restart or just re-enter.

use assessor_common::config::SessionSettings;
use assessor_common::error::{AssessError, AssessResult};
use assessor_common::progress::{Session, UserChallenge, UserChallengeStatus};
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::ProgressStore;

pub const TOKEN_LENGTH: usize = 48;

/// The resolved identity threaded through every candidate call.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session: Session,
    pub user_challenge: UserChallenge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub context: SessionContext,
    /// An existing user challenge was picked up instead of created.
    pub resumed: bool,
    pub previous_status: UserChallengeStatus,
}

pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

fn new_anonymous_identifier() -> String {
    format!("anon-{}", Uuid::new_v4().simple())
}

fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(1))
}

pub struct SessionManager {
    store: Arc<dyn ProgressStore>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ProgressStore>, clock: Arc<dyn Clock>, settings: SessionSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn idle_ttl(&self) -> Duration {
        chrono_duration(self.settings.idle_ttl)
    }

    fn grace(&self) -> Duration {
        chrono_duration(self.settings.completed_grace)
    }

    /// Mint a fresh token for `uc`; the previous token stops resolving.
    async fn issue(&self, uc: &mut UserChallenge, now: DateTime<Utc>) -> AssessResult<Session> {
        let mut session = Session {
            token: generate_token(),
            user_challenge_id: uc.id,
            challenge_id: uc.challenge_id,
            anonymous_identifier: uc.anonymous_identifier.clone(),
            issued_at: now,
            last_seen_at: now,
            expires_at: now + self.idle_ttl(),
            pinned: false,
        };
        if uc.is_completed() {
            session.pinned = true;
            session.expires_at = now + self.grace();
        }
        uc.session_token = session.token.clone();
        self.store.put_session(&session).await?;
        Ok(session)
    }

    /// Start or resume a challenge. Idempotent: a live token for the same
    /// challenge returns the same session; otherwise the anonymous
    /// identifier finds an earlier attempt, whose session is reused while it
    /// is live and replaced once it has expired.
    pub async fn start(
        &self,
        challenge_id: Uuid,
        token: Option<&str>,
        anonymous_identifier: Option<&str>,
        first_step_id: Option<Uuid>,
    ) -> AssessResult<StartOutcome> {
        let now = self.now();
        let mut known_anon = anonymous_identifier
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from);

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            if let Some(mut session) = self.store.get_session(token).await? {
                if session.challenge_id == challenge_id {
                    if known_anon.is_none() {
                        known_anon = session.anonymous_identifier.clone();
                    }
                    let live = self.store.get_user_challenge(session.user_challenge_id).await?;
                    if let Some(uc) = live {
                        let usable = !session.is_expired(now)
                            && uc.session_token == session.token
                            && uc.status != UserChallengeStatus::Abandoned;
                        if usable {
                            self.touch(&mut session, &uc, now).await?;
                            debug!(user_challenge_id = %uc.id, "start resumed live session");
                            return Ok(StartOutcome {
                                previous_status: uc.status,
                                context: SessionContext {
                                    session,
                                    user_challenge: uc,
                                },
                                resumed: true,
                            });
                        }
                    }
                }
            }
        }

        let anon = known_anon.unwrap_or_else(new_anonymous_identifier);
        if let Some(mut uc) = self.store.find_user_challenge(challenge_id, &anon).await? {
            let previous_status = uc.status;
            if matches!(uc.status, UserChallengeStatus::InProgress | UserChallengeStatus::Completed) {
                if let Some(mut session) = self.store.get_session(&uc.session_token).await? {
                    if !session.is_expired(now) {
                        self.touch(&mut session, &uc, now).await?;
                        debug!(user_challenge_id = %uc.id, "start returned live session for identifier");
                        return Ok(StartOutcome {
                            previous_status,
                            context: SessionContext {
                                session,
                                user_challenge: uc,
                            },
                            resumed: true,
                        });
                    }
                }
            }
            match uc.status {
                UserChallengeStatus::Abandoned | UserChallengeStatus::NotStarted => {
                    uc.status = UserChallengeStatus::InProgress;
                    uc.attempt_count += 1;
                }
                UserChallengeStatus::InProgress | UserChallengeStatus::Completed => {}
            }
            if uc.current_step_id.is_none() {
                uc.current_step_id = first_step_id;
            }
            uc.last_activity_at = now;
            let session = self.issue(&mut uc, now).await?;
            self.store.put_user_challenge(&uc).await?;
            info!(
                user_challenge_id = %uc.id,
                challenge_id = %challenge_id,
                previous = previous_status.as_str(),
                status = uc.status.as_str(),
                attempt = uc.attempt_count,
                "challenge resumed"
            );
            return Ok(StartOutcome {
                context: SessionContext {
                    session,
                    user_challenge: uc,
                },
                resumed: true,
                previous_status,
            });
        }

        let mut uc = UserChallenge {
            id: Uuid::new_v4(),
            challenge_id,
            session_token: String::new(),
            anonymous_identifier: Some(anon),
            status: UserChallengeStatus::InProgress,
            attempt_count: 1,
            current_step_id: first_step_id,
            started_at: now,
            completed_at: None,
            last_activity_at: now,
        };
        let session = self.issue(&mut uc, now).await?;
        self.store.put_user_challenge(&uc).await?;
        info!(user_challenge_id = %uc.id, challenge_id = %challenge_id, "challenge started");
        Ok(StartOutcome {
            context: SessionContext {
                session,
                user_challenge: uc,
            },
            resumed: false,
            previous_status: UserChallengeStatus::NotStarted,
        })
    }

    /// Slide the idle expiry, or pin it once the challenge has completed.
    async fn touch(&self, session: &mut Session, uc: &UserChallenge, now: DateTime<Utc>) -> AssessResult<()> {
        session.last_seen_at = now;
        if let (true, Some(completed_at)) = (uc.is_completed(), uc.completed_at) {
            if !session.pinned {
                session.pinned = true;
                session.expires_at = completed_at + self.grace();
            }
        } else if !session.pinned {
            session.expires_at = now + self.idle_ttl();
        }
        self.store.put_session(session).await
    }

    async fn lookup(&self, token: Option<&str>, challenge_id: Uuid) -> AssessResult<SessionContext> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AssessError::SessionInvalid("missing session token".into()))?;
        let session = self
            .store
            .get_session(token)
            .await?
            .ok_or_else(|| AssessError::SessionInvalid("unknown session token".into()))?;
        if session.challenge_id != challenge_id {
            return Err(AssessError::SessionInvalid(
                "session token belongs to a different challenge".into(),
            ));
        }
        let uc = self
            .store
            .get_user_challenge(session.user_challenge_id)
            .await?
            .ok_or_else(|| AssessError::SessionInvalid("session has no challenge attempt".into()))?;
        if uc.session_token != session.token {
            return Err(AssessError::SessionInvalid(
                "session was superseded by a newer start".into(),
            ));
        }
        if session.is_expired(self.now()) || uc.status == UserChallengeStatus::Abandoned {
            return Err(AssessError::SessionExpired);
        }
        Ok(SessionContext {
            session,
            user_challenge: uc,
        })
    }

    /// Validate a token for `challenge_id` and extend its idle window.
    pub async fn resolve(&self, token: Option<&str>, challenge_id: Uuid) -> AssessResult<SessionContext> {
        let mut ctx = self.lookup(token, challenge_id).await?;
        self.touch(&mut ctx.session, &ctx.user_challenge, self.now()).await?;
        Ok(ctx)
    }

    /// Like `resolve` but read-only and forgiving: any failure reads as "no
    /// session". Used by session-aware views.
    pub async fn peek(&self, token: Option<&str>, challenge_id: Uuid) -> Option<SessionContext> {
        self.lookup(token, challenge_id).await.ok()
    }

    /// Fix the token's lifetime to the completion grace window.
    pub async fn pin(&self, session: &mut Session, completed_at: DateTime<Utc>) -> AssessResult<()> {
        session.pinned = true;
        session.expires_at = completed_at + self.grace();
        self.store.put_session(session).await
    }

    /// Mark in-progress attempts whose session lapsed as abandoned. The only
    /// producer of `abandoned`.
    pub async fn sweep_idle(&self) -> AssessResult<usize> {
        let now = self.now();
        let mut swept = 0;
        for listed in self.store.list_active().await? {
            // a submit or start may have landed since the listing
            let Some(mut uc) = self.store.get_user_challenge(listed.id).await? else {
                continue;
            };
            if uc.status != UserChallengeStatus::InProgress {
                continue;
            }
            let expired = match self.store.get_session(&uc.session_token).await? {
                Some(session) => session.is_expired(now),
                None => true,
            };
            if !expired {
                continue;
            }
            uc.status = UserChallengeStatus::Abandoned;
            self.store.put_user_challenge(&uc).await?;
            info!(user_challenge_id = %uc.id, challenge_id = %uc.challenge_id, "attempt abandoned after idle timeout");
            swept += 1;
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn manager() -> (SessionManager, Arc<ManualClock>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let settings = SessionSettings {
            idle_ttl: std::time::Duration::from_secs(600),
            completed_grace: std::time::Duration::from_secs(60),
        };
        (
            SessionManager::new(store.clone(), clock.clone(), settings),
            clock,
            store,
        )
    }

    #[test]
    fn test_token_shape() {
        let t = generate_token();
        assert_eq!(t.len(), TOKEN_LENGTH);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(t, generate_token());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_with_token() {
        let (mgr, _, _) = manager();
        let challenge = Uuid::new_v4();
        let first = mgr.start(challenge, None, None, None).await.unwrap();
        assert!(!first.resumed);
        assert_eq!(first.previous_status, UserChallengeStatus::NotStarted);
        assert_eq!(first.context.user_challenge.status, UserChallengeStatus::InProgress);

        let again = mgr
            .start(challenge, Some(&first.context.session.token), None, None)
            .await
            .unwrap();
        assert!(again.resumed);
        assert_eq!(again.context.session.token, first.context.session.token);
        assert_eq!(again.context.user_challenge.id, first.context.user_challenge.id);
    }

    #[tokio::test]
    async fn test_start_by_identifier_reuses_live_session() {
        let (mgr, clock, _) = manager();
        let challenge = Uuid::new_v4();
        let first = mgr.start(challenge, None, Some("anon-x"), None).await.unwrap();
        let token = first.context.session.token.clone();

        clock.advance(Duration::seconds(300));
        let again = mgr.start(challenge, None, Some("anon-x"), None).await.unwrap();
        assert!(again.resumed);
        assert_eq!(again.previous_status, UserChallengeStatus::InProgress);
        assert_eq!(again.context.session.token, token);
        assert_eq!(again.context.user_challenge.attempt_count, 1);
        assert!(mgr.resolve(Some(&token), challenge).await.is_ok());

        clock.advance(Duration::seconds(601));
        let later = mgr.start(challenge, None, Some("anon-x"), None).await.unwrap();
        assert_ne!(later.context.session.token, token);
        assert_eq!(later.context.user_challenge.id, first.context.user_challenge.id);
        assert_eq!(later.context.user_challenge.status, UserChallengeStatus::InProgress);
        assert!(matches!(
            mgr.resolve(Some(&token), challenge).await,
            Err(AssessError::SessionInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_start_by_identifier_keeps_completed_session_in_grace() {
        let (mgr, clock, store) = manager();
        let challenge = Uuid::new_v4();
        let first = mgr.start(challenge, None, Some("anon-done"), None).await.unwrap();
        let mut uc = first.context.user_challenge.clone();
        uc.status = UserChallengeStatus::Completed;
        uc.completed_at = Some(clock.now());
        store.put_user_challenge(&uc).await.unwrap();

        let again = mgr.start(challenge, None, Some("anon-done"), None).await.unwrap();
        assert_eq!(again.context.session.token, first.context.session.token);
        assert!(again.context.session.pinned);

        clock.advance(Duration::seconds(61));
        let later = mgr.start(challenge, None, Some("anon-done"), None).await.unwrap();
        assert_ne!(later.context.session.token, first.context.session.token);
        assert_eq!(later.context.user_challenge.status, UserChallengeStatus::Completed);
        assert_eq!(later.context.user_challenge.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_resolve_errors_are_distinct() {
        let (mgr, clock, _) = manager();
        let challenge = Uuid::new_v4();
        let started = mgr.start(challenge, None, Some("anon-a"), None).await.unwrap();
        let token = started.context.session.token.clone();

        assert!(matches!(
            mgr.resolve(None, challenge).await,
            Err(AssessError::SessionInvalid(_))
        ));
        assert!(matches!(
            mgr.resolve(Some("nope"), challenge).await,
            Err(AssessError::SessionInvalid(_))
        ));
        assert!(matches!(
            mgr.resolve(Some(&token), Uuid::new_v4()).await,
            Err(AssessError::SessionInvalid(_))
        ));
        assert!(mgr.resolve(Some(&token), challenge).await.is_ok());

        clock.advance(Duration::seconds(601));
        assert!(matches!(
            mgr.resolve(Some(&token), challenge).await,
            Err(AssessError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_resolution_slides_expiry() {
        let (mgr, clock, _) = manager();
        let challenge = Uuid::new_v4();
        let started = mgr.start(challenge, None, None, None).await.unwrap();
        let token = started.context.session.token;
        for _ in 0..3 {
            clock.advance(Duration::seconds(500));
            mgr.resolve(Some(&token), challenge).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_then_resume_increments_attempts() {
        let (mgr, clock, store) = manager();
        let challenge = Uuid::new_v4();
        let started = mgr.start(challenge, None, Some("anon-b"), None).await.unwrap();
        let old_token = started.context.session.token.clone();

        clock.advance(Duration::seconds(601));
        assert_eq!(mgr.sweep_idle().await.unwrap(), 1);
        let uc = store
            .get_user_challenge(started.context.user_challenge.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uc.status, UserChallengeStatus::Abandoned);
        assert_eq!(mgr.sweep_idle().await.unwrap(), 0);

        let resumed = mgr
            .start(challenge, Some(&old_token), None, None)
            .await
            .unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.previous_status, UserChallengeStatus::Abandoned);
        assert_eq!(resumed.context.user_challenge.status, UserChallengeStatus::InProgress);
        assert_eq!(resumed.context.user_challenge.attempt_count, 2);
        assert_ne!(resumed.context.session.token, old_token);
        assert!(matches!(
            mgr.resolve(Some(&old_token), challenge).await,
            Err(AssessError::SessionInvalid(_))
        ));
    }

    /// Completes every listed attempt right after handing out the listing.
    struct CompletesAfterListing(MemoryStore);

    #[async_trait::async_trait]
    impl ProgressStore for CompletesAfterListing {
        async fn get_user_challenge(&self, id: Uuid) -> AssessResult<Option<UserChallenge>> {
            self.0.get_user_challenge(id).await
        }
        async fn put_user_challenge(&self, uc: &UserChallenge) -> AssessResult<()> {
            self.0.put_user_challenge(uc).await
        }
        async fn find_user_challenge(&self, challenge_id: Uuid, anon: &str) -> AssessResult<Option<UserChallenge>> {
            self.0.find_user_challenge(challenge_id, anon).await
        }
        async fn list_active(&self) -> AssessResult<Vec<UserChallenge>> {
            let listed = self.0.list_active().await?;
            for uc in &listed {
                let mut done = uc.clone();
                done.status = UserChallengeStatus::Completed;
                done.completed_at = Some(Utc::now());
                self.0.put_user_challenge(&done).await?;
            }
            Ok(listed)
        }
        async fn get_session(&self, token: &str) -> AssessResult<Option<Session>> {
            self.0.get_session(token).await
        }
        async fn put_session(&self, session: &Session) -> AssessResult<()> {
            self.0.put_session(session).await
        }
        async fn get_progress(
            &self,
            uc: Uuid,
            step: Uuid,
        ) -> AssessResult<Option<assessor_common::progress::UserProgress>> {
            self.0.get_progress(uc, step).await
        }
        async fn put_progress(&self, progress: &assessor_common::progress::UserProgress) -> AssessResult<()> {
            self.0.put_progress(progress).await
        }
        async fn save_content(
            &self,
            uc: Uuid,
            step: Uuid,
            content: &str,
            language: Option<&str>,
            now: DateTime<Utc>,
        ) -> AssessResult<assessor_common::progress::UserProgress> {
            self.0.save_content(uc, step, content, language, now).await
        }
        async fn list_progress(&self, uc: Uuid) -> AssessResult<Vec<assessor_common::progress::UserProgress>> {
            self.0.list_progress(uc).await
        }
        async fn try_lock_submission(&self, uc: Uuid, owner: &str, ttl: std::time::Duration) -> AssessResult<bool> {
            self.0.try_lock_submission(uc, owner, ttl).await
        }
        async fn unlock_submission(&self, uc: Uuid, owner: &str) -> AssessResult<()> {
            self.0.unlock_submission(uc, owner).await
        }
        fn name(&self) -> &'static str {
            "completes-after-listing"
        }
    }

    #[tokio::test]
    async fn test_sweep_skips_attempt_completed_after_listing() {
        let store = Arc::new(CompletesAfterListing(MemoryStore::new()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let settings = SessionSettings {
            idle_ttl: std::time::Duration::from_secs(600),
            completed_grace: std::time::Duration::from_secs(60),
        };
        let mgr = SessionManager::new(store.clone(), clock.clone(), settings);
        let started = mgr.start(Uuid::new_v4(), None, None, None).await.unwrap();

        clock.advance(Duration::seconds(601));
        assert_eq!(mgr.sweep_idle().await.unwrap(), 0);
        let uc = store
            .get_user_challenge(started.context.user_challenge.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uc.status, UserChallengeStatus::Completed);
    }

    #[tokio::test]
    async fn test_pinned_session_stops_sliding() {
        let (mgr, clock, _) = manager();
        let challenge = Uuid::new_v4();
        let started = mgr.start(challenge, None, None, None).await.unwrap();
        let mut session = started.context.session;
        mgr.pin(&mut session, clock.now()).await.unwrap();

        clock.advance(Duration::seconds(30));
        mgr.resolve(Some(&session.token), challenge).await.unwrap();
        clock.advance(Duration::seconds(31));
        assert!(matches!(
            mgr.resolve(Some(&session.token), challenge).await,
            Err(AssessError::SessionExpired)
        ));
    }
}
