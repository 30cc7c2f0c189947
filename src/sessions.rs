use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::RedisStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "ENDED")]
    Ended,
}

/// A pairing of two users. `user_a`/`user_b` is an unordered pair; use
/// [`MatchSession::partner_of`] instead of comparing the fields directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSession {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl MatchSession {
    pub fn new(user_a: String, user_b: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_a,
            user_b,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The other participant, given one known participant.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// Authoritative store of session records. Every component re-checks this
/// store before acting on session state; nothing caches it durably.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &MatchSession) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<Option<MatchSession>>;
    async fn find_active_by_user(&self, user_id: &str) -> Result<Option<MatchSession>>;
    async fn list_active(&self) -> Result<Vec<MatchSession>>;
    /// Transition ACTIVE -> ENDED. Returns the ended record, or `None` when
    /// the session was not active — the transition happens at most once even
    /// under concurrent callers.
    async fn end_session(&self, session_id: &str) -> Result<Option<MatchSession>>;
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn create(&self, session: &MatchSession) -> Result<()> {
        let mut conn = self.connection();
        let serialized = serde_json::to_string(session)?;
        redis::pipe()
            .cmd("SET")
            .arg(session_key(&session.id))
            .arg(&serialized)
            .ignore()
            .cmd("SADD")
            .arg(ACTIVE_SESSIONS_KEY)
            .arg(&session.id)
            .ignore()
            .cmd("SET")
            .arg(user_session_key(&session.user_a))
            .arg(&session.id)
            .ignore()
            .cmd("SET")
            .arg(user_session_key(&session.user_b))
            .arg(&session.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<MatchSession>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(session_key(session_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn find_active_by_user(&self, user_id: &str) -> Result<Option<MatchSession>> {
        let mut conn = self.connection();
        let pointer: Option<String> = conn.get(user_session_key(user_id)).await?;
        let Some(session_id) = pointer else {
            return Ok(None);
        };
        match self.get(&session_id).await? {
            Some(session) if session.status == SessionStatus::Active => Ok(Some(session)),
            _ => {
                // stale pointer left over from an ended or expired session;
                // guarded so a concurrently created pairing keeps its pointer
                self.del_if_equals(&user_session_key(user_id), &session_id)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<MatchSession>> {
        let mut conn = self.connection();
        let ids: Vec<String> = conn.smembers(ACTIVE_SESSIONS_KEY).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        let mut sessions = Vec::new();
        for value in values.into_iter().flatten() {
            if let Ok(session) = serde_json::from_str::<MatchSession>(&value) {
                if session.status == SessionStatus::Active {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn end_session(&self, session_id: &str) -> Result<Option<MatchSession>> {
        let mut conn = self.connection();
        // the SREM claim, the ENDED rewrite, the retention TTL and the
        // pointer cleanup are one atomic step; only one caller observes
        // the claim, so the ACTIVE -> ENDED transition fires exactly once
        let encoded: Option<String> = self
            .end_session_script()
            .key(ACTIVE_SESSIONS_KEY)
            .key(session_key(session_id))
            .arg(session_id)
            .arg(Utc::now().to_rfc3339())
            .arg(self.retention_seconds())
            .arg(user_session_key(""))
            .invoke_async(&mut conn)
            .await?;
        match encoded {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

const ACTIVE_SESSIONS_KEY: &str = "mm:session:active";

fn session_key(session_id: &str) -> String {
    format!("mm:session:{}", session_id)
}

fn user_session_key(user_id: &str) -> String {
    format!("mm:session:user:{}", user_id)
}
