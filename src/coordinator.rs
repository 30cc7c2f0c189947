use std::sync::Arc;

use tracing::{info, warn};

use crate::accounts::UserDirectory;
use crate::error::MatchError;
use crate::events::EventSink;
use crate::protocol::ServerMessage;
use crate::sessions::{MatchSession, SessionStore};
use crate::storage::{user_lock_name, LockManager, MatchQueue};

/// Result of a start/skip request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Waiting,
    AlreadyMatched {
        session_id: String,
    },
    Matched {
        session_id: String,
        partner_id: String,
    },
}

/// Orchestrates queue, session store and event fanout for the
/// start/skip/end operations. Per-user mutual exclusion serializes
/// concurrent requests from the same user (duplicate clicks, second tabs);
/// unrelated users proceed in parallel.
pub struct MatchCoordinator {
    queue: Arc<dyn MatchQueue>,
    locks: Arc<dyn LockManager>,
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn UserDirectory>,
    events: Arc<dyn EventSink>,
    lock_ttl_ms: u64,
}

impl MatchCoordinator {
    pub fn new(
        queue: Arc<dyn MatchQueue>,
        locks: Arc<dyn LockManager>,
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn UserDirectory>,
        events: Arc<dyn EventSink>,
        lock_ttl_ms: u64,
    ) -> Self {
        Self {
            queue,
            locks,
            sessions,
            directory,
            events,
            lock_ttl_ms,
        }
    }

    pub async fn start(&self, user_id: &str) -> Result<MatchOutcome, MatchError> {
        let token = self.acquire_user_lock(user_id).await?;
        let result = self.start_locked(user_id).await;
        self.release_user_lock(user_id, &token).await;
        result
    }

    /// End the caller's active session, notify the partner, and immediately
    /// re-enter matchmaking, all under the same per-user lock.
    pub async fn skip(&self, user_id: &str) -> Result<MatchOutcome, MatchError> {
        let token = self.acquire_user_lock(user_id).await?;
        let result = match self.end_active(user_id).await {
            Ok(_) => self.start_locked(user_id).await,
            Err(err) => Err(err),
        };
        self.release_user_lock(user_id, &token).await;
        result
    }

    pub async fn end(&self, user_id: &str) -> Result<(), MatchError> {
        self.end_active(user_id).await?;
        Ok(())
    }

    async fn acquire_user_lock(&self, user_id: &str) -> Result<String, MatchError> {
        self.locks
            .acquire(&user_lock_name(user_id), self.lock_ttl_ms)
            .await?
            .ok_or(MatchError::Busy)
    }

    /// Best effort; the lock TTL is the failsafe if this never runs.
    async fn release_user_lock(&self, user_id: &str, token: &str) {
        if let Err(err) = self.locks.release(&user_lock_name(user_id), token).await {
            warn!(user_id = %user_id, error = %err, "failed to release matchmaking lock");
        }
    }

    async fn start_locked(&self, user_id: &str) -> Result<MatchOutcome, MatchError> {
        // store is authoritative for the one-active-session invariant
        if let Some(existing) = self.sessions.find_active_by_user(user_id).await? {
            return Ok(MatchOutcome::AlreadyMatched {
                session_id: existing.id,
            });
        }

        let user = self
            .directory
            .find_user(user_id)
            .await?
            .ok_or(MatchError::UnknownUser)?;
        if user.banned {
            return Err(MatchError::Banned);
        }

        self.queue.enqueue(user_id).await?;

        let Some((first, second)) = self.queue.pop_pair().await? else {
            return Ok(MatchOutcome::Waiting);
        };
        if first == second {
            // artifact of the lone-entry restore path; keep the user queued
            self.queue.enqueue(&first).await?;
            return Ok(MatchOutcome::Waiting);
        }

        let session = MatchSession::new(first.clone(), second.clone());
        self.sessions.create(&session).await?;
        info!(
            session_id = %session.id,
            user_a = %first,
            user_b = %second,
            "match created"
        );

        self.notify(
            &first,
            ServerMessage::MatchFound {
                session_id: session.id.clone(),
                partner_id: second.clone(),
            },
        )
        .await;
        self.notify(
            &second,
            ServerMessage::MatchFound {
                session_id: session.id.clone(),
                partner_id: first.clone(),
            },
        )
        .await;

        // the pop takes the two earliest waiters, which may or may not
        // include the caller; if not, the caller is still queued
        if first == user_id {
            Ok(MatchOutcome::Matched {
                session_id: session.id,
                partner_id: second,
            })
        } else if second == user_id {
            Ok(MatchOutcome::Matched {
                session_id: session.id,
                partner_id: first,
            })
        } else {
            Ok(MatchOutcome::Waiting)
        }
    }

    /// Transition the caller's active session to ENDED and tell the partner.
    async fn end_active(&self, user_id: &str) -> Result<MatchSession, MatchError> {
        let session = self
            .sessions
            .find_active_by_user(user_id)
            .await?
            .ok_or(MatchError::NoActiveSession)?;
        let Some(ended) = self.sessions.end_session(&session.id).await? else {
            // someone else (partner, sweeper, admin) ended it first
            return Err(MatchError::NoActiveSession);
        };
        info!(session_id = %ended.id, ended_by = %user_id, "match ended");
        if let Some(partner) = ended.partner_of(user_id) {
            self.notify(
                partner,
                ServerMessage::MatchEnded {
                    session_id: ended.id.clone(),
                },
            )
            .await;
        }
        // defensive: the user should not be queued while matched
        self.queue.remove(user_id).await?;
        Ok(ended)
    }

    async fn notify(&self, user_id: &str, message: ServerMessage) {
        if let Err(err) = self.events.deliver(user_id, message).await {
            warn!(user_id = %user_id, error = %err, "event delivery failed");
        }
    }
}
