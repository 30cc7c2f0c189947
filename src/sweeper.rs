use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::events::EventSink;
use crate::protocol::ServerMessage;
use crate::sessions::SessionStore;
use crate::storage::{LockManager, ReconnectStore};

const SWEEPER_LEASE: &str = "sweeper";

/// Background job that finalizes sessions whose reconnect grace window has
/// expired. Every process runs the loop, but a short-lived lease ensures a
/// single sweep per tick across the cluster.
pub struct ReconnectSweeper {
    locks: Arc<dyn LockManager>,
    sessions: Arc<dyn SessionStore>,
    reconnect: Arc<dyn ReconnectStore>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    lease_ttl_ms: u64,
}

impl ReconnectSweeper {
    pub fn new(
        locks: Arc<dyn LockManager>,
        sessions: Arc<dyn SessionStore>,
        reconnect: Arc<dyn ReconnectStore>,
        events: Arc<dyn EventSink>,
        interval: Duration,
        lease_ttl_ms: u64,
    ) -> Self {
        Self {
            locks,
            sessions,
            reconnect,
            events,
            interval,
            lease_ttl_ms,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep_once().await {
                warn!(error = %err, "reconnect sweep failed, retrying next tick");
            }
        }
    }

    /// One tick: take the cluster lease, sweep, release. Losing the lease
    /// race makes this tick a no-op.
    pub async fn sweep_once(&self) -> Result<()> {
        let Some(token) = self.locks.acquire(SWEEPER_LEASE, self.lease_ttl_ms).await? else {
            return Ok(());
        };
        let result = self.sweep_sessions().await;
        if let Err(err) = self.locks.release(SWEEPER_LEASE, &token).await {
            warn!(error = %err, "failed to release sweeper lease");
        }
        result
    }

    async fn sweep_sessions(&self) -> Result<()> {
        for session in self.sessions.list_active().await? {
            for user_id in [session.user_a.as_str(), session.user_b.as_str()] {
                if self.reconnect.in_grace(&session.id, user_id).await? {
                    continue;
                }
                // distinguishes "grace expired" from "never dropped"
                if !self.reconnect.ever_marked(&session.id, user_id).await? {
                    continue;
                }
                let Some(ended) = self.sessions.end_session(&session.id).await? else {
                    break;
                };
                info!(
                    session_id = %ended.id,
                    user_id = %user_id,
                    "grace window expired, session finalized"
                );
                if let Some(partner) = ended.partner_of(user_id) {
                    if let Err(err) = self
                        .events
                        .deliver(
                            partner,
                            ServerMessage::MatchEnded {
                                session_id: ended.id.clone(),
                            },
                        )
                        .await
                    {
                        warn!(user_id = %partner, error = %err, "event delivery failed");
                    }
                }
                // one expired participant is enough to finalize
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{MatchSession, SessionStatus};
    use crate::storage::ReconnectStore;
    use crate::testsupport::{MemoryLocks, MemoryReconnect, MemorySessions, RecordingSink};

    struct Fixture {
        sweeper: ReconnectSweeper,
        locks: Arc<MemoryLocks>,
        sessions: Arc<MemorySessions>,
        reconnect: Arc<MemoryReconnect>,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let locks = Arc::new(MemoryLocks::default());
        let sessions = Arc::new(MemorySessions::default());
        let reconnect = Arc::new(MemoryReconnect::default());
        let sink = Arc::new(RecordingSink::default());
        let sweeper = ReconnectSweeper::new(
            locks.clone(),
            sessions.clone(),
            reconnect.clone(),
            sink.clone(),
            Duration::from_secs(5),
            10_000,
        );
        Fixture {
            sweeper,
            locks,
            sessions,
            reconnect,
            sink,
        }
    }

    fn active_session(f: &Fixture) -> String {
        let session = MatchSession::new("u1".into(), "u2".into());
        let id = session.id.clone();
        f.sessions.insert(session);
        id
    }

    #[tokio::test]
    async fn expired_grace_ends_the_session_and_notifies_the_partner() {
        let f = fixture();
        let session_id = active_session(&f);
        f.reconnect.open_grace(&session_id, "u1").await.unwrap();
        f.reconnect.expire_grace(&session_id, "u1");

        f.sweeper.sweep_once().await.unwrap();

        assert_eq!(
            f.sessions.get_raw(&session_id).unwrap().status,
            SessionStatus::Ended
        );
        assert_eq!(
            f.sink.messages_for("u2"),
            vec![ServerMessage::MatchEnded {
                session_id: session_id.clone()
            }]
        );

        // a second sweep is a no-op: the transition is terminal
        f.sweeper.sweep_once().await.unwrap();
        assert_eq!(f.sink.messages_for("u2").len(), 1);
    }

    #[tokio::test]
    async fn sessions_that_never_dropped_are_left_alone() {
        let f = fixture();
        let session_id = active_session(&f);
        f.sweeper.sweep_once().await.unwrap();
        assert_eq!(
            f.sessions.get_raw(&session_id).unwrap().status,
            SessionStatus::Active
        );
        assert!(f.sink.messages_for("u2").is_empty());
    }

    #[tokio::test]
    async fn open_grace_windows_defer_finalization() {
        let f = fixture();
        let session_id = active_session(&f);
        f.reconnect.open_grace(&session_id, "u1").await.unwrap();

        f.sweeper.sweep_once().await.unwrap();

        assert_eq!(
            f.sessions.get_raw(&session_id).unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn resumed_users_do_not_trigger_finalization() {
        let f = fixture();
        let session_id = active_session(&f);
        f.reconnect.open_grace(&session_id, "u1").await.unwrap();
        // the resume path clears both flags
        f.reconnect.clear_grace(&session_id, "u1").await.unwrap();

        f.sweeper.sweep_once().await.unwrap();

        assert_eq!(
            f.sessions.get_raw(&session_id).unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn tick_is_a_noop_when_another_instance_holds_the_lease() {
        let f = fixture();
        let session_id = active_session(&f);
        f.reconnect.open_grace(&session_id, "u1").await.unwrap();
        f.reconnect.expire_grace(&session_id, "u1");

        let _held = f.locks.acquire(SWEEPER_LEASE, 10_000).await.unwrap();
        f.sweeper.sweep_once().await.unwrap();

        assert_eq!(
            f.sessions.get_raw(&session_id).unwrap().status,
            SessionStatus::Active
        );
    }
}
