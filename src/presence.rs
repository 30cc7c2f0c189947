use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::protocol::ServerMessage;
use crate::sessions::SessionStore;
use crate::storage::{PresenceStore, ReconnectStore};

/// Tracks live connections per user and drives the reconnect grace window.
/// A user is offline only when their last connection closes; closing one of
/// several tabs is not a disconnect.
pub struct PresenceService {
    presence: Arc<dyn PresenceStore>,
    reconnect: Arc<dyn ReconnectStore>,
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventSink>,
    grace_seconds: u64,
}

impl PresenceService {
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        reconnect: Arc<dyn ReconnectStore>,
        sessions: Arc<dyn SessionStore>,
        events: Arc<dyn EventSink>,
        grace_seconds: u64,
    ) -> Self {
        Self {
            presence,
            reconnect,
            sessions,
            events,
            grace_seconds,
        }
    }

    /// Called for every new transport connection. Reconnecting inside the
    /// grace window revives the session for both parties.
    pub async fn connection_opened(&self, user_id: &str) -> Result<()> {
        let count = self.presence.connection_opened(user_id).await?;
        debug!(user_id = %user_id, connections = count, "connection opened");

        let Some(session) = self.sessions.find_active_by_user(user_id).await? else {
            return Ok(());
        };
        if !self.reconnect.in_grace(&session.id, user_id).await? {
            return Ok(());
        }

        self.reconnect.clear_grace(&session.id, user_id).await?;
        info!(session_id = %session.id, user_id = %user_id, "session resumed within grace window");
        let resumed = ServerMessage::SessionResumed {
            session_id: session.id.clone(),
        };
        self.notify(user_id, resumed.clone()).await;
        if let Some(partner) = session.partner_of(user_id) {
            self.notify(partner, resumed).await;
        }
        Ok(())
    }

    /// Called for every closed transport connection. Only the last close
    /// opens the grace window and warns the partner.
    pub async fn connection_closed(&self, user_id: &str) -> Result<()> {
        let remaining = self.presence.connection_closed(user_id).await?;
        debug!(user_id = %user_id, connections = remaining, "connection closed");
        if remaining > 0 {
            return Ok(());
        }

        let Some(session) = self.sessions.find_active_by_user(user_id).await? else {
            return Ok(());
        };
        self.reconnect.open_grace(&session.id, user_id).await?;
        info!(
            session_id = %session.id,
            user_id = %user_id,
            grace_seconds = self.grace_seconds,
            "user dropped, grace window opened"
        );
        if let Some(partner) = session.partner_of(user_id) {
            self.notify(
                partner,
                ServerMessage::PartnerDisconnected {
                    session_id: session.id.clone(),
                    grace_seconds: self.grace_seconds,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Whether the user holds at least one live connection anywhere in the
    /// cluster.
    pub async fn is_online(&self, user_id: &str) -> Result<bool> {
        self.presence.is_online(user_id).await
    }

    async fn notify(&self, user_id: &str, message: ServerMessage) {
        if let Err(err) = self.events.deliver(user_id, message).await {
            warn!(user_id = %user_id, error = %err, "event delivery failed");
        }
    }
}
