use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SignalError;
use crate::events::EventSink;
use crate::protocol::{ClientMessage, ConnectionState, SdpPayload, ServerMessage};
use crate::sessions::{MatchSession, SessionStatus, SessionStore};
use crate::storage::SignalStore;

/// Forwards WebRTC signaling between the two participants of an active
/// session. Every message is membership-checked and rate-limited before it
/// touches the partner; ICE candidates that arrive before the sender's own
/// offer/answer are buffered until that SDP has gone out.
pub struct SignalingRelay {
    sessions: Arc<dyn SessionStore>,
    signals: Arc<dyn SignalStore>,
    events: Arc<dyn EventSink>,
}

impl SignalingRelay {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        signals: Arc<dyn SignalStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sessions,
            signals,
            events,
        }
    }

    pub async fn handle(&self, user_id: &str, message: ClientMessage) -> Result<(), SignalError> {
        match message {
            ClientMessage::Offer { session_id, offer } => {
                if offer.typ != "offer" {
                    return Err(SignalError::Validation(format!(
                        "expected sdp type \"offer\", got \"{}\"",
                        offer.typ
                    )));
                }
                self.relay_sdp(user_id, &session_id, offer).await
            }
            ClientMessage::Answer { session_id, answer } => {
                if answer.typ != "answer" {
                    return Err(SignalError::Validation(format!(
                        "expected sdp type \"answer\", got \"{}\"",
                        answer.typ
                    )));
                }
                self.relay_sdp(user_id, &session_id, answer).await
            }
            ClientMessage::IceCandidate {
                session_id,
                candidate,
            } => self.relay_ice(user_id, &session_id, candidate).await,
            ClientMessage::ConnectionState { session_id, state } => {
                self.relay_connection_state(user_id, &session_id, state)
                    .await
            }
            ClientMessage::IceRestart { session_id } => {
                self.relay_ice_restart(user_id, &session_id).await
            }
        }
    }

    /// Forward an offer or answer, record the sender's "sent" marker, then
    /// flush any ICE the sender buffered before it.
    async fn relay_sdp(
        &self,
        user_id: &str,
        session_id: &str,
        payload: SdpPayload,
    ) -> Result<(), SignalError> {
        let session = self.authorize(user_id, session_id).await?;
        self.admit(user_id).await?;
        let partner = partner_of(&session, user_id)?;

        self.signals.mark_sdp_sent(session_id, user_id).await?;
        let message = if payload.typ == "offer" {
            ServerMessage::Offer {
                session_id: session_id.to_string(),
                offer: payload,
            }
        } else {
            ServerMessage::Answer {
                session_id: session_id.to_string(),
                answer: payload,
            }
        };
        self.events.deliver(partner, message).await?;

        let buffered = self.signals.drain_ice(session_id, user_id).await?;
        if !buffered.is_empty() {
            debug!(
                session_id = %session_id,
                from = %user_id,
                count = buffered.len(),
                "flushing buffered ice candidates"
            );
        }
        for candidate in buffered {
            let candidate = match candidate {
                serde_json::Value::Null => None,
                value => Some(value),
            };
            self.events
                .deliver(
                    partner,
                    ServerMessage::IceCandidate {
                        session_id: session_id.to_string(),
                        candidate,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// A peer cannot apply remote ICE before it has the matching session
    /// description, so candidates sent ahead of the sender's offer/answer
    /// are held back instead of forwarded.
    async fn relay_ice(
        &self,
        user_id: &str,
        session_id: &str,
        candidate: Option<serde_json::Value>,
    ) -> Result<(), SignalError> {
        let session = self.authorize(user_id, session_id).await?;
        self.admit(user_id).await?;
        let partner = partner_of(&session, user_id)?;

        if !self.signals.sdp_sent(session_id, user_id).await? {
            let value = candidate.unwrap_or(serde_json::Value::Null);
            self.signals.buffer_ice(session_id, user_id, &value).await?;
            debug!(session_id = %session_id, from = %user_id, "buffered early ice candidate");
            return Ok(());
        }

        self.events
            .deliver(
                partner,
                ServerMessage::IceCandidate {
                    session_id: session_id.to_string(),
                    candidate,
                },
            )
            .await?;
        Ok(())
    }

    async fn relay_connection_state(
        &self,
        user_id: &str,
        session_id: &str,
        state: ConnectionState,
    ) -> Result<(), SignalError> {
        let session = self.authorize(user_id, session_id).await?;
        self.admit(user_id).await?;
        let partner = partner_of(&session, user_id)?;
        self.events
            .deliver(
                partner,
                ServerMessage::PartnerConnectionState {
                    session_id: session_id.to_string(),
                    state,
                },
            )
            .await?;
        Ok(())
    }

    async fn relay_ice_restart(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), SignalError> {
        let session = self.authorize(user_id, session_id).await?;
        self.admit(user_id).await?;
        let partner = partner_of(&session, user_id)?;
        self.events
            .deliver(
                partner,
                ServerMessage::IceRestartRequest {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// The session must exist, be ACTIVE, and include the caller.
    async fn authorize(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<MatchSession, SignalError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(SignalError::InvalidSession)?;
        if session.status != SessionStatus::Active {
            return Err(SignalError::InvalidSession);
        }
        if !session.is_participant(user_id) {
            warn!(
                session_id = %session_id,
                user_id = %user_id,
                "signaling attempt by non-participant"
            );
            return Err(SignalError::Unauthorized);
        }
        Ok(session)
    }

    async fn admit(&self, user_id: &str) -> Result<(), SignalError> {
        if !self.signals.check_rate(user_id).await? {
            return Err(SignalError::RateLimited);
        }
        Ok(())
    }
}

fn partner_of<'a>(session: &'a MatchSession, user_id: &str) -> Result<&'a str, SignalError> {
    session.partner_of(user_id).ok_or(SignalError::Unauthorized)
}
