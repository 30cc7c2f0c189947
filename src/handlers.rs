use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;

use crate::config::Config;
use crate::coordinator::{MatchCoordinator, MatchOutcome};
use crate::error::MatchError;
use crate::presence::PresenceService;
use crate::protocol::{MatchRequest, MatchResponse};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<MatchCoordinator>,
    pub presence: Arc<PresenceService>,
    pub ice_servers: Arc<Vec<IceServer>>,
}

/// STUN/TURN entry in the shape `RTCPeerConnection` expects.
#[derive(Debug, Clone, Serialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Public STUN defaults plus the TURN relay when one is configured.
pub fn ice_servers_from_config(config: &Config) -> Vec<IceServer> {
    let mut servers = vec![
        IceServer {
            urls: "stun:stun.l.google.com:19302".to_string(),
            username: None,
            credential: None,
        },
        IceServer {
            urls: "stun:stun1.l.google.com:19302".to_string(),
            username: None,
            credential: None,
        },
    ];
    if let (Some(url), Some(username), Some(credential)) = (
        config.turn_url.clone(),
        config.turn_username.clone(),
        config.turn_credential.clone(),
    ) {
        servers.push(IceServer {
            urls: url,
            username: Some(username),
            credential: Some(credential),
        });
    }
    servers
}

pub struct ApiError(MatchError);

impl From<MatchError> for ApiError {
    fn from(err: MatchError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MatchError::Busy => StatusCode::CONFLICT,
            MatchError::NoActiveSession => StatusCode::BAD_REQUEST,
            MatchError::Banned => StatusCode::FORBIDDEN,
            MatchError::UnknownUser => StatusCode::NOT_FOUND,
            MatchError::Store(err) => {
                error!(error = %err, "matchmaking store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn outcome_body(outcome: MatchOutcome) -> MatchResponse {
    match outcome {
        MatchOutcome::Waiting => MatchResponse {
            waiting: Some(true),
            ..Default::default()
        },
        MatchOutcome::AlreadyMatched { session_id } => MatchResponse {
            already_matched: Some(true),
            session_id: Some(session_id),
            ..Default::default()
        },
        MatchOutcome::Matched {
            session_id,
            partner_id,
        } => MatchResponse {
            matched: Some(true),
            session_id: Some(session_id),
            partner_id: Some(partner_id),
            ..Default::default()
        },
    }
}

/// POST /match/start
pub async fn start_match(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, ApiError> {
    let outcome = state.coordinator.start(&request.user_id).await?;
    Ok(Json(outcome_body(outcome)))
}

/// POST /match/skip
pub async fn skip_match(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, ApiError> {
    let outcome = state.coordinator.skip(&request.user_id).await?;
    Ok(Json(outcome_body(outcome)))
}

/// POST /match/end
pub async fn end_match(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, ApiError> {
    state.coordinator.end(&request.user_id).await?;
    Ok(Json(MatchResponse {
        message: Some("Match ended successfully".to_string()),
        ..Default::default()
    }))
}

/// GET /webrtc/ice-servers
pub async fn ice_servers(State(state): State<AppState>) -> Json<Vec<IceServer>> {
    Json(state.ice_servers.as_ref().clone())
}

#[derive(Debug, Serialize)]
pub struct PresenceStatus {
    pub online: bool,
}

/// GET /presence/:user_id
pub async fn presence_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceStatus>, ApiError> {
    let online = state
        .presence
        .is_online(&user_id)
        .await
        .map_err(MatchError::Store)?;
    Ok(Json(PresenceStatus { online }))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_bodies_match_the_wire_contract() {
        assert_eq!(
            serde_json::to_value(outcome_body(MatchOutcome::Waiting)).unwrap(),
            json!({"waiting": true})
        );
        assert_eq!(
            serde_json::to_value(outcome_body(MatchOutcome::AlreadyMatched {
                session_id: "s1".into()
            }))
            .unwrap(),
            json!({"alreadyMatched": true, "sessionId": "s1"})
        );
        assert_eq!(
            serde_json::to_value(outcome_body(MatchOutcome::Matched {
                session_id: "s1".into(),
                partner_id: "u2".into()
            }))
            .unwrap(),
            json!({"matched": true, "sessionId": "s1", "partnerId": "u2"})
        );
    }

    #[test]
    fn turn_entry_is_only_advertised_when_fully_configured() {
        let mut config = Config::default();
        assert_eq!(ice_servers_from_config(&config).len(), 2);

        config.turn_url = Some("turn:turn.example.com:3478".into());
        assert_eq!(ice_servers_from_config(&config).len(), 2);

        config.turn_username = Some("user".into());
        config.turn_credential = Some("secret".into());
        let servers = ice_servers_from_config(&config);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[2].username.as_deref(), Some("user"));
    }
}
