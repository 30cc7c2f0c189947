use serde::{Deserialize, Serialize};

/// RTCPeerConnection connection states a client may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An SDP blob as produced by `RTCPeerConnection.createOffer`/`createAnswer`.
/// Relayed verbatim; the server never inspects the SDP itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub typ: String,
    pub sdp: String,
}

/// Messages sent from client to server over the signaling WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer { session_id: String, offer: SdpPayload },
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer {
        session_id: String,
        answer: SdpPayload,
    },
    /// `candidate: null` marks the end of trickle ICE and is relayed as-is.
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        session_id: String,
        candidate: Option<serde_json::Value>,
    },
    #[serde(rename = "connection-state", rename_all = "camelCase")]
    ConnectionState {
        session_id: String,
        state: ConnectionState,
    },
    #[serde(rename = "ice-restart", rename_all = "camelCase")]
    IceRestart { session_id: String },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "matchFound", rename_all = "camelCase")]
    MatchFound {
        session_id: String,
        partner_id: String,
    },
    #[serde(rename = "matchEnded", rename_all = "camelCase")]
    MatchEnded { session_id: String },
    #[serde(rename = "partnerDisconnected", rename_all = "camelCase")]
    PartnerDisconnected {
        session_id: String,
        grace_seconds: u64,
    },
    #[serde(rename = "sessionResumed", rename_all = "camelCase")]
    SessionResumed { session_id: String },
    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer { session_id: String, offer: SdpPayload },
    #[serde(rename = "answer", rename_all = "camelCase")]
    Answer {
        session_id: String,
        answer: SdpPayload,
    },
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        session_id: String,
        candidate: Option<serde_json::Value>,
    },
    #[serde(rename = "partner-connection-state", rename_all = "camelCase")]
    PartnerConnectionState {
        session_id: String,
        state: ConnectionState,
    },
    #[serde(rename = "ice-restart-request", rename_all = "camelCase")]
    IceRestartRequest { session_id: String },
    #[serde(rename = "signalingError")]
    SignalingError { message: String },
}

/// Body of the synchronous start/skip/end requests. The user id is supplied
/// by the (already authenticated) boundary layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub user_id: String,
}

/// Response shape shared by start/skip/end; absent fields are omitted so the
/// bodies come out as `{"waiting":true}`, `{"matched":true,...}` etc.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_matched: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
