use thiserror::Error;

/// Failures surfaced by the match coordinator.
#[derive(Debug, Error)]
pub enum MatchError {
    /// Another start/skip request for the same user is in flight.
    #[error("matchmaking busy for this user, retry shortly")]
    Busy,
    #[error("no active session")]
    NoActiveSession,
    #[error("account is banned")]
    Banned,
    #[error("user not found")]
    UnknownUser,
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Failures surfaced by the signaling relay.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid session")]
    InvalidSession,
    #[error("not a participant of this session")]
    Unauthorized,
    #[error("signaling rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
