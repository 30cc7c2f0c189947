use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Seconds a dropped user may reconnect before the session is finalized.
    pub grace_seconds: u64,
    /// Extra lifetime of the "ever dropped" marker beyond the grace window.
    pub marker_slack_seconds: u64,
    /// Queue entries older than this are purged before pairing.
    pub queue_entry_ttl_seconds: u64,
    /// Per-user matchmaking lock TTL (crash failsafe).
    pub lock_ttl_ms: u64,
    /// Cluster-wide sweeper lease TTL.
    pub sweeper_lease_ms: u64,
    pub sweep_interval_seconds: u64,
    /// Signaling messages allowed per user per window.
    pub signal_rate_limit: u32,
    pub signal_rate_window_seconds: u64,
    /// Lifetime of the offer/answer "sent" markers.
    pub sdp_marker_ttl_seconds: u64,
    pub ice_buffer_ttl_seconds: u64,
    /// How long an ENDED session document is retained.
    pub session_retention_seconds: u64,
    /// Safety expiry on presence counters so an orphaned counter cannot
    /// keep a user "online" forever.
    pub presence_ttl_seconds: u64,
    /// Base URL of the user-account service; everyone is admitted when unset.
    pub user_directory_url: Option<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("MATCHWIRE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            grace_seconds: parse_env("RECONNECT_GRACE_SECONDS", 15),
            marker_slack_seconds: parse_env("RECONNECT_MARKER_SLACK_SECONDS", 30),
            queue_entry_ttl_seconds: parse_env("QUEUE_ENTRY_TTL_SECONDS", 300),
            lock_ttl_ms: parse_env("MATCH_LOCK_TTL_MS", 5_000),
            sweeper_lease_ms: parse_env("SWEEPER_LEASE_MS", 10_000),
            sweep_interval_seconds: parse_env("SWEEP_INTERVAL_SECONDS", 5),
            signal_rate_limit: parse_env("SIGNAL_RATE_LIMIT", 30),
            signal_rate_window_seconds: parse_env("SIGNAL_RATE_WINDOW_SECONDS", 10),
            sdp_marker_ttl_seconds: parse_env("SDP_MARKER_TTL_SECONDS", 120),
            ice_buffer_ttl_seconds: parse_env("ICE_BUFFER_TTL_SECONDS", 120),
            session_retention_seconds: parse_env("SESSION_RETENTION_SECONDS", 86_400),
            presence_ttl_seconds: parse_env("PRESENCE_TTL_SECONDS", 86_400),
            user_directory_url: env::var("USER_DIRECTORY_URL").ok(),
            turn_url: env::var("TURN_URL").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_credential: env::var("TURN_CREDENTIAL").ok(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            grace_seconds: 15,
            marker_slack_seconds: 30,
            queue_entry_ttl_seconds: 300,
            lock_ttl_ms: 5_000,
            sweeper_lease_ms: 10_000,
            sweep_interval_seconds: 5,
            signal_rate_limit: 30,
            signal_rate_window_seconds: 10,
            sdp_marker_ttl_seconds: 120,
            ice_buffer_ttl_seconds: 120,
            session_retention_seconds: 86_400,
            presence_ttl_seconds: 86_400,
            user_directory_url: None,
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}
