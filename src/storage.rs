use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::config::Config;

/// Atomic pair pop. Purges entries older than the cutoff score first, then
/// takes the two earliest waiters. A lone leftover entry is restored with its
/// original score so an odd-sized queue never loses its head.
const POP_PAIR_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local popped = redis.call('ZPOPMIN', KEYS[1], 2)
if #popped < 4 then
    if #popped == 2 then
        redis.call('ZADD', KEYS[1], popped[2], popped[1])
    end
    return {}
end
return {popped[1], popped[3]}
"#;

/// Delete a key only if it still holds the expected value. Shared by lock
/// release and stale session-pointer cleanup, where an unconditional DEL
/// could erase a value written by a concurrent writer.
const COMPARE_DEL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Finalize a session in one step: claim it off the active set, rewrite the
/// document as ENDED with a retention TTL, and drop both user pointers,
/// each only if it still points at this session. Returns the ENDED document
/// or nothing when the claim was lost.
const END_SESSION_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
    return false
end
local doc = redis.call('GET', KEYS[2])
if not doc then
    return false
end
local session = cjson.decode(doc)
if session.status ~= 'ACTIVE' then
    return false
end
session.status = 'ENDED'
session.ended_at = ARGV[2]
local encoded = cjson.encode(session)
redis.call('SETEX', KEYS[2], ARGV[3], encoded)
for _, user in ipairs({session.user_a, session.user_b}) do
    local pointer = ARGV[4] .. user
    if redis.call('GET', pointer) == ARGV[1] then
        redis.call('DEL', pointer)
    end
end
return encoded
"#;

/// The matchmaking waiting queue, shared across all server processes.
#[async_trait]
pub trait MatchQueue: Send + Sync {
    /// Add a user to the queue. Idempotent: an already-queued user keeps
    /// their original position.
    async fn enqueue(&self, user_id: &str) -> Result<()>;
    async fn remove(&self, user_id: &str) -> Result<()>;
    /// Atomically remove and return the two earliest waiters, or `None` if
    /// fewer than two are queued. No concurrent caller can observe either
    /// returned entry.
    async fn pop_pair(&self) -> Result<Option<(String, String)>>;
}

/// Time-bounded exclusive claims (per-user matchmaking locks, sweeper lease).
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to acquire `name` for `ttl_ms`. Returns the holder token on
    /// success, `None` when the lock is already held.
    async fn acquire(&self, name: &str, ttl_ms: u64) -> Result<Option<String>>;
    /// Release `name` if `token` still holds it.
    async fn release(&self, name: &str, token: &str) -> Result<()>;
}

/// Per-user live connection counting.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Returns the connection count after the increment.
    async fn connection_opened(&self, user_id: &str) -> Result<i64>;
    /// Returns the remaining connection count (never negative).
    async fn connection_closed(&self, user_id: &str) -> Result<i64>;
    async fn is_online(&self, user_id: &str) -> Result<bool>;
}

/// Reconnect grace windows and their longer-lived "ever dropped" markers.
#[async_trait]
pub trait ReconnectStore: Send + Sync {
    /// Open the grace window and set the ever-dropped marker.
    async fn open_grace(&self, session_id: &str, user_id: &str) -> Result<()>;
    /// Clear both flags; called when the user reconnects in time, so a
    /// pending termination is fully suppressed.
    async fn clear_grace(&self, session_id: &str, user_id: &str) -> Result<()>;
    async fn in_grace(&self, session_id: &str, user_id: &str) -> Result<bool>;
    async fn ever_marked(&self, session_id: &str, user_id: &str) -> Result<bool>;
}

/// Signaling-side shared state: rate-limit windows, offer/answer "sent"
/// markers and the early-ICE buffers.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Count one message against the user's fixed window. Returns `false`
    /// when the window limit is exceeded.
    async fn check_rate(&self, user_id: &str) -> Result<bool>;
    async fn mark_sdp_sent(&self, session_id: &str, user_id: &str) -> Result<()>;
    async fn sdp_sent(&self, session_id: &str, user_id: &str) -> Result<bool>;
    async fn buffer_ice(
        &self,
        session_id: &str,
        user_id: &str,
        candidate: &serde_json::Value,
    ) -> Result<()>;
    /// Remove and return all buffered candidates in arrival order.
    async fn drain_ice(&self, session_id: &str, user_id: &str) -> Result<Vec<serde_json::Value>>;
}

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    config: Arc<Config>,
    pop_pair: Arc<Script>,
    compare_del: Arc<Script>,
    end_session: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            config,
            pop_pair: Arc::new(Script::new(POP_PAIR_SCRIPT)),
            compare_del: Arc::new(Script::new(COMPARE_DEL_SCRIPT)),
            end_session: Arc::new(Script::new(END_SESSION_SCRIPT)),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    pub fn retention_seconds(&self) -> u64 {
        self.config.session_retention_seconds
    }

    /// Delete `key` only if it currently holds `expected`.
    pub(crate) async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .compare_del
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    pub(crate) fn end_session_script(&self) -> &Script {
        &self.end_session
    }
}

#[async_trait]
impl MatchQueue for RedisStore {
    async fn enqueue(&self, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        // NX keeps the original enqueue time for duplicate requests
        let _: i64 = redis::cmd("ZADD")
            .arg(QUEUE_KEY)
            .arg("NX")
            .arg(now_millis())
            .arg(user_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.zrem(QUEUE_KEY, user_id).await?;
        Ok(())
    }

    async fn pop_pair(&self) -> Result<Option<(String, String)>> {
        let mut conn = self.redis.clone();
        let cutoff = now_millis().saturating_sub(self.config.queue_entry_ttl_seconds * 1_000);
        let popped: Vec<String> = self
            .pop_pair
            .key(QUEUE_KEY)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        match <[String; 2]>::try_from(popped) {
            Ok([a, b]) => Ok(Some((a, b))),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl LockManager for RedisStore {
    async fn acquire(&self, name: &str, ttl_ms: u64) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let token = lock_token();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn release(&self, name: &str, token: &str) -> Result<()> {
        self.del_if_equals(&lock_key(name), token).await?;
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn connection_opened(&self, user_id: &str) -> Result<i64> {
        let mut conn = self.redis.clone();
        let key = presence_key(user_id);
        let count: i64 = conn.incr(&key, 1).await?;
        let _: bool = conn
            .expire(&key, self.config.presence_ttl_seconds as i64)
            .await?;
        let _: i64 = conn.sadd(ONLINE_USERS_KEY, user_id).await?;
        Ok(count)
    }

    async fn connection_closed(&self, user_id: &str) -> Result<i64> {
        let mut conn = self.redis.clone();
        let key = presence_key(user_id);
        let count: i64 = conn.decr(&key, 1).await?;
        if count <= 0 {
            redis::pipe()
                .cmd("DEL")
                .arg(&key)
                .ignore()
                .cmd("SREM")
                .arg(ONLINE_USERS_KEY)
                .arg(user_id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
            return Ok(0);
        }
        Ok(count)
    }

    async fn is_online(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let online: bool = conn.sismember(ONLINE_USERS_KEY, user_id).await?;
        Ok(online)
    }
}

#[async_trait]
impl ReconnectStore for RedisStore {
    async fn open_grace(&self, session_id: &str, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let marker_ttl = self.config.grace_seconds + self.config.marker_slack_seconds;
        redis::pipe()
            .cmd("SETEX")
            .arg(grace_key(session_id, user_id))
            .arg(self.config.grace_seconds)
            .arg(1)
            .ignore()
            .cmd("SETEX")
            .arg(marked_key(session_id, user_id))
            .arg(marker_ttl)
            .arg(1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_grace(&self, session_id: &str, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .del(vec![
                grace_key(session_id, user_id),
                marked_key(session_id, user_id),
            ])
            .await?;
        Ok(())
    }

    async fn in_grace(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(grace_key(session_id, user_id)).await?;
        Ok(exists)
    }

    async fn ever_marked(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(marked_key(session_id, user_id)).await?;
        Ok(exists)
    }
}

#[async_trait]
impl SignalStore for RedisStore {
    async fn check_rate(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let key = rate_key(user_id);
        let count: i64 = conn.incr(&key, 1).await?;
        if count == 1 {
            let _: bool = conn
                .pexpire(&key, (self.config.signal_rate_window_seconds * 1_000) as i64)
                .await?;
        }
        Ok(count <= self.config.signal_rate_limit as i64)
    }

    async fn mark_sdp_sent(&self, session_id: &str, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(
                sdp_marker_key(session_id, user_id),
                1,
                self.config.sdp_marker_ttl_seconds,
            )
            .await?;
        Ok(())
    }

    async fn sdp_sent(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(sdp_marker_key(session_id, user_id)).await?;
        Ok(exists)
    }

    async fn buffer_ice(
        &self,
        session_id: &str,
        user_id: &str,
        candidate: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = ice_buffer_key(session_id, user_id);
        let serialized = serde_json::to_string(candidate)?;
        redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(serialized)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.ice_buffer_ttl_seconds)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain_ice(&self, session_id: &str, user_id: &str) -> Result<Vec<serde_json::Value>> {
        let mut conn = self.redis.clone();
        let key = ice_buffer_key(session_id, user_id);
        let (entries, _): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        let mut candidates = Vec::with_capacity(entries.len());
        for entry in entries {
            candidates.push(serde_json::from_str(&entry)?);
        }
        Ok(candidates)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(16)
        .collect()
}

pub const QUEUE_KEY: &str = "mm:queue";
const ONLINE_USERS_KEY: &str = "presence:online_users";

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

pub fn user_lock_name(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn presence_key(user_id: &str) -> String {
    format!("presence:{}:count", user_id)
}

fn grace_key(session_id: &str, user_id: &str) -> String {
    format!("reconnect:grace:{}:{}", session_id, user_id)
}

fn marked_key(session_id: &str, user_id: &str) -> String {
    format!("reconnect:marked:{}:{}", session_id, user_id)
}

fn rate_key(user_id: &str) -> String {
    format!("rl:signal:{}", user_id)
}

fn sdp_marker_key(session_id: &str, user_id: &str) -> String {
    format!("signal:{}:{}:sdp", session_id, user_id)
}

fn ice_buffer_key(session_id: &str, user_id: &str) -> String {
    format!("signal:{}:{}:ice", session_id, user_id)
}
