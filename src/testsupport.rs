//! In-memory implementations of the store seams, used by unit tests only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::accounts::{UserDirectory, UserRecord};
use crate::events::EventSink;
use crate::protocol::ServerMessage;
use crate::sessions::{MatchSession, SessionStatus, SessionStore};
use crate::storage::{
    LockManager, MatchQueue, PresenceStore, ReconnectStore, SignalStore,
};

#[derive(Default)]
pub struct MemoryQueue {
    waiting: Mutex<VecDeque<String>>,
}

impl MemoryQueue {
    pub fn contains(&self, user_id: &str) -> bool {
        self.waiting.lock().unwrap().iter().any(|u| u == user_id)
    }
}

#[async_trait]
impl MatchQueue for MemoryQueue {
    async fn enqueue(&self, user_id: &str) -> Result<()> {
        let mut waiting = self.waiting.lock().unwrap();
        if !waiting.iter().any(|u| u == user_id) {
            waiting.push_back(user_id.to_string());
        }
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> Result<()> {
        self.waiting.lock().unwrap().retain(|u| u != user_id);
        Ok(())
    }

    async fn pop_pair(&self) -> Result<Option<(String, String)>> {
        let mut waiting = self.waiting.lock().unwrap();
        let Some(first) = waiting.pop_front() else {
            return Ok(None);
        };
        let Some(second) = waiting.pop_front() else {
            // a lone head goes back with its position intact, mirroring
            // the shared store's restore branch
            waiting.push_front(first);
            return Ok(None);
        };
        Ok(Some((first, second)))
    }
}

#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl LockManager for MemoryLocks {
    async fn acquire(&self, name: &str, _ttl_ms: u64) -> Result<Option<String>> {
        let mut held = self.held.lock().unwrap();
        if held.contains_key(name) {
            return Ok(None);
        }
        let token = format!("token-{}", held.len());
        held.insert(name.to_string(), token.clone());
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        if held.get(name).map(String::as_str) == Some(token) {
            held.remove(name);
        }
        Ok(())
    }
}

/// Mirrors the shared store's layout: session documents plus a per-user
/// pointer at that user's current session.
#[derive(Default)]
pub struct MemorySessions {
    sessions: Mutex<HashMap<String, MatchSession>>,
    pointers: Mutex<HashMap<String, String>>,
}

impl MemorySessions {
    pub fn insert(&self, session: MatchSession) {
        {
            let mut pointers = self.pointers.lock().unwrap();
            pointers.insert(session.user_a.clone(), session.id.clone());
            pointers.insert(session.user_b.clone(), session.id.clone());
        }
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn get_raw(&self, session_id: &str) -> Option<MatchSession> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn end(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.status = SessionStatus::Ended;
            session.ended_at = Some(Utc::now());
        }
        self.pointers
            .lock()
            .unwrap()
            .retain(|_, id| id != session_id);
    }

    /// Re-point a user at a session id that no longer resolves to an
    /// ACTIVE document, as a finalization that died halfway leaves behind.
    pub fn set_stale_pointer(&self, user_id: &str, session_id: &str) {
        self.pointers
            .lock()
            .unwrap()
            .insert(user_id.to_string(), session_id.to_string());
    }

    /// Drop a user's pointer only if it still holds `session_id`.
    pub fn clear_pointer_if(&self, user_id: &str, session_id: &str) {
        let mut pointers = self.pointers.lock().unwrap();
        if pointers.get(user_id).map(String::as_str) == Some(session_id) {
            pointers.remove(user_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count()
    }

    pub fn active_sessions_for(&self, user_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.is_participant(user_id))
            .count()
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn create(&self, session: &MatchSession) -> Result<()> {
        self.insert(session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<MatchSession>> {
        Ok(self.get_raw(session_id))
    }

    async fn find_active_by_user(&self, user_id: &str) -> Result<Option<MatchSession>> {
        let pointer = self.pointers.lock().unwrap().get(user_id).cloned();
        let Some(session_id) = pointer else {
            return Ok(None);
        };
        match self.get_raw(&session_id) {
            Some(session) if session.status == SessionStatus::Active => Ok(Some(session)),
            _ => {
                self.clear_pointer_if(user_id, &session_id);
                Ok(None)
            }
        }
    }

    async fn list_active(&self) -> Result<Vec<MatchSession>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn end_session(&self, session_id: &str) -> Result<Option<MatchSession>> {
        let ended = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(session_id) {
                Some(session) if session.status == SessionStatus::Active => {
                    session.status = SessionStatus::Ended;
                    session.ended_at = Some(Utc::now());
                    Some(session.clone())
                }
                _ => None,
            }
        };
        if let Some(session) = &ended {
            self.clear_pointer_if(&session.user_a, session_id);
            self.clear_pointer_if(&session.user_b, session_id);
        }
        Ok(ended)
    }
}

#[derive(Default)]
pub struct MemoryPresence {
    counts: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn connection_opened(&self, user_id: &str) -> Result<i64> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn connection_closed(&self, user_id: &str) -> Result<i64> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(user_id.to_string()).or_insert(0);
        *count -= 1;
        if *count <= 0 {
            counts.remove(user_id);
            return Ok(0);
        }
        Ok(*count)
    }

    async fn is_online(&self, user_id: &str) -> Result<bool> {
        Ok(self.counts.lock().unwrap().contains_key(user_id))
    }
}

#[derive(Default)]
pub struct MemoryReconnect {
    grace: Mutex<HashSet<(String, String)>>,
    marked: Mutex<HashSet<(String, String)>>,
}

impl MemoryReconnect {
    /// Simulate TTL expiry of the grace window, leaving the longer-lived
    /// marker in place.
    pub fn expire_grace(&self, session_id: &str, user_id: &str) {
        self.grace
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), user_id.to_string()));
    }
}

#[async_trait]
impl ReconnectStore for MemoryReconnect {
    async fn open_grace(&self, session_id: &str, user_id: &str) -> Result<()> {
        let key = (session_id.to_string(), user_id.to_string());
        self.grace.lock().unwrap().insert(key.clone());
        self.marked.lock().unwrap().insert(key);
        Ok(())
    }

    async fn clear_grace(&self, session_id: &str, user_id: &str) -> Result<()> {
        let key = (session_id.to_string(), user_id.to_string());
        self.grace.lock().unwrap().remove(&key);
        self.marked.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn in_grace(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let key = (session_id.to_string(), user_id.to_string());
        Ok(self.grace.lock().unwrap().contains(&key))
    }

    async fn ever_marked(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let key = (session_id.to_string(), user_id.to_string());
        Ok(self.marked.lock().unwrap().contains(&key))
    }
}

pub struct MemorySignals {
    limit: Option<u32>,
    counts: Mutex<HashMap<String, u32>>,
    sdp_sent: Mutex<HashSet<(String, String)>>,
    ice: Mutex<HashMap<(String, String), Vec<serde_json::Value>>>,
}

impl Default for MemorySignals {
    fn default() -> Self {
        Self {
            limit: None,
            counts: Mutex::default(),
            sdp_sent: Mutex::default(),
            ice: Mutex::default(),
        }
    }
}

impl MemorySignals {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SignalStore for MemorySignals {
    async fn check_rate(&self, user_id: &str) -> Result<bool> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        Ok(match self.limit {
            Some(limit) => *count <= limit,
            None => true,
        })
    }

    async fn mark_sdp_sent(&self, session_id: &str, user_id: &str) -> Result<()> {
        self.sdp_sent
            .lock()
            .unwrap()
            .insert((session_id.to_string(), user_id.to_string()));
        Ok(())
    }

    async fn sdp_sent(&self, session_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .sdp_sent
            .lock()
            .unwrap()
            .contains(&(session_id.to_string(), user_id.to_string())))
    }

    async fn buffer_ice(
        &self,
        session_id: &str,
        user_id: &str,
        candidate: &serde_json::Value,
    ) -> Result<()> {
        self.ice
            .lock()
            .unwrap()
            .entry((session_id.to_string(), user_id.to_string()))
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn drain_ice(&self, session_id: &str, user_id: &str) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .ice
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), user_id.to_string()))
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, ServerMessage)>>,
}

impl RecordingSink {
    pub fn messages_for(&self, user_id: &str) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, user_id: &str, message: ServerMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((user_id.to_string(), message));
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticDirectory {
    banned: HashSet<String>,
    unknown: HashSet<String>,
}

impl StaticDirectory {
    pub fn with_banned(mut self, user_id: &str) -> Self {
        self.banned.insert(user_id.to_string());
        self
    }

    pub fn with_unknown(mut self, user_id: &str) -> Self {
        self.unknown.insert(user_id.to_string());
        self
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        if self.unknown.contains(user_id) {
            return Ok(None);
        }
        Ok(Some(UserRecord {
            banned: self.banned.contains(user_id),
        }))
    }
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn lone_queue_entry_keeps_its_position() {
        let queue = MemoryQueue::default();
        queue.enqueue("u1").await.unwrap();

        // an odd-sized queue leaves its head untouched
        assert_eq!(queue.pop_pair().await.unwrap(), None);
        assert!(queue.contains("u1"));

        // and that head still pairs first when a partner arrives
        queue.enqueue("u2").await.unwrap();
        assert_eq!(
            queue.pop_pair().await.unwrap(),
            Some(("u1".into(), "u2".into()))
        );
        assert_eq!(queue.pop_pair().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_pointers_resolve_to_no_session_and_are_cleaned() {
        let sessions = MemorySessions::default();
        sessions.set_stale_pointer("u1", "gone");
        assert!(sessions.find_active_by_user("u1").await.unwrap().is_none());
        // the cleanup consumed the pointer
        assert!(sessions.find_active_by_user("u1").await.unwrap().is_none());
    }
}
