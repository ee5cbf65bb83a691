//! In-memory session registry: tokens, users, connection handles, and
//! chat-mode routing hints. Dynamic `HashMap`-backed rather than a fixed
//! slot array, so there is no `Full` capacity error in practice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

/// Process-local identifier for one accepted TCP connection. Stable for the
/// lifetime of the connection; never reused.
pub type ConnectionId = u64;

/// Shared, lock-protected handle to a connection's write half so that a
/// worker handling a *different* connection's request can push a frame here
/// without racing the owning worker's own response writes.
pub type ConnectionHandle = Arc<AsyncMutex<OwnedWriteHalf>>;

#[derive(Debug)]
pub enum SessionError {
    AlreadyLoggedIn,
    NotFound,
    Expired,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyLoggedIn => write!(f, "user already logged in"),
            SessionError::NotFound => write!(f, "session not found"),
            SessionError::Expired => write!(f, "session expired"),
        }
    }
}

impl std::error::Error for SessionError {}

struct SessionRecord {
    user_id: u64,
    connection_id: ConnectionId,
    created_at: Instant,
    last_activity: Instant,
    chat_partner_id: u64,
    chat_group_id: u64,
}

struct Inner {
    by_token: HashMap<String, SessionRecord>,
    token_by_user: HashMap<u64, String>,
    token_by_connection: HashMap<ConnectionId, String>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    rng: StdRng,
}

/// The session registry: a single mutex guards every operation, so all
/// session reads and writes are fully serialized.
pub struct SessionRegistry {
    timeout: Duration,
    inner: tokio::sync::Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(timeout_secs: u64) -> Self {
        let timeout_secs = if timeout_secs == 0 { 3600 } else { timeout_secs };
        Self {
            timeout: Duration::from_secs(timeout_secs),
            inner: tokio::sync::Mutex::new(Inner {
                by_token: HashMap::new(),
                token_by_user: HashMap::new(),
                token_by_connection: HashMap::new(),
                connections: HashMap::new(),
                rng: StdRng::seed_from_u64(rand::random()),
            }),
        }
    }

    /// Registers the write half so pushes can later be addressed to this
    /// connection; called once per accepted connection by the worker.
    pub async fn register_connection(&self, id: ConnectionId, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(id, handle);
    }

    fn reap_expired(inner: &mut Inner, timeout: Duration, now: Instant) {
        let expired: Vec<String> = inner
            .by_token
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) >= timeout)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(record) = inner.by_token.remove(&token) {
                inner.token_by_user.remove(&record.user_id);
                inner.token_by_connection.remove(&record.connection_id);
            }
        }
    }

    pub async fn create(
        &self,
        user_id: u64,
        connection_id: ConnectionId,
    ) -> Result<String, SessionError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        Self::reap_expired(&mut inner, self.timeout, now);

        // Expire any prior session bound to this same connection first.
        if let Some(old_token) = inner.token_by_connection.remove(&connection_id) {
            if let Some(record) = inner.by_token.remove(&old_token) {
                inner.token_by_user.remove(&record.user_id);
            }
        }

        if inner.token_by_user.contains_key(&user_id) {
            return Err(SessionError::AlreadyLoggedIn);
        }

        let token = Self::generate_unique_token(&mut inner);
        inner.by_token.insert(
            token.clone(),
            SessionRecord {
                user_id,
                connection_id,
                created_at: now,
                last_activity: now,
                chat_partner_id: 0,
                chat_group_id: 0,
            },
        );
        inner.token_by_user.insert(user_id, token.clone());
        inner.token_by_connection.insert(connection_id, token.clone());
        Ok(token)
    }

    fn generate_unique_token(inner: &mut Inner) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        for _ in 0..10 {
            let candidate: String = (0..32)
                .map(|_| ALPHABET[inner.rng.gen_range(0..ALPHABET.len())] as char)
                .collect();
            if !inner.by_token.contains_key(&candidate) {
                return candidate;
            }
        }
        // Best-effort per spec: after 10 collisions, append a disambiguator.
        format!("{:x}", inner.rng.gen::<u128>())
    }

    pub async fn validate(&self, token: &str) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        Self::reap_expired(&mut inner, self.timeout, now);
        let timeout = self.timeout;
        let record = inner
            .by_token
            .get_mut(token)
            .ok_or(SessionError::NotFound)?;
        if now.duration_since(record.last_activity) >= timeout {
            let user_id = record.user_id;
            let connection_id = record.connection_id;
            inner.by_token.remove(token);
            inner.token_by_user.remove(&user_id);
            inner.token_by_connection.remove(&connection_id);
            return Err(SessionError::Expired);
        }
        record.last_activity = now;
        Ok(record.user_id)
    }

    pub async fn destroy(&self, token: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        let record = inner.by_token.remove(token).ok_or(SessionError::NotFound)?;
        inner.token_by_user.remove(&record.user_id);
        inner.token_by_connection.remove(&record.connection_id);
        Ok(())
    }

    pub async fn remove_by_connection(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.token_by_connection.remove(&connection_id) {
            if let Some(record) = inner.by_token.remove(&token) {
                inner.token_by_user.remove(&record.user_id);
            }
        }
        inner.connections.remove(&connection_id);
    }

    pub async fn is_user_online(&self, user_id: u64) -> bool {
        let inner = self.inner.lock().await;
        inner.token_by_user.contains_key(&user_id)
    }

    pub async fn get_connection(&self, user_id: u64) -> Option<ConnectionHandle> {
        let inner = self.inner.lock().await;
        let token = inner.token_by_user.get(&user_id)?;
        let record = inner.by_token.get(token)?;
        inner.connections.get(&record.connection_id).cloned()
    }

    pub async fn set_chat_partner(&self, user_id: u64, partner_id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.token_by_user.get(&user_id).cloned() {
            if let Some(record) = inner.by_token.get_mut(&token) {
                record.chat_partner_id = partner_id;
            }
        }
    }

    pub async fn get_chat_partner(&self, user_id: u64) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .token_by_user
            .get(&user_id)
            .and_then(|t| inner.by_token.get(t))
            .map(|r| r.chat_partner_id)
            .unwrap_or(0)
    }

    pub async fn is_chatting_with(&self, user_id: u64, partner_id: u64) -> bool {
        self.get_chat_partner(user_id).await == partner_id && partner_id != 0
    }

    pub async fn set_chat_group(&self, user_id: u64, group_id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(token) = inner.token_by_user.get(&user_id).cloned() {
            if let Some(record) = inner.by_token.get_mut(&token) {
                record.chat_group_id = group_id;
            }
        }
    }

    pub async fn get_chat_group(&self, user_id: u64) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .token_by_user
            .get(&user_id)
            .and_then(|t| inner.by_token.get(t))
            .map(|r| r.chat_group_id)
            .unwrap_or(0)
    }

    pub async fn is_in_group_chat(&self, user_id: u64, group_id: u64) -> bool {
        self.get_chat_group(user_id).await == group_id && group_id != 0
    }

    /// Returns `(created_at, last_activity)` as unix-seconds, for diagnostics.
    #[allow(dead_code)]
    pub async fn session_age_secs(&self, user_id: u64) -> Option<u64> {
        let inner = self.inner.lock().await;
        let token = inner.token_by_user.get(&user_id)?;
        let record = inner.by_token.get(token)?;
        Some(record.created_at.elapsed().as_secs())
    }
}
