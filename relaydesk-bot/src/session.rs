//! In-flight login attempts, keyed by an opaque session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::SharedClient;

/// One login attempt between `start_login` and its completion.
///
/// Immutable once created; the store only ever inserts and removes it.
pub struct LoginSession {
    pub id: String,
    pub phone: String,
    pub code_hash: Option<String>,
    pub client: SharedClient,
    pub created_at: Instant,
}

impl LoginSession {
    pub fn new(id: String, phone: String, code_hash: Option<String>, client: SharedClient) -> Self {
        Self {
            id,
            phone,
            code_hash,
            client,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Fresh, unguessable session id (16 random bytes, URL-safe base64).
pub fn generate_session_id() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Session id → login attempt. Every operation takes the lock once, so
/// concurrent callers never see a partially written entry.
pub struct LoginSessionStore {
    sessions: Mutex<HashMap<String, Arc<LoginSession>>>,
    ttl: Duration,
}

impl LoginSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired(&self, session: &LoginSession, now: Instant) -> bool {
        now.saturating_duration_since(session.created_at) >= self.ttl
    }

    /// Insert a new session. Returns `false` (and stores nothing) if the id
    /// is already taken.
    pub fn insert(&self, session: LoginSession) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id.clone(), Arc::new(session));
        true
    }

    /// Look up a live session. Expired sessions read as absent; they stay
    /// in the map until [`Self::take_expired`] collects them.
    pub fn get(&self, id: &str) -> Option<Arc<LoginSession>> {
        let sessions = self.sessions.lock();
        let session = sessions.get(id)?;
        if self.is_expired(session, Instant::now()) {
            return None;
        }
        Some(Arc::clone(session))
    }

    /// Remove a session. Exactly one caller gets `Some` for a given id.
    pub fn remove(&self, id: &str) -> Option<Arc<LoginSession>> {
        self.sessions.lock().remove(id)
    }

    /// Remove and return every expired session.
    pub fn take_expired(&self) -> Vec<Arc<LoginSession>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| self.is_expired(s, now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect()
    }

    /// Remove and return everything (shutdown).
    pub fn drain(&self) -> Vec<Arc<LoginSession>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
