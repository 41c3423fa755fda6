//! Shared state handed to every handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use parking_lot::Mutex;
use relaydesk_bot::LoginOrchestrator;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::oidc::OidcClient;

/// Pending OIDC logins expire after this long.
pub const OAUTH_PENDING_TTL: Duration = Duration::from_secs(300);

/// Server-side half of an in-flight OIDC login, keyed by `state`.
#[derive(Debug, Clone)]
pub struct OAuthPending {
    pub code_verifier: String,
    pub redirect_uri: String,
    pub next_url: Option<String>,
    pub created_at: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Arc<Mutex<Db>>,
    pub oidc: OidcClient,
    pub orchestrator: Arc<LoginOrchestrator>,
    /// Events snapshot loaded at startup.
    pub events: Arc<Vec<serde_json::Value>>,
    pub oauth_pending: Arc<Mutex<HashMap<String, OAuthPending>>>,
    cookie_key: Key,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        db: Db,
        orchestrator: Arc<LoginOrchestrator>,
        events: Vec<serde_json::Value>,
    ) -> Self {
        let oidc = OidcClient::new(&config.oidc_issuer_url, &config.oidc_client_id);
        let cookie_key = derive_cookie_key(&config.session_secret);
        Self {
            config: Arc::new(config),
            db: Arc::new(Mutex::new(db)),
            oidc,
            orchestrator,
            events: Arc::new(events),
            oauth_pending: Arc::new(Mutex::new(HashMap::new())),
            cookie_key,
        }
    }

    /// Drop pending OIDC logins older than [`OAUTH_PENDING_TTL`].
    pub fn sweep_oauth_pending(&self) -> usize {
        let mut pending = self.oauth_pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.created_at.elapsed() < OAUTH_PENDING_TTL);
        before - pending.len()
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}

/// 64-byte cookie key from the configured secret of any length.
fn derive_cookie_key(secret: &str) -> Key {
    use sha2::{Digest, Sha512};
    let digest = Sha512::digest(secret.as_bytes());
    Key::from(digest.as_slice())
}
