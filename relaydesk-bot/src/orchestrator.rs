//! Login state machine.
//!
//! ```text
//! Idle ──start_login──▶ CodeRequested ──verify_code──▶ Authorized
//!                            │    ▲                        ▲
//!                            │    └ InvalidCode/Expired    │
//!                            └──2FA──▶ AwaitingPassword ───┘
//! ```
//!
//! Callers are synchronous (web handlers on blocking threads). Each platform
//! step is shipped to the bot loop through [`run_on_loop`]; every state
//! transition (store insert/remove, publishing the authenticated client)
//! happens back on the calling thread once the bridge returns. A result that
//! arrives after the caller timed out is therefore never applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::bridge::{LoopHandle, dispatch, run_on_loop};
use crate::client::{ChatClientHandle, SharedClient};
use crate::error::LoginError;
use crate::eventlog::EventLog;
use crate::platform::PlatformConnector;
use crate::scheduler::Scheduler;
use crate::session::{LoginSession, LoginSessionStore, generate_session_id};

/// Tunables for the login flow.
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub start_timeout: Duration,
    pub verify_timeout: Duration,
    pub session_ttl: Duration,
    pub scheduler_interval: Duration,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(20),
            verify_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(600),
            scheduler_interval: Duration::from_secs(60),
        }
    }
}

/// Non-interactive credentials for the startup path.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub phone: String,
    /// Platform session holding a previously completed login.
    pub session_name: String,
    pub target_chat: Option<i64>,
}

/// Successful result of [`LoginOrchestrator::verify_code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    Authorized { identity: String },
    /// Code accepted; the account needs its two-factor password. The session
    /// stays valid for a follow-up call with the password.
    PasswordRequired,
}

enum SignInStep {
    Authorized {
        identity: String,
        connected: Arc<AtomicBool>,
    },
    PasswordRequired,
}

// ─── AuthenticatedClient ─────────────────────────────────────────────────────

/// The process-wide logged-in client.
pub struct AuthenticatedClient {
    client: SharedClient,
    username: String,
    session_name: String,
    owning_loop: Option<LoopHandle>,
    connected: Arc<AtomicBool>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl AuthenticatedClient {
    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    /// Lower-cased username, or empty if the platform did not report one.
    pub fn current_identity(&self) -> &str {
        &self.username
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// The loop every further operation on this client must run on.
    pub fn owning_loop(&self) -> Option<&LoopHandle> {
        self.owning_loop.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Ticks completed by the attached scheduler, if one is running.
    pub fn scheduler_ticks(&self) -> Option<u64> {
        self.scheduler.lock().as_ref().map(Scheduler::ticks)
    }

    /// Stop the scheduler and disconnect, on the owning loop.
    fn retire(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        let client = Arc::clone(&self.client);
        dispatch(self.owning_loop.as_ref(), async move {
            client.lock().await.disconnect().await;
        });
    }
}

/// Single slot holding the current [`AuthenticatedClient`]. Readers get a
/// whole `Arc` or nothing.
#[derive(Default)]
pub struct ClientSlot {
    current: RwLock<Option<Arc<AuthenticatedClient>>>,
}

impl ClientSlot {
    pub fn get(&self) -> Option<Arc<AuthenticatedClient>> {
        self.current.read().clone()
    }

    /// Install `client`, returning the one it replaced.
    pub fn publish(&self, client: Arc<AuthenticatedClient>) -> Option<Arc<AuthenticatedClient>> {
        self.current.write().replace(client)
    }

    pub fn take(&self) -> Option<Arc<AuthenticatedClient>> {
        self.current.write().take()
    }
}

// ─── LoginOrchestrator ───────────────────────────────────────────────────────

pub struct LoginOrchestrator {
    connector: Arc<dyn PlatformConnector>,
    sessions: LoginSessionStore,
    slot: ClientSlot,
    bot_loop: RwLock<Option<LoopHandle>>,
    settings: LoginSettings,
    event_log: Arc<EventLog>,
}

impl LoginOrchestrator {
    pub fn new(
        connector: Arc<dyn PlatformConnector>,
        settings: LoginSettings,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            connector,
            sessions: LoginSessionStore::new(settings.session_ttl),
            slot: ClientSlot::default(),
            bot_loop: RwLock::new(None),
            settings,
            event_log,
        }
    }

    /// Route all platform work to `handle`. Without a loop, operations run
    /// on temporary runtimes on the calling thread.
    pub fn attach_loop(&self, handle: LoopHandle) {
        tracing::info!(event_loop = %handle.name(), "bot event loop attached");
        *self.bot_loop.write() = Some(handle);
    }

    fn bot_loop(&self) -> Option<LoopHandle> {
        self.bot_loop.read().clone()
    }

    pub fn settings(&self) -> &LoginSettings {
        &self.settings
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    /// Begin a web-driven login: connect a fresh client, have the platform
    /// send a code to `phone` and return the new session id.
    pub fn start_login(&self, phone: &str) -> Result<String, LoginError> {
        if !self.connector.credentials_configured() {
            return Err(LoginError::Configuration(
                "platform API id and hash are not set".into(),
            ));
        }
        self.sweep_expired();

        let phone = phone.trim().to_string();
        let id = generate_session_id();
        let session_name = format!("web_login_{id}");
        let client =
            ChatClientHandle::new(&session_name, self.connector.open(&session_name)).into_shared();

        let bot_loop = self.bot_loop();
        let op_client = Arc::clone(&client);
        let op_phone = phone.clone();
        let result = run_on_loop(
            bot_loop.as_ref(),
            async move {
                let mut c = op_client.lock().await;
                let requested = async {
                    c.connect().await?;
                    c.request_code(&op_phone).await
                }
                .await;
                if requested.is_err() {
                    c.disconnect().await;
                }
                requested
            },
            self.settings.start_timeout,
        );

        let code_hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                if matches!(e, LoginError::Timeout(_)) {
                    // Whatever the abandoned attempt ends with, close it.
                    disconnect_later(bot_loop.as_ref(), client);
                }
                tracing::warn!(error = %e, "login start failed");
                self.event_log
                    .record(&format!("Login start failed for {phone}: {e}"));
                return Err(e);
            }
        };

        let session = LoginSession::new(id.clone(), phone.clone(), code_hash, Arc::clone(&client));
        if !self.sessions.insert(session) {
            disconnect_later(bot_loop.as_ref(), client);
            return Err(LoginError::Failed("session id collision".into()));
        }
        tracing::info!(session = %id, "login code requested");
        self.event_log
            .record(&format!("Login code requested for {phone}"));
        Ok(id)
    }

    /// Complete a login with the code (and, for 2FA accounts, the password).
    pub fn verify_code(
        &self,
        session_id: &str,
        code: &str,
        password: Option<&str>,
    ) -> Result<LoginOutcome, LoginError> {
        self.sweep_expired();
        let session = self
            .sessions
            .get(session_id)
            .ok_or(LoginError::SessionNotFound)?;

        let client = Arc::clone(&session.client);
        let phone = session.phone.clone();
        let code_hash = session.code_hash.clone();
        let code = code.trim().to_string();
        let password = password
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        drop(session);

        let result = run_on_loop(
            self.bot_loop().as_ref(),
            async move {
                let mut c = client.lock().await;
                complete_sign_in(&mut c, &phone, &code, code_hash.as_deref(), password.as_deref())
                    .await
            },
            self.settings.verify_timeout,
        );

        match result {
            Ok(SignInStep::Authorized {
                identity,
                connected,
            }) => {
                // Exactly one caller gets to remove and publish.
                let session = self
                    .sessions
                    .remove(session_id)
                    .ok_or(LoginError::SessionNotFound)?;
                self.publish(
                    Arc::clone(&session.client),
                    &identity,
                    format!("web_login_{}", session.id),
                    connected,
                );
                tracing::info!(session = %session_id, identity = %identity, "login completed");
                Ok(LoginOutcome::Authorized { identity })
            }
            Ok(SignInStep::PasswordRequired) => {
                tracing::info!(session = %session_id, "two-factor password required");
                Ok(LoginOutcome::PasswordRequired)
            }
            Err(e) if e.retains_session() => {
                tracing::info!(session = %session_id, error = %e, "verification rejected; session kept");
                Err(e)
            }
            Err(e) => {
                if let Some(session) = self.sessions.remove(session_id) {
                    disconnect_later(self.bot_loop().as_ref(), Arc::clone(&session.client));
                }
                tracing::warn!(session = %session_id, error = %e, "login failed; session discarded");
                self.event_log.record(&format!("Login failed: {e}"));
                Err(e)
            }
        }
    }

    /// Startup path: reuse a previously authorized platform session.
    ///
    /// `Ok(None)` when API credentials or the phone are not configured.
    pub fn start_with_stored_credentials(
        &self,
        creds: &StoredCredentials,
    ) -> Result<Option<String>, LoginError> {
        if !self.connector.credentials_configured() || creds.phone.trim().is_empty() {
            tracing::info!("platform credentials not configured; bot auto-start skipped");
            return Ok(None);
        }

        let name = creds.session_name.clone();
        let client = ChatClientHandle::new(&name, self.connector.open(&name)).into_shared();
        let bot_loop = self.bot_loop();
        let op_client = Arc::clone(&client);
        let result = run_on_loop(
            bot_loop.as_ref(),
            async move {
                let mut c = op_client.lock().await;
                c.connect().await?;
                if !c.is_authorized().await {
                    c.disconnect().await;
                    return Err(LoginError::Configuration(
                        "stored session is not authorized; log in from the dashboard".into(),
                    ));
                }
                Ok((c.get_identity().await, c.connection_flag()))
            },
            self.settings.start_timeout,
        );

        match result {
            Ok((identity, connected)) => {
                self.publish(client, &identity, name, connected);
                if let Some(chat) = creds.target_chat {
                    tracing::info!(chat, "target chat configured");
                }
                Ok(Some(identity))
            }
            Err(e) => {
                if matches!(e, LoginError::Timeout(_)) {
                    disconnect_later(bot_loop.as_ref(), client);
                }
                self.event_log.record(&format!("Bot auto-start failed: {e}"));
                Err(e)
            }
        }
    }

    fn publish(
        &self,
        client: SharedClient,
        identity: &str,
        session_name: String,
        connected: Arc<AtomicBool>,
    ) {
        let owning_loop = self.bot_loop();
        let scheduler = match &owning_loop {
            Some(lp) => Scheduler::start(
                lp,
                Arc::clone(&connected),
                self.settings.scheduler_interval,
                Arc::clone(&self.event_log),
            ),
            None => None,
        };
        if scheduler.is_none() {
            tracing::warn!("no running bot loop; scheduler not started");
        }

        let authenticated = Arc::new(AuthenticatedClient {
            client,
            username: identity.to_string(),
            session_name,
            owning_loop,
            connected,
            scheduler: Mutex::new(scheduler),
        });
        if let Some(previous) = self.slot.publish(authenticated) {
            tracing::info!(session = %previous.session_name, "replacing authenticated client");
            previous.retire();
        }

        if identity.is_empty() {
            self.event_log.record("Bot connected");
        } else {
            self.event_log
                .record(&format!("Bot connected as @{identity}"));
        }
    }

    /// Drop expired login sessions and disconnect their clients.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.sessions.take_expired();
        if expired.is_empty() {
            return 0;
        }
        let bot_loop = self.bot_loop();
        for session in &expired {
            tracing::info!(session = %session.id, age_secs = session.age().as_secs(), "login session expired");
            disconnect_later(bot_loop.as_ref(), Arc::clone(&session.client));
        }
        expired.len()
    }

    pub fn pending_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Non-blocking read of the published client.
    pub fn get_authenticated_client(&self) -> Option<Arc<AuthenticatedClient>> {
        self.slot.get()
    }

    pub fn is_connected(&self) -> bool {
        self.slot.get().is_some_and(|c| c.is_connected())
    }

    pub fn current_identity(&self) -> String {
        self.slot
            .get()
            .map(|c| c.current_identity().to_string())
            .unwrap_or_default()
    }

    /// Disconnect every pending and published client. Waits up to
    /// `timeout` on the bot loop.
    pub fn shutdown(&self, timeout: Duration) {
        let mut clients: Vec<SharedClient> = self
            .sessions
            .drain()
            .into_iter()
            .map(|s| Arc::clone(&s.client))
            .collect();
        if let Some(current) = self.slot.take() {
            if let Some(scheduler) = current.scheduler.lock().take() {
                scheduler.stop();
            }
            clients.push(Arc::clone(&current.client));
        }
        if clients.is_empty() {
            return;
        }
        let count = clients.len();
        let result = run_on_loop(
            self.bot_loop().as_ref(),
            async move {
                for client in clients {
                    client.lock().await.disconnect().await;
                }
                Ok(())
            },
            timeout,
        );
        match result {
            Ok(()) => tracing::info!(count, "platform clients disconnected"),
            Err(e) => tracing::warn!(error = %e, "shutdown disconnect incomplete"),
        }
    }
}

fn disconnect_later(bot_loop: Option<&LoopHandle>, client: SharedClient) {
    dispatch(bot_loop, async move {
        client.lock().await.disconnect().await;
    });
}

async fn complete_sign_in(
    c: &mut ChatClientHandle,
    phone: &str,
    code: &str,
    code_hash: Option<&str>,
    password: Option<&str>,
) -> Result<SignInStep, LoginError> {
    // A previous call may have signed in after its caller gave up waiting.
    if !c.is_authorized().await {
        if c.password_pending() {
            match password {
                Some(p) => c.sign_in_with_password(p).await?,
                None => return Ok(SignInStep::PasswordRequired),
            }
        } else {
            match c.sign_in(phone, code, code_hash).await {
                Ok(()) => {}
                Err(LoginError::TwoFactorRequired) => match password {
                    Some(p) => c.sign_in_with_password(p).await?,
                    None => return Ok(SignInStep::PasswordRequired),
                },
                Err(e) => return Err(e),
            }
        }
        if !c.is_authorized().await {
            return Err(LoginError::Failed(
                "the platform did not confirm the authorization".into(),
            ));
        }
    }
    Ok(SignInStep::Authorized {
        identity: c.get_identity().await,
        connected: c.connection_flag(),
    })
}
