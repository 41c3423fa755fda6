//! In-process platform double.
//!
//! [`ScriptedNetwork`] plays the chat platform: it knows a set of accounts
//! (phone, expected code, optional two-factor password, username), issues
//! code hashes, remembers which named sessions are authorized and counts
//! connects/disconnects. Latency and failures can be injected so the bridge
//! and orchestrator can be exercised without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{PlatformError, RpcError};
use crate::platform::{Me, Platform, PlatformConnector, SentCode};

/// One account known to the scripted platform.
#[derive(Debug, Clone)]
pub struct ScriptedAccount {
    pub id: i64,
    pub code: String,
    pub password: Option<String>,
    pub username: Option<String>,
}

impl ScriptedAccount {
    pub fn new(id: i64, code: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            password: None,
            username: None,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    fn me(&self) -> Me {
        Me {
            id: self.id,
            username: self.username.clone(),
            first_name: None,
        }
    }
}

#[derive(Default)]
struct NetworkState {
    accounts: HashMap<String, ScriptedAccount>,
    /// Latest code hash issued per phone.
    code_hashes: HashMap<String, String>,
    /// Session name → phone, for sessions that completed sign-in.
    authorized: HashMap<String, String>,
}

/// Shared state of the scripted platform.
#[derive(Default)]
pub struct ScriptedNetwork {
    state: Mutex<NetworkState>,
    latency: Mutex<Duration>,
    sign_in_stall: Mutex<Option<Duration>>,
    offline: AtomicBool,
    codes_expired: AtomicBool,
    hash_counter: AtomicU64,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub codes_sent: AtomicUsize,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_account(&self, phone: &str, account: ScriptedAccount) {
        self.state.lock().accounts.insert(phone.to_string(), account);
    }

    /// Forget an account; later calls for its phone fail as unoccupied.
    pub fn remove_account(&self, phone: &str) {
        self.state.lock().accounts.remove(phone);
    }

    /// Mark a named session as already authorized (a persisted login).
    pub fn authorize_session(&self, session_name: &str, phone: &str) {
        self.state
            .lock()
            .authorized
            .insert(session_name.to_string(), phone.to_string());
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Extra delay applied to sign-in calls only.
    pub fn stall_sign_in(&self, stall: Option<Duration>) {
        *self.sign_in_stall.lock() = stall;
    }

    /// While offline, `connect` fails with an I/O error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While set, every issued code is reported as expired.
    pub fn expire_codes(&self, expired: bool) {
        self.codes_expired.store(expired, Ordering::SeqCst);
    }

    pub fn is_session_authorized(&self, session_name: &str) -> bool {
        self.state.lock().authorized.contains_key(session_name)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Connector handing out [`ScriptedPlatform`] clients.
#[derive(Clone)]
pub struct ScriptedConnector {
    network: Arc<ScriptedNetwork>,
    configured: bool,
}

impl ScriptedConnector {
    pub fn new(network: Arc<ScriptedNetwork>) -> Self {
        Self {
            network,
            configured: true,
        }
    }

    /// A connector that reports missing API credentials.
    pub fn unconfigured(network: Arc<ScriptedNetwork>) -> Self {
        Self {
            network,
            configured: false,
        }
    }
}

impl PlatformConnector for ScriptedConnector {
    fn credentials_configured(&self) -> bool {
        self.configured
    }

    fn open(&self, session_name: &str) -> Box<dyn Platform> {
        Box::new(ScriptedPlatform {
            network: Arc::clone(&self.network),
            session_name: session_name.to_string(),
            connected: false,
            password_phone: None,
        })
    }
}

/// One scripted connection.
pub struct ScriptedPlatform {
    network: Arc<ScriptedNetwork>,
    session_name: String,
    connected: bool,
    /// Phone whose sign-in is waiting for the two-factor password.
    password_phone: Option<String>,
}

fn rpc(name: &str) -> PlatformError {
    PlatformError::Rpc(RpcError::new(400, name))
}

impl ScriptedPlatform {
    fn ensure_connected(&self) -> Result<(), PlatformError> {
        if self.connected {
            Ok(())
        } else {
            Err(PlatformError::NotConnected)
        }
    }

    fn authorize(&self, phone: &str) -> Result<Me, PlatformError> {
        let mut state = self.network.state.lock();
        let me = state
            .accounts
            .get(phone)
            .map(ScriptedAccount::me)
            .ok_or_else(|| rpc("PHONE_NUMBER_UNOCCUPIED"))?;
        state
            .authorized
            .insert(self.session_name.clone(), phone.to_string());
        Ok(me)
    }
}

#[async_trait]
impl Platform for ScriptedPlatform {
    async fn connect(&mut self) -> Result<(), PlatformError> {
        self.network.delay().await;
        if self.network.offline.load(Ordering::SeqCst) {
            return Err(PlatformError::Io("connection refused".into()));
        }
        self.network.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn send_code(&mut self, phone: &str) -> Result<SentCode, PlatformError> {
        self.network.delay().await;
        self.ensure_connected()?;
        let mut state = self.network.state.lock();
        if !state.accounts.contains_key(phone) {
            return Err(rpc("PHONE_NUMBER_INVALID"));
        }
        let n = self.network.hash_counter.fetch_add(1, Ordering::SeqCst);
        let hash = format!("hash-{n}");
        state.code_hashes.insert(phone.to_string(), hash.clone());
        self.network.codes_sent.fetch_add(1, Ordering::SeqCst);
        Ok(SentCode {
            phone_code_hash: Some(hash),
        })
    }

    async fn sign_in(
        &mut self,
        phone: &str,
        code: &str,
        phone_code_hash: Option<&str>,
    ) -> Result<Me, PlatformError> {
        self.network.delay().await;
        let stall = *self.network.sign_in_stall.lock();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        self.ensure_connected()?;
        if code.is_empty() {
            return Err(rpc("PHONE_CODE_EMPTY"));
        }
        let (expected, password) = {
            let state = self.network.state.lock();
            let account = state
                .accounts
                .get(phone)
                .ok_or_else(|| rpc("PHONE_NUMBER_UNOCCUPIED"))?;
            if let (Some(given), Some(issued)) = (phone_code_hash, state.code_hashes.get(phone)) {
                if given != issued {
                    return Err(rpc("PHONE_CODE_HASH_EMPTY"));
                }
            }
            (account.code.clone(), account.password.clone())
        };
        if self.network.codes_expired.load(Ordering::SeqCst) {
            return Err(rpc("PHONE_CODE_EXPIRED"));
        }
        if code != expected {
            return Err(rpc("PHONE_CODE_INVALID"));
        }
        if password.is_some() {
            self.password_phone = Some(phone.to_string());
            return Err(PlatformError::Rpc(RpcError::new(401, "SESSION_PASSWORD_NEEDED")));
        }
        self.authorize(phone)
    }

    async fn check_password(&mut self, password: &str) -> Result<Me, PlatformError> {
        self.network.delay().await;
        self.ensure_connected()?;
        let phone = self
            .password_phone
            .clone()
            .ok_or_else(|| rpc("PASSWORD_REQUIRED_FIRST"))?;
        let expected = {
            let state = self.network.state.lock();
            state.accounts.get(&phone).and_then(|a| a.password.clone())
        };
        if expected.as_deref() != Some(password) {
            return Err(rpc("PASSWORD_HASH_INVALID"));
        }
        self.password_phone = None;
        self.authorize(&phone)
    }

    async fn is_authorized(&mut self) -> Result<bool, PlatformError> {
        self.ensure_connected()?;
        Ok(self.network.is_session_authorized(&self.session_name))
    }

    async fn get_me(&mut self) -> Result<Me, PlatformError> {
        self.network.delay().await;
        self.ensure_connected()?;
        let state = self.network.state.lock();
        state
            .authorized
            .get(&self.session_name)
            .and_then(|phone| state.accounts.get(phone))
            .map(ScriptedAccount::me)
            .ok_or_else(|| PlatformError::Rpc(RpcError::new(401, "AUTH_KEY_UNREGISTERED")))
    }

    async fn disconnect(&mut self) -> Result<(), PlatformError> {
        if self.connected {
            self.connected = false;
            self.network.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
