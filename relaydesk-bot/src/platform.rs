//! The chat-platform seam.
//!
//! [`Platform`] is one connection to the external chat service, speaking the
//! provider's native vocabulary. [`PlatformConnector`] mints connections.
//! Nothing outside [`crate::client`] calls a `Platform` directly.
//!
//! [`HttpConnector`] is the production provider: it talks JSON to a platform
//! gateway that holds the actual protocol session. Every call is a
//! `POST {gateway}/{method}` answered with an envelope:
//!
//! ```json
//! { "ok": true,  "result": { ... } }
//! { "ok": false, "error_code": 400, "description": "PHONE_CODE_INVALID" }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, RpcError};

/// The account behind an authorized connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Result of asking the platform to send a login code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentCode {
    /// Correlation token some providers require back in `sign_in`.
    #[serde(default)]
    pub phone_code_hash: Option<String>,
}

/// One connection to the chat platform.
///
/// Implementations are driven from a single task at a time; callers
/// serialize access (see [`crate::client::SharedClient`]).
#[async_trait]
pub trait Platform: Send + Sync {
    async fn connect(&mut self) -> Result<(), PlatformError>;
    async fn send_code(&mut self, phone: &str) -> Result<SentCode, PlatformError>;
    async fn sign_in(
        &mut self,
        phone: &str,
        code: &str,
        phone_code_hash: Option<&str>,
    ) -> Result<Me, PlatformError>;
    async fn check_password(&mut self, password: &str) -> Result<Me, PlatformError>;
    async fn is_authorized(&mut self) -> Result<bool, PlatformError>;
    async fn get_me(&mut self) -> Result<Me, PlatformError>;
    async fn disconnect(&mut self) -> Result<(), PlatformError>;
}

/// Creates platform connections.
pub trait PlatformConnector: Send + Sync {
    /// Whether API credentials are present. Without them no connection can
    /// be authorized.
    fn credentials_configured(&self) -> bool;

    /// Open a (not yet connected) client bound to a named platform session.
    fn open(&self, session_name: &str) -> Box<dyn Platform>;
}

// ─── HTTP gateway provider ───────────────────────────────────────────────────

/// API credentials issued by the platform for this application.
#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub api_id: i64,
    pub api_hash: String,
}

impl ApiCredentials {
    pub fn is_configured(&self) -> bool {
        self.api_id != 0 && !self.api_hash.is_empty()
    }
}

/// Connector for [`HttpPlatform`] clients.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    gateway_url: String,
    credentials: ApiCredentials,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(gateway_url: impl Into<String>, credentials: ApiCredentials) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            credentials,
            request_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl PlatformConnector for HttpConnector {
    fn credentials_configured(&self) -> bool {
        self.credentials.is_configured()
    }

    fn open(&self, session_name: &str) -> Box<dyn Platform> {
        Box::new(HttpPlatform::new(
            &self.gateway_url,
            self.credentials.clone(),
            session_name,
            self.request_timeout,
        ))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct CallBody<'a, P: Serialize> {
    api_id: i64,
    api_hash: &'a str,
    session: &'a str,
    #[serde(flatten)]
    params: P,
}

#[derive(Serialize)]
struct NoParams {}

#[derive(Serialize)]
struct PhoneParams<'a> {
    phone: &'a str,
}

#[derive(Serialize)]
struct SignInParams<'a> {
    phone: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_code_hash: Option<&'a str>,
}

#[derive(Serialize)]
struct PasswordParams<'a> {
    password: &'a str,
}

#[derive(Deserialize)]
struct Authorization {
    authorized: bool,
}

/// A platform connection held by the gateway under `session_name`.
pub struct HttpPlatform {
    http: reqwest::Client,
    base: String,
    credentials: ApiCredentials,
    session_name: String,
    connected: bool,
}

impl HttpPlatform {
    pub fn new(
        gateway_url: &str,
        credentials: ApiCredentials,
        session_name: &str,
        request_timeout: Duration,
    ) -> Self {
        // Calls may be driven by different runtimes over the client's life
        // (bot loop or a temporary one), so pooled connections are not kept.
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base: gateway_url.trim_end_matches('/').to_string(),
            credentials,
            session_name: session_name.to_string(),
            connected: false,
        }
    }

    async fn call<P, T>(&self, method: &str, params: P) -> Result<T, PlatformError>
    where
        P: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{method}", self.base);
        let body = CallBody {
            api_id: self.credentials.api_id,
            api_hash: &self.credentials.api_hash,
            session: &self.session_name,
            params,
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        let envelope: Envelope<T> = resp.json().await.map_err(|e| {
            PlatformError::Protocol(format!("{method}: bad response ({status}): {e}"))
        })?;
        if envelope.ok {
            envelope
                .result
                .ok_or_else(|| PlatformError::Protocol(format!("{method}: missing result")))
        } else {
            let code = envelope.error_code.unwrap_or(i32::from(status.as_u16()));
            let name = envelope
                .description
                .unwrap_or_else(|| "UNKNOWN_ERROR".to_string());
            Err(PlatformError::Rpc(RpcError::new(code, name)))
        }
    }

    fn ensure_connected(&self) -> Result<(), PlatformError> {
        if self.connected {
            Ok(())
        } else {
            Err(PlatformError::NotConnected)
        }
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn connect(&mut self) -> Result<(), PlatformError> {
        let _: serde_json::Value = self.call("connect", NoParams {}).await?;
        self.connected = true;
        tracing::debug!(session = %self.session_name, "platform connected");
        Ok(())
    }

    async fn send_code(&mut self, phone: &str) -> Result<SentCode, PlatformError> {
        self.ensure_connected()?;
        self.call("sendCode", PhoneParams { phone }).await
    }

    async fn sign_in(
        &mut self,
        phone: &str,
        code: &str,
        phone_code_hash: Option<&str>,
    ) -> Result<Me, PlatformError> {
        self.ensure_connected()?;
        self.call(
            "signIn",
            SignInParams {
                phone,
                code,
                phone_code_hash,
            },
        )
        .await
    }

    async fn check_password(&mut self, password: &str) -> Result<Me, PlatformError> {
        self.ensure_connected()?;
        self.call("checkPassword", PasswordParams { password }).await
    }

    async fn is_authorized(&mut self) -> Result<bool, PlatformError> {
        self.ensure_connected()?;
        let auth: Authorization = self.call("isAuthorized", NoParams {}).await?;
        Ok(auth.authorized)
    }

    async fn get_me(&mut self) -> Result<Me, PlatformError> {
        self.ensure_connected()?;
        self.call("getMe", NoParams {}).await
    }

    async fn disconnect(&mut self) -> Result<(), PlatformError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let _: serde_json::Value = self.call("disconnect", NoParams {}).await?;
        Ok(())
    }
}
