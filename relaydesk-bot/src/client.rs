//! ChatClientHandle: one platform connection, decoded into [`LoginError`].
//!
//! Every method suspends on network I/O and must be driven from the task
//! that owns the handle on the bot event loop. Share it between threads only
//! as a [`SharedClient`]; the async mutex keeps operations on one handle
//! strictly sequential.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{LoginError, PlatformError};
use crate::platform::Platform;

/// A client handle shared between the session store, the bot loop and,
/// after login, the process-wide authenticated slot.
pub type SharedClient = Arc<tokio::sync::Mutex<ChatClientHandle>>;

/// Thin wrapper around one [`Platform`] connection.
pub struct ChatClientHandle {
    platform: Option<Box<dyn Platform>>,
    session_name: String,
    connected: Arc<AtomicBool>,
    /// Set when sign-in answered with a password challenge.
    password_pending: bool,
}

impl ChatClientHandle {
    pub fn new(session_name: impl Into<String>, platform: Box<dyn Platform>) -> Self {
        Self {
            platform: Some(platform),
            session_name: session_name.into(),
            connected: Arc::new(AtomicBool::new(false)),
            password_pending: false,
        }
    }

    pub fn into_shared(self) -> SharedClient {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Connection flag readable without taking the client lock.
    pub fn connection_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the platform is waiting for a two-factor password.
    pub fn password_pending(&self) -> bool {
        self.password_pending
    }

    fn platform(&mut self) -> Result<&mut Box<dyn Platform>, LoginError> {
        self.platform
            .as_mut()
            .ok_or_else(|| LoginError::Failed("client has been torn down".into()))
    }

    pub async fn connect(&mut self) -> Result<(), LoginError> {
        let result = self.platform()?.connect().await;
        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(LoginError::Connection(e.to_string())),
        }
    }

    /// Ask the platform to send a login code. Returns the code hash, if the
    /// provider issued one.
    pub async fn request_code(&mut self, phone: &str) -> Result<Option<String>, LoginError> {
        let sent = self
            .platform()?
            .send_code(phone)
            .await
            .map_err(|e| match e {
                PlatformError::Io(_) | PlatformError::NotConnected => {
                    LoginError::Connection(e.to_string())
                }
                other => LoginError::Failed(format!("could not send code: {other}")),
            })?;
        self.password_pending = false;
        Ok(sent.phone_code_hash)
    }

    pub async fn sign_in(
        &mut self,
        phone: &str,
        code: &str,
        code_hash: Option<&str>,
    ) -> Result<(), LoginError> {
        let result = self.platform()?.sign_in(phone, code, code_hash).await;
        match result {
            Ok(_) => {
                self.password_pending = false;
                Ok(())
            }
            Err(e) if e.is("SESSION_PASSWORD_NEEDED") => {
                self.password_pending = true;
                Err(LoginError::TwoFactorRequired)
            }
            Err(e) => Err(classify_sign_in(e)),
        }
    }

    pub async fn sign_in_with_password(&mut self, password: &str) -> Result<(), LoginError> {
        let result = self.platform()?.check_password(password).await;
        match result {
            Ok(_) => {
                self.password_pending = false;
                Ok(())
            }
            Err(e) if e.is("PASSWORD_*") => Err(LoginError::InvalidCredentials),
            Err(e @ (PlatformError::Io(_) | PlatformError::NotConnected)) => {
                Err(LoginError::Connection(e.to_string()))
            }
            Err(e) => Err(LoginError::Failed(format!("password check failed: {e}"))),
        }
    }

    /// Never fails; platform errors read as "not authorized".
    pub async fn is_authorized(&mut self) -> bool {
        let Some(platform) = self.platform.as_mut() else {
            return false;
        };
        match platform.is_authorized().await {
            Ok(authorized) => authorized,
            Err(e) => {
                tracing::debug!(session = %self.session_name, error = %e, "authorization check failed");
                false
            }
        }
    }

    /// Lower-cased username of the signed-in account, or empty.
    pub async fn get_identity(&mut self) -> String {
        let Some(platform) = self.platform.as_mut() else {
            return String::new();
        };
        match platform.get_me().await {
            Ok(me) => me.username.map(|u| u.to_lowercase()).unwrap_or_default(),
            Err(e) => {
                tracing::debug!(session = %self.session_name, error = %e, "could not resolve identity");
                String::new()
            }
        }
    }

    /// Best-effort teardown; failures are logged, never returned.
    pub async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.password_pending = false;
        let Some(platform) = self.platform.as_mut() else {
            return;
        };
        if let Err(e) = platform.disconnect().await {
            tracing::warn!(session = %self.session_name, error = %e, "disconnect failed");
        }
    }
}

fn classify_sign_in(e: PlatformError) -> LoginError {
    if e.is("PHONE_CODE_EXPIRED") {
        LoginError::CodeExpired
    } else if e.is("PHONE_CODE_*") {
        LoginError::InvalidCode
    } else {
        match e {
            PlatformError::Io(_) | PlatformError::NotConnected => {
                LoginError::Connection(e.to_string())
            }
            other => LoginError::Failed(format!("sign-in failed: {other}")),
        }
    }
}

impl Drop for ChatClientHandle {
    fn drop(&mut self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(mut platform) = self.platform.take() else {
            return;
        };
        let session = std::mem::take(&mut self.session_name);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = platform.disconnect().await {
                        tracing::debug!(%session, error = %e, "disconnect on drop failed");
                    }
                });
            }
            Err(_) => {
                tracing::debug!(%session, "client dropped outside a runtime; connection left to the platform");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;

    fn rpc(name: &str) -> PlatformError {
        PlatformError::Rpc(RpcError::new(400, name))
    }

    #[test]
    fn sign_in_errors_are_decoded() {
        assert_eq!(classify_sign_in(rpc("PHONE_CODE_INVALID")), LoginError::InvalidCode);
        assert_eq!(classify_sign_in(rpc("PHONE_CODE_EMPTY")), LoginError::InvalidCode);
        assert_eq!(classify_sign_in(rpc("PHONE_CODE_EXPIRED")), LoginError::CodeExpired);
        assert!(matches!(
            classify_sign_in(PlatformError::Io("reset".into())),
            LoginError::Connection(_)
        ));
        assert!(matches!(
            classify_sign_in(rpc("PHONE_NUMBER_BANNED")),
            LoginError::Failed(_)
        ));
    }
}
